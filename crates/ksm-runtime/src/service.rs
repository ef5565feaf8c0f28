// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP service actor.
//!
//! Adapts a hyper listen-and-serve loop to the actor contract: `run` serves
//! until the actor token is cancelled, then stops accepting, asks every open
//! connection to finish its in-flight request and waits at most
//! `shutdown_timeout` for them. Connections still busy after that are
//! abandoned. Stopping because of our own interrupt is reported as
//! [`ServeOutcome::Closed`], never as an error.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor_group::ActorGroup;
use crate::error::RunError;
use crate::http::Router;

/// Grace period given to in-flight requests on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// How a server stopped after being interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The listener closed. `abandoned` counts the connections still busy
    /// when the grace period elapsed.
    Closed { abandoned: usize },
}

/// An HTTP server bound to its listener, ready to be run as an actor.
pub struct HttpServer {
    name: String,
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Arc<Router>,
    shutdown_timeout: Duration,
}

impl HttpServer {
    /// Bind `addr`. Failing to bind is a fatal startup error.
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        router: Router,
    ) -> Result<Self, RunError> {
        let name = name.into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RunError::Bind {
                name: name.clone(),
                addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RunError::Bind {
            name: name.clone(),
            addr,
            source,
        })?;

        Ok(Self {
            name,
            listener,
            local_addr,
            router: Arc::new(router),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register this server in `group`; the actor's interrupt cancels `token`.
    pub fn register(self, group: &mut ActorGroup, token: CancellationToken) {
        let name = self.name.clone();
        group.add_cancellable(name, token.clone(), async move {
            self.serve(token).await?;
            Ok(())
        });
    }

    /// Serve until `token` is cancelled.
    pub async fn serve(self, token: CancellationToken) -> io::Result<ServeOutcome> {
        let Self {
            name,
            listener,
            local_addr,
            router,
            shutdown_timeout,
        } = self;

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(READ_HEADER_TIMEOUT);
        let service = service_fn(move |req| {
            let router = Arc::clone(&router);
            async move { router.handle(req).await }
        });
        let mut connections = JoinSet::new();

        info!("Started {} server on {}", name, local_addr);

        loop {
            let stream = tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("{} server error: {e}", name);
                        return Err(e);
                    }
                    Ok((stream, _)) => stream,
                },
                finished = async {
                    match connections.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("{} connection handler panicked: {:?}", name, e);
                        }
                    }
                    continue;
                },
            };

            let io = TokioIo::new(stream);
            let builder = builder.clone();
            let service = service.clone();
            let shutdown = token.clone();
            connections.spawn(async move {
                let mut conn = std::pin::pin!(builder.serve_connection(io, service));
                let mut draining = false;
                loop {
                    tokio::select! {
                        res = conn.as_mut() => {
                            if let Err(e) = res {
                                debug!("Connection error: {e}");
                            }
                            break;
                        }
                        () = shutdown.cancelled(), if !draining => {
                            draining = true;
                            conn.as_mut().graceful_shutdown();
                        }
                    }
                }
            });
        }

        drop(listener);
        info!(
            "Shutting down {} server, draining {} connections",
            name,
            connections.len()
        );

        let drained = timeout(shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => {
                debug!("{} server closed", name);
                Ok(ServeOutcome::Closed { abandoned: 0 })
            }
            Err(_) => {
                let abandoned = connections.len();
                warn!(
                    "{} server did not drain within {:?}, abandoning {} connections",
                    name, shutdown_timeout, abandoned
                );
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                Ok(ServeOutcome::Closed { abandoned })
            }
        }
    }
}
