// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::future::Future;
use std::io;
use std::process;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ksm_runtime::{CancelReason, KubeStateMetrics, LifecycleControl, Options, RestartSupervisor};

#[tokio::main]
pub async fn main() {
    let options = Options::parse();

    let env_filter = format!("h2=off,hyper=off,{}", options.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = options.validate() {
        error!("{e}");
        process::exit(1);
    }

    let supervisor = RestartSupervisor::new(KubeStateMetrics::new(options));

    let control = LifecycleControl::new();
    match forward_signals(control.clone()) {
        Ok(signals) => {
            tokio::spawn(signals);
        }
        Err(e) => {
            error!("Failed to install signal handlers: {e}");
            process::exit(1);
        }
    }

    if let Err(e) = supervisor.run_until_terminated(&control).await {
        error!("{e}");
        process::exit(1);
    }
    info!("Exiting kube-state-metrics");
}

/// SIGINT and SIGTERM terminate the process, SIGHUP starts a new lifecycle.
///
/// The listeners are installed once and forward every signal for the rest of
/// the process, whichever lifecycle is running.
#[cfg(unix)]
fn forward_signals(control: LifecycleControl) -> io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(async move {
        loop {
            let reason = tokio::select! {
                Some(()) = interrupt.recv() => CancelReason::Terminate,
                Some(()) = terminate.recv() => CancelReason::Terminate,
                Some(()) = hangup.recv() => CancelReason::Reload,
                else => break,
            };
            info!("Received signal, cancelling lifecycle: {:?}", reason);
            control.cancel(reason);
        }
    })
}

#[cfg(not(unix))]
fn forward_signals(control: LifecycleControl) -> io::Result<impl Future<Output = ()>> {
    Ok(async move {
        loop {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received interrupt, cancelling lifecycle");
                    control.cancel(CancelReason::Terminate);
                }
                Err(e) => {
                    error!("Failed to listen for interrupt: {e}");
                    break;
                }
            }
        }
    })
}
