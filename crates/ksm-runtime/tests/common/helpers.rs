// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use ksm_runtime::options::Options;
use ksm_runtime::server::BoundAddrs;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// Options listening on ephemeral loopback ports
pub fn local_options() -> Options {
    Options {
        host: "127.0.0.1".to_string(),
        port: 0,
        telemetry_host: "127.0.0.1".to_string(),
        telemetry_port: 0,
        ..Default::default()
    }
}

/// Wait until a lifecycle has bound its servers
pub async fn wait_bound(bound: &mut watch::Receiver<Option<BoundAddrs>>) -> BoundAddrs {
    let addrs = timeout(Duration::from_secs(2), bound.wait_for(Option::is_some))
        .await
        .expect("servers were not bound in time")
        .expect("lifecycle dropped");
    addrs.expect("bound addresses missing")
}

/// Send a GET request and return the status and body
pub async fn get(
    addr: SocketAddr,
    path: &str,
) -> Result<(StatusCode, String), Box<dyn std::error::Error + Send + Sync>> {
    let stream = timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(addr)).await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri(path)
        .method("GET")
        .header("Host", addr.to_string())
        .body(Empty::<Bytes>::new())?;
    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();

    Ok((status, String::from_utf8(body.to_vec())?))
}
