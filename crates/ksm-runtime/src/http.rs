// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request routing and response helpers shared by the HTTP service actors.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{header, Request, Response, StatusCode};
use tracing::error;

pub type Body = Full<Bytes>;
pub type HttpResponse = Response<Body>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HttpResponse> + Send + 'static>>;
pub type Handler = Arc<dyn Fn(Request<Incoming>) -> HandlerFuture + Send + Sync + 'static>;

pub const METRICS_PATH: &str = "/metrics";
pub const HEALTHZ_PATH: &str = "/healthz";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Exact-path request router.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F, Fut>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HttpResponse> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req| -> HandlerFuture { Box::pin(handler(req)) });
        self.routes.insert(path.to_string(), handler);
        self
    }

    /// Dispatch `req` to the handler registered for its path.
    pub async fn handle(&self, req: Request<Incoming>) -> Result<HttpResponse, Infallible> {
        match self.routes.get(req.uri().path()) {
            Some(handler) => Ok(handler(req).await),
            None => Ok(not_found()),
        }
    }
}

pub fn text_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    match Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Full::new(body.into()))
    {
        Ok(response) => response,
        Err(e) => {
            error!("failed to build response: {e}");
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

pub fn not_found() -> HttpResponse {
    text_response(StatusCode::NOT_FOUND, TEXT_PLAIN, "Not Found")
}

/// `200 OK` with the canonical reason as body.
pub fn healthz() -> HttpResponse {
    text_response(StatusCode::OK, TEXT_PLAIN, "OK")
}

pub fn metrics_response(body: String) -> HttpResponse {
    text_response(StatusCode::OK, PROMETHEUS_TEXT, body)
}

/// A link rendered on a landing page.
#[derive(Debug, Clone)]
pub struct LandingLink {
    pub address: &'static str,
    pub text: &'static str,
}

/// Index page listing the endpoints of a server.
#[derive(Debug, Clone)]
pub struct LandingPage {
    pub name: &'static str,
    pub description: &'static str,
    pub version: String,
    pub links: Vec<LandingLink>,
}

impl LandingPage {
    pub fn render(&self) -> String {
        let links = self
            .links
            .iter()
            .map(|link| format!("<li><a href=\"{}\">{}</a></li>", link.address, link.text))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{name}</title></head>\n<body>\n<h1>{name}</h1>\n<p>{description}</p>\n<ul>\n{links}\n</ul>\n<p>version: {version}</p>\n</body>\n</html>\n",
            name = self.name,
            description = self.description,
            version = self.version,
        )
    }

    pub fn response(&self) -> HttpResponse {
        text_response(StatusCode::OK, "text/html; charset=utf-8", self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_landing_page_lists_links() {
        let page = LandingPage {
            name: "kube-state-metrics",
            description: "Metrics for Kubernetes' state",
            version: "0.1.0".to_string(),
            links: vec![
                LandingLink {
                    address: METRICS_PATH,
                    text: "Metrics",
                },
                LandingLink {
                    address: HEALTHZ_PATH,
                    text: "Healthz",
                },
            ],
        };
        let html = page.render();
        assert!(html.contains("<a href=\"/metrics\">Metrics</a>"));
        assert!(html.contains("<a href=\"/healthz\">Healthz</a>"));
        assert!(html.contains("version: 0.1.0"));
    }

    #[test]
    fn test_healthz_response() {
        let response = healthz();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            TEXT_PLAIN
        );
    }
}
