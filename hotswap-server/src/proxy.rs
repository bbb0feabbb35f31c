//! Reverse proxy
//!
//! Forwards every request on the proxy listener to the current default
//! upstream. The default is read per request, so a promotion takes effect
//! for the next request without touching requests already in flight.

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{self, HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::service::UpstreamRegistry;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
struct ProxyState {
    registry: Arc<UpstreamRegistry>,
    client: reqwest::Client,
}

/// Create the proxy listener router
pub fn create_proxy_router(registry: Arc<UpstreamRegistry>) -> anyhow::Result<Router> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .context("failed to build proxy HTTP client")?;

    Ok(Router::new()
        .fallback(forward)
        .with_state(ProxyState { registry, client })
        .layer(TraceLayer::new_for_http()))
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in HOP_BY_HOP {
        forwarded.remove(name);
    }
    forwarded
}

async fn forward(State(state): State<ProxyState>, request: Request) -> Response {
    let Some(address) = state.registry.default_address() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no upstream available").into_response();
    };

    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://{}{}", address, path);
    debug!("Forwarding {} {} to {}", parts.method, path, url);

    let mut headers = forwardable(&parts.headers);
    headers.remove(header::HOST);

    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Upstream {} failed: {}", address, e);
            return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
        }
    };

    let mut builder = http::Response::builder().status(upstream.status());
    if let Some(headers) = builder.headers_mut() {
        *headers = forwardable(upstream.headers());
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            warn!("Invalid upstream response from {}: {}", address, e);
            (StatusCode::BAD_GATEWAY, "invalid upstream response").into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::service::{Instance, ProcessHandle};
    use axum::routing::{get, post};
    use hotswap_core::domain::upstream::RegistryKey;
    use tokio::net::TcpListener;

    /// Starts a backend answering `GET /` with `reply`; returns its port
    async fn spawn_backend(reply: &'static str) -> u16 {
        let app = Router::new()
            .route("/", get(move || async move { reply }))
            .route("/echo", post(|body: String| async move { body }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn spawn_proxy(registry: Arc<UpstreamRegistry>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_proxy_router(registry).unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn registry() -> Arc<UpstreamRegistry> {
        Arc::new(UpstreamRegistry::new(PortRange::new(1, 65535)))
    }

    #[tokio::test]
    async fn test_no_default_is_unavailable() {
        let proxy = spawn_proxy(registry()).await;
        let response = reqwest::get(&proxy).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_follows_default() {
        let registry = registry();
        let proxy = spawn_proxy(registry.clone()).await;

        let old = spawn_backend("old").await;
        let new = spawn_backend("new").await;
        registry
            .register("svc-old", "v1", Instance::new("127.0.0.1", old, ProcessHandle::default()), true)
            .unwrap();
        assert_eq!(reqwest::get(&proxy).await.unwrap().text().await.unwrap(), "old");

        registry
            .register("svc-new", "v1", Instance::new("127.0.0.1", new, ProcessHandle::default()), false)
            .unwrap();
        registry
            .set_default(&RegistryKey::new("svc-new", "v1"))
            .unwrap();
        assert_eq!(reqwest::get(&proxy).await.unwrap().text().await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_forwards_body() {
        let registry = registry();
        let port = spawn_backend("unused").await;
        registry
            .register("svc", "v1", Instance::new("127.0.0.1", port, ProcessHandle::default()), true)
            .unwrap();
        let proxy = spawn_proxy(registry).await;

        let response = reqwest::Client::new()
            .post(format!("{}/echo", proxy))
            .body("payload")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_dead_upstream_is_bad_gateway() {
        let registry = registry();
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        registry
            .register("svc", "v1", Instance::new("127.0.0.1", port, ProcessHandle::default()), true)
            .unwrap();
        let proxy = spawn_proxy(registry).await;

        let response = reqwest::get(&proxy).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_hop_by_hop_headers_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());

        let forwarded = forwardable(&headers);
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded.contains_key(header::CONTENT_TYPE));
    }
}
