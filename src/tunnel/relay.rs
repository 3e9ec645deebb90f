//! Tunnel relay — shared state and router.
//!
//! The relay:
//! 1. Accepts device WebSocket connections on any path of the listener
//! 2. Serves the tunnel listing page at `GET /`
//! 3. Relays `ANY /{identifier}/{*path}` to the registered device

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{any, get},
    Router,
};

use super::correlation::CorrelationEngine;
use super::registry::TunnelRegistry;
use crate::config::Config;
use crate::routes;

/// State shared across all relay handlers.
#[derive(Clone)]
pub struct RelayState {
    /// Connected devices keyed by tunnel identifier.
    pub registry: TunnelRegistry,
    pub engine: Arc<CorrelationEngine>,
    /// Largest inbound body relayed to a device.
    pub max_body_bytes: usize,
    /// Outbound frames buffered per device connection.
    pub channel_buffer: usize,
}

impl RelayState {
    pub fn new(request_timeout: Duration, max_body_bytes: usize, channel_buffer: usize) -> Self {
        Self {
            registry: TunnelRegistry::new(),
            engine: Arc::new(CorrelationEngine::new(request_timeout)),
            max_body_bytes,
            channel_buffer,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.tunnel.request_timeout(),
            config.server.max_body_bytes,
            config.tunnel.channel_buffer,
        )
    }
}

/// Build the relay router with all tunnel endpoints.
pub fn relay_router(relay_state: RelayState) -> Router {
    Router::new()
        .route("/", get(routes::index::index))
        .route("/{id}", any(routes::proxy::proxy))
        .route("/{id}/", any(routes::proxy::proxy))
        .route("/{id}/{*rest}", any(routes::proxy::proxy))
        .with_state(relay_state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::tunnel::registry::DeviceChannel;

    fn state() -> RelayState {
        RelayState::new(Duration::from_secs(5), 16, 8)
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unknown_identifier_is_bad_gateway() {
        let response = relay_router(state())
            .oneshot(Request::get("/dev2/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_text(response).await, "client not connected");
    }

    #[tokio::test]
    async fn closed_channel_is_bad_gateway_without_dispatch() {
        let state = state();
        let (tx, _rx) = mpsc::channel(8);
        let channel = DeviceChannel::new(tx);
        state.registry.put("dev1", channel.clone());
        channel.close();

        let response = relay_router(state)
            .oneshot(Request::get("/dev1/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn index_lists_identifiers() {
        let state = state();
        let (tx, _rx) = mpsc::channel(8);
        state.registry.put("dev1", DeviceChannel::new(tx));

        let response = relay_router(state)
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains(r#"href="/dev1/""#));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let state = state();
        let (tx, _rx) = mpsc::channel(8);
        state.registry.put("dev1", DeviceChannel::new(tx));

        let response = relay_router(state)
            .oneshot(
                Request::post("/dev1/upload")
                    .body(Body::from(vec![b'x'; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
