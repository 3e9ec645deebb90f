//! Inbound request gateway.
//!
//! `ANY /{identifier}` and `ANY /{identifier}/{*path}` are encapsulated and
//! relayed to the device registered under `identifier`. The forwarded path
//! is the remainder after the identifier, normalized to begin and end with
//! `/`. Unknown or closed tunnels get 502 without anything being dispatched.

use axum::{
    body::Body,
    extract::{Path as AxumPath, Request, State},
    http::{request::Parts, HeaderMap},
    response::{IntoResponse, Response},
};
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::info;

use crate::error::RelayError;
use crate::tunnel::channel;
use crate::tunnel::correlation::{render_response, ProxiedRequest};
use crate::tunnel::registry::DeviceChannel;
use crate::tunnel::relay::RelayState;

/// Path parameters of a tunnelled request.
#[derive(Debug, Deserialize)]
pub struct TunnelPath {
    pub id: String,
    #[serde(default)]
    pub rest: Option<String>,
}

/// `ANY /{id}/{*rest}` — relay to the device, or accept a device upgrade.
pub async fn proxy(
    State(state): State<RelayState>,
    AxumPath(target): AxumPath<TunnelPath>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    if channel::is_websocket_upgrade(&parts.headers) {
        return channel::upgrade(state, parts).await;
    }
    match relay(&state, &target, parts, body).await {
        Ok(response) => response,
        Err(e) => {
            info!(tunnel = %target.id, status = e.status().as_u16(), "Tunnel request failed: {e}");
            e.into_response()
        }
    }
}

async fn relay(
    state: &RelayState,
    target: &TunnelPath,
    parts: Parts,
    body: Body,
) -> Result<Response, RelayError> {
    let path = forwarded_path(target.rest.as_deref().unwrap_or_default());
    info!(tunnel = %target.id, method = %parts.method, path = %path, "Tunnel request");

    let channel = state
        .registry
        .get(&target.id)
        .filter(DeviceChannel::is_open)
        .ok_or(RelayError::TunnelUnavailable)?;

    let bytes = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| {
            let inner = e.into_inner();
            if inner.is::<http_body_util::LengthLimitError>() {
                RelayError::BodyTooLarge
            } else {
                RelayError::RequestBody(inner.to_string())
            }
        })?;

    let request = ProxiedRequest {
        method: parts.method.to_string(),
        path,
        headers: flatten_headers(&parts.headers),
        body: String::from_utf8_lossy(&bytes).into_owned(),
    };
    let response = state.engine.dispatch(&channel, request).await?;
    render_response(response)
}

/// Join the segments after the identifier into `/a/b/`; no segments gives `/`.
pub fn forwarded_path(rest: &str) -> String {
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", segments.join("/"))
    }
}

/// Lowercase header names in arrival order; repeated headers joined by `", "`.
pub fn flatten_headers(headers: &HeaderMap) -> IndexMap<String, String> {
    let mut flat: IndexMap<String, String> = IndexMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        match flat.entry(name.as_str().to_string()) {
            indexmap::map::Entry::Occupied(mut entry) => {
                let joined = entry.get_mut();
                joined.push_str(", ");
                joined.push_str(&value);
            }
            indexmap::map::Entry::Vacant(entry) => {
                entry.insert(value.into_owned());
            }
        }
    }
    flat
}
