//! Correlation engine — matches device responses to in-flight requests.
//!
//! A device channel is a single stream shared by every concurrent request
//! for that device, so each request gets an unguessable id that is the only
//! demultiplexing key. The channel's [`PendingTable`](super::registry::PendingTable)
//! maps ids to oneshot senders; removing an entry is what resolves it, so
//! exactly one of {response, deadline, caller gone} wins and the others
//! become no-ops.

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::envelope::{Envelope, RequestEnvelope, ResponseEnvelope};
use super::registry::DeviceChannel;
use crate::error::RelayError;

/// Default deadline for a device to answer a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// An inbound HTTP request, already split into the parts the device sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedRequest {
    pub method: String,
    pub path: String,
    pub headers: IndexMap<String, String>,
    pub body: String,
}

/// What happened to a response handed to [`CorrelationEngine::intake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    /// Matched an active request and was delivered to its caller.
    Delivered,
    /// Unknown, already resolved, timed out, or the caller left.
    Stale,
}

#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    timeout: Duration,
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl CorrelationEngine {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` to the device on `channel` and wait for its reply.
    ///
    /// Resolves with the device's response, [`RelayError::TunnelTimeout`]
    /// once the deadline passes (whether the frame is still waiting for queue
    /// space or already sent), or [`RelayError::TunnelUnavailable`] if the
    /// connection is gone. The pending entry is removed on every path,
    /// including the caller dropping this future.
    pub async fn dispatch(
        &self,
        channel: &DeviceChannel,
        request: ProxiedRequest,
    ) -> Result<ResponseEnvelope, RelayError> {
        // One deadline covers queueing the frame and awaiting the reply.
        let deadline = Instant::now() + self.timeout;
        let (tx, mut rx) = oneshot::channel();
        let request_id = {
            let mut pending = channel.pending().lock();
            let id = loop {
                let candidate = new_request_id();
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };
            pending.insert(id.clone(), tx);
            id
        };
        let guard = PendingGuard {
            channel,
            request_id: &request_id,
        };

        let frame = Envelope::Request(RequestEnvelope {
            id: request_id.clone(),
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
            is_base64_encoded: false,
        })
        .encode()
        .map_err(|e| RelayError::MalformedEnvelope(e.to_string()))?;

        match timeout_at(deadline, channel.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!(conn = channel.conn_id(), request_id = %request_id, "Failed to queue request for device");
                return Err(RelayError::TunnelUnavailable);
            }
            Err(_) => {
                warn!(
                    conn = channel.conn_id(),
                    request_id = %request_id,
                    "Device outbound queue stayed full until the deadline"
                );
                return Err(RelayError::TunnelTimeout);
            }
        }
        debug!(conn = channel.conn_id(), request_id = %request_id, "Request dispatched");

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without a value: the entry was discarded.
            Ok(Err(_)) => Err(RelayError::TunnelUnavailable),
            Err(_) => {
                if guard.claim() {
                    warn!(
                        conn = channel.conn_id(),
                        request_id = %request_id,
                        timeout_secs = self.timeout.as_secs(),
                        "Device did not respond in time"
                    );
                    Err(RelayError::TunnelTimeout)
                } else {
                    // A response claimed the entry at the deadline.
                    rx.try_recv().map_err(|_| RelayError::TunnelTimeout)
                }
            }
        }
    }

    /// Route a device's response to the request it answers.
    ///
    /// The table lock is held through the send so a racing deadline either
    /// wins the entry or finds the value already delivered.
    pub fn intake(&self, channel: &DeviceChannel, response: ResponseEnvelope) -> Intake {
        let mut pending = channel.pending().lock();
        let Some(sender) = pending.remove(&response.id) else {
            drop(pending);
            debug!(
                conn = channel.conn_id(),
                request_id = %response.id,
                "Response for unknown or resolved request (dropped)"
            );
            return Intake::Stale;
        };
        let request_id = response.id.clone();
        match sender.send(response) {
            Ok(()) => Intake::Delivered,
            Err(_) => {
                debug!(conn = channel.conn_id(), %request_id, "Caller went away before response");
                Intake::Stale
            }
        }
    }
}

/// Removes a pending entry when the dispatching future ends, however it ends.
struct PendingGuard<'a> {
    channel: &'a DeviceChannel,
    request_id: &'a str,
}

impl PendingGuard<'_> {
    /// Take the entry out of the table. `true` if it was still active.
    fn claim(&self) -> bool {
        self.channel
            .pending()
            .lock()
            .remove(self.request_id)
            .is_some()
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.claim();
    }
}

/// 128 random bits (122 of entropy), hex encoded.
fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Drop `Content-Length` whenever `Transfer-Encoding` is present.
pub fn sanitize_headers(headers: &IndexMap<String, Value>) -> IndexMap<String, Value> {
    let chunked = headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case("transfer-encoding"));
    headers
        .iter()
        .filter(|(k, _)| !(chunked && k.eq_ignore_ascii_case("content-length")))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Turn a device response into the HTTP response for the original caller.
///
/// Status and body are passed through verbatim; headers are sanitized, and
/// entries that are not valid HTTP headers are skipped.
pub fn render_response(response: ResponseEnvelope) -> Result<Response, RelayError> {
    let code = response.status();
    let status = StatusCode::from_u16(code)
        .map_err(|_| RelayError::MalformedEnvelope(format!("invalid status code {code}")))?;
    let body = match response.body_bytes() {
        Ok(Some(bytes)) => Body::from(bytes),
        Ok(None) => Body::empty(),
        Err(e) => return Err(RelayError::MalformedEnvelope(format!("invalid base64 body: {e}"))),
    };

    let mut http = Response::new(body);
    *http.status_mut() = status;
    let headers = http.headers_mut();
    for (name, value) in sanitize_headers(&response.headers) {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(request_id = %response.id, header = %name, "Skipping invalid header name");
            continue;
        };
        for v in ResponseEnvelope::header_values(&value) {
            match HeaderValue::from_bytes(v.as_bytes()) {
                Ok(hv) => {
                    headers.append(header_name.clone(), hv);
                }
                Err(_) => {
                    warn!(request_id = %response.id, header = %name, "Skipping invalid header value");
                }
            }
        }
    }
    Ok(http)
}
