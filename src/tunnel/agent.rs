//! Tunnel agent — the device side of a relay connection.
//!
//! Run with `towers-tunnel agent`. Maintains a persistent WebSocket to the
//! relay with exponential-backoff reconnect, registers under the configured
//! id, and answers each relayed request by calling a local upstream HTTP
//! service.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Uri;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::envelope::{Envelope, RegisterEnvelope, RequestEnvelope, ResponseEnvelope};
use crate::config::AgentConfig;
use crate::error::AgentError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Spawn the agent loop. Returns a `JoinHandle` that runs until cancelled
/// or the upstream URL turns out to be unusable.
pub fn spawn(config: AgentConfig) -> tokio::task::JoinHandle<Result<(), AgentError>> {
    tokio::spawn(run(config))
}

/// Main loop: connect, serve requests, reconnect on failure.
pub async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let upstream = Upstream::new(&config.upstream)?;
    let mut delay = Duration::from_secs(config.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs);

    loop {
        info!(url = %config.url, tunnel = %config.id, "Agent: connecting to relay");
        match connect_and_run(&config, &upstream).await {
            Ok(()) => {
                info!("Agent: connection closed cleanly, reconnecting...");
                delay = Duration::from_secs(config.reconnect_delay_secs);
            }
            Err(e) => {
                warn!(
                    "Agent: connection error: {e}, reconnecting in {}s",
                    delay.as_secs()
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// A single connection attempt: connect, register, serve until disconnect.
async fn connect_and_run(config: &AgentConfig, upstream: &Upstream) -> Result<(), AgentError> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(config.url.as_str()).await?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let register = Envelope::Register(RegisterEnvelope {
        id: config.id.clone(),
    })
    .encode()?;
    ws_sink.send(Message::Text(register.into())).await?;
    info!(tunnel = %config.id, "Agent: registered with relay");

    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        let msg = match ws_stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break Err(AgentError::from(e)),
            None => break Ok(()),
        };
        match msg {
            Message::Text(text) => match Envelope::decode(text.as_str()) {
                Ok(Envelope::Request(request)) => {
                    let upstream = upstream.clone();
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let response = upstream.forward(request).await;
                        match Envelope::Response(response).encode() {
                            Ok(frame) => {
                                let _ = out_tx.send(frame).await;
                            }
                            Err(e) => warn!(error = %e, "Agent: failed to encode response"),
                        }
                    });
                }
                Ok(other) => warn!(kind = other.kind(), "Agent: unexpected envelope from relay"),
                Err(e) => warn!(error = %e, "Agent: malformed envelope from relay"),
            },
            Message::Close(_) => break Ok(()),
            _ => {}
        }
    };

    writer.abort();
    result
}

/// Local HTTP service that relayed requests are replayed against.
#[derive(Clone)]
pub struct Upstream {
    base: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Upstream {
    /// `base` must be an absolute `http://` URL; a trailing `/` is ignored.
    pub fn new(base: &str) -> Result<Self, AgentError> {
        let uri: Uri = base
            .parse()
            .map_err(|_| AgentError::Upstream(base.to_string()))?;
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(AgentError::Upstream(base.to_string()));
        }
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    /// Replay `request` upstream. Failures become a 502 response envelope.
    pub async fn forward(&self, request: RequestEnvelope) -> ResponseEnvelope {
        match self.try_forward(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Agent: upstream request failed");
                ResponseEnvelope {
                    id: request.id,
                    status_code: Some(502),
                    headers: IndexMap::new(),
                    body: Some("upstream unavailable".to_string()),
                    is_base64_encoded: false,
                }
            }
        }
    }

    async fn try_forward(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, BoxError> {
        let mut builder = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(format!("{}{}", self.base, request.path));
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        let body = if request.is_base64_encoded {
            BASE64.decode(&request.body)?
        } else {
            request.body.clone().into_bytes()
        };
        let upstream_request = builder.body(Full::new(Bytes::from(body)))?;

        debug!(request_id = %request.id, uri = %upstream_request.uri(), "Agent: forwarding upstream");
        let (parts, body) = self.client.request(upstream_request).await?.into_parts();
        let bytes = body.collect().await?.to_bytes();

        let mut headers: IndexMap<String, Value> = IndexMap::new();
        for name in parts.headers.keys() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            let values: Vec<Value> = parts
                .headers
                .get_all(name)
                .iter()
                .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect();
            let value = if values.len() == 1 {
                values.into_iter().next().unwrap_or(Value::Null)
            } else {
                Value::Array(values)
            };
            headers.insert(name.as_str().to_string(), value);
        }

        let (body, is_base64_encoded) = match std::str::from_utf8(&bytes) {
            Ok(text) => (text.to_string(), false),
            Err(_) => (BASE64.encode(&bytes), true),
        };
        Ok(ResponseEnvelope {
            id: request.id.clone(),
            status_code: Some(parts.status.as_u16()),
            headers,
            body: (!body.is_empty()).then_some(body),
            is_base64_encoded,
        })
    }
}
