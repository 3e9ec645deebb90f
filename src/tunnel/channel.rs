//! Device channel handler — one WebSocket session per physical connection.
//!
//! A connection starts unregistered. The first `register` envelope with a
//! non-empty id puts it in the registry; after that, `response` envelopes
//! are handed to the correlation engine. Anything else is logged and
//! dropped without closing the socket. On close the registry entry is
//! removed only if it still points at this connection.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        FromRequestParts, WebSocketUpgrade,
    },
    http::{header, request::Parts, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

use super::correlation::Intake;
use super::envelope::Envelope;
use super::registry::DeviceChannel;
use super::relay::RelayState;

/// Whether `headers` ask for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Complete the upgrade handshake and run the device session.
pub async fn upgrade(state: RelayState, mut parts: Parts) -> Response {
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    info!(path = %parts.uri.path(), "Device connecting...");
    ws.on_upgrade(move |socket| {
        handle_device_ws(socket, state)
            .instrument(info_span!("tunnel_device", conn = field::Empty, tunnel = field::Empty))
    })
}

/// Handle one device's WebSocket connection until it closes.
async fn handle_device_ws(socket: WebSocket, state: RelayState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (device_tx, mut device_rx) = mpsc::channel::<String>(state.channel_buffer);
    let channel = DeviceChannel::new(device_tx);
    Span::current().record("conn", channel.conn_id());
    info!("Device connected");

    // Forward queued frames to the WS sink
    let send_task = tokio::spawn(async move {
        while let Some(text) = device_rx.recv().await {
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = DeviceSession::new(state, channel);
    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.on_frame(text.as_str()),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => session.on_frame(text),
                Err(_) => warn!("Non-UTF-8 binary frame from device (dropped)"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Device socket error");
                break;
            }
        }
    }

    session.close();
    send_task.abort();
}

/// Registration state machine for one connection.
pub struct DeviceSession {
    state: RelayState,
    channel: DeviceChannel,
    /// `None` while unregistered.
    identifier: Option<String>,
}

impl DeviceSession {
    pub fn new(state: RelayState, channel: DeviceChannel) -> Self {
        Self {
            state,
            channel,
            identifier: None,
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Route one inbound text frame.
    pub fn on_frame(&mut self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Malformed envelope from device (dropped)");
                return;
            }
        };

        match envelope {
            Envelope::Register(reg) => self.register(reg.id),
            Envelope::Response(response) if self.identifier.is_some() => {
                if self.state.engine.intake(&self.channel, response) == Intake::Stale {
                    debug!("Stale response from device (ignored)");
                }
            }
            Envelope::Response(_) => warn!("Response before registration (dropped)"),
            Envelope::Request(_) => warn!("Device sent a request envelope (dropped)"),
        }
    }

    fn register(&mut self, id: String) {
        if id.is_empty() {
            warn!("Registration with empty id (dropped)");
            return;
        }
        if let Some(previous) = self.identifier.take() {
            if previous != id {
                self.state.registry.remove(&previous, &self.channel);
                info!(previous = %previous, tunnel = %id, "Device changed identifier");
            }
        }
        if self.state.registry.put(&id, self.channel.clone()).is_some() {
            warn!(tunnel = %id, "Tunnel re-registered while a previous connection exists, routing to the new one");
        }
        Span::current().record("tunnel", id.as_str());
        info!(tunnel = %id, "Tunnel registered");
        self.identifier = Some(id);
    }

    /// Connection ended: stop routing to it.
    pub fn close(self) {
        self.channel.close();
        match self.identifier {
            Some(id) if self.state.registry.remove(&id, &self.channel) => {
                info!(tunnel = %id, "Tunnel disconnected");
            }
            Some(id) => {
                info!(tunnel = %id, "Replaced connection closed, newer registration kept");
            }
            None => info!("Device disconnected before registering"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderValue;
    use indexmap::IndexMap;

    use super::*;
    use crate::tunnel::correlation::ProxiedRequest;

    fn state() -> RelayState {
        RelayState::new(Duration::from_secs(5), 1024, 16)
    }

    fn session(state: &RelayState) -> (DeviceSession, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (DeviceSession::new(state.clone(), DeviceChannel::new(tx)), rx)
    }

    #[test]
    fn detects_websocket_upgrade() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));
    }

    #[test]
    fn register_adds_to_registry() {
        let state = state();
        let (mut session, _rx) = session(&state);
        session.on_frame(r#"{"type":"register","id":"dev1"}"#);
        assert_eq!(session.identifier(), Some("dev1"));
        assert!(state.registry.get("dev1").is_some());
    }

    #[test]
    fn malformed_and_empty_registrations_are_dropped() {
        let state = state();
        let (mut session, _rx) = session(&state);
        session.on_frame("{not json");
        session.on_frame(r#"{"type":"register","id":""}"#);
        session.on_frame(r#"{"type":"hello"}"#);
        session.on_frame(r#"{"type":"response","id":"x","statusCode":200}"#);
        assert_eq!(session.identifier(), None);
        assert!(state.registry.is_empty());
    }

    #[test]
    fn re_registration_moves_identifier() {
        let state = state();
        let (mut session, _rx) = session(&state);
        session.on_frame(r#"{"type":"register","id":"a"}"#);
        session.on_frame(r#"{"type":"register","id":"b"}"#);
        assert!(state.registry.get("a").is_none());
        assert!(state.registry.get("b").is_some());
        assert_eq!(state.registry.len(), 1);
    }

    #[test]
    fn close_of_replaced_connection_keeps_new_one() {
        let state = state();
        let (mut old, _rx1) = session(&state);
        let (mut new, _rx2) = session(&state);
        old.on_frame(r#"{"type":"register","id":"dev1"}"#);
        new.on_frame(r#"{"type":"register","id":"dev1"}"#);

        let current = state.registry.get("dev1").unwrap();
        old.close();
        assert_eq!(state.registry.get("dev1"), Some(current));

        new.close();
        assert!(state.registry.get("dev1").is_none());
    }

    #[tokio::test]
    async fn response_frames_resolve_pending_requests() {
        let state = state();
        let (mut session, mut rx) = session(&state);
        session.on_frame(r#"{"type":"register","id":"dev1"}"#);
        let channel = state.registry.get("dev1").unwrap();

        let engine = state.engine.clone();
        let task = tokio::spawn(async move {
            engine
                .dispatch(
                    &channel,
                    ProxiedRequest {
                        method: "GET".into(),
                        path: "/status/".into(),
                        headers: IndexMap::new(),
                        body: String::new(),
                    },
                )
                .await
        });

        let frame = rx.recv().await.unwrap();
        let Envelope::Request(req) = Envelope::decode(&frame).unwrap() else {
            panic!("expected request envelope");
        };
        session.on_frame(&format!(
            r#"{{"type":"response","id":"{}","statusCode":200,"body":"ok"}}"#,
            req.id
        ));
        // Duplicate is a no-op.
        session.on_frame(&format!(
            r#"{{"type":"response","id":"{}","statusCode":500}}"#,
            req.id
        ));

        let resp = task.await.unwrap().unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body.as_deref(), Some("ok"));
    }
}
