//! Shared helpers for relay integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{HeaderMap, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use towers_tunnel::tunnel::envelope::{Envelope, RequestEnvelope};
use towers_tunnel::{relay_router, RelayState};

pub type Device = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on an ephemeral port.
pub async fn start_relay(timeout: Duration, max_body_bytes: usize) -> (SocketAddr, RelayState) {
    let state = RelayState::new(timeout, max_body_bytes, 64);
    let app = relay_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Connect a fake device and register it under `id`.
pub async fn connect_device(addr: SocketAddr, state: &RelayState, id: &str) -> Device {
    let before = state.registry.get(id);
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .unwrap();
    send_json(&mut ws, json!({"type": "register", "id": id})).await;
    wait_for(|| state.registry.get(id).is_some_and(|ch| Some(ch) != before)).await;
    ws
}

pub async fn send_json(ws: &mut Device, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next request envelope delivered to the device.
pub async fn next_request(ws: &mut Device) -> RequestEnvelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("request within 5s")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = msg {
            match Envelope::decode(text.as_str()).unwrap() {
                Envelope::Request(req) => return req,
                other => panic!("unexpected {} envelope", other.kind()),
            }
        }
    }
}

/// Poll `cond` until it holds, failing after 5s.
pub async fn wait_for(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Issue an HTTP request against `addr`.
pub async fn http(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (StatusCode, HeaderMap, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(format!("http://{addr}{path}"));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    let (parts, body) = client.request(request).await.unwrap().into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (
        parts.status,
        parts.headers,
        String::from_utf8(bytes.to_vec()).unwrap(),
    )
}
