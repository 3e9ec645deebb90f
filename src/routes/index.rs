//! Tunnel listing page.

use axum::{
    extract::{Request, State},
    response::{Html, IntoResponse, Response},
};

use crate::tunnel::channel;
use crate::tunnel::relay::RelayState;

/// `GET /` — HTML list of registered tunnels, or a device upgrade.
pub async fn index(State(state): State<RelayState>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    if channel::is_websocket_upgrade(&parts.headers) {
        return channel::upgrade(state, parts).await;
    }
    Html(render_tunnel_list(&state.registry.identifiers())).into_response()
}

/// Render the listing page for `identifiers`.
pub fn render_tunnel_list(identifiers: &[String]) -> String {
    let items = if identifiers.is_empty() {
        "<li>No active tunnels</li>".to_string()
    } else {
        identifiers
            .iter()
            .map(|id| {
                let id = escape_html(id);
                format!(r#"<li><a href="/{id}/">{id}</a></li>"#)
            })
            .collect()
    };
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n    <title>Tunnels</title>\n</head>\n<body>\n    <h1>Active tunnels</h1>\n    <ul>\n        {items}\n    </ul>\n</body>\n</html>"
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
