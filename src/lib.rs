#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_self)]

//! towers-tunnel library — relays HTTP requests to devices without a public
//! address over a persistent WebSocket each device holds open.
//!
//! - `tunnel` — registry, correlation engine, device channel, relay router, agent
//! - `routes` — HTTP handlers (listing page, request gateway)
//! - `config` — configuration loading
//! - `error` — relay, config and agent error types

pub mod config;
pub mod error;
pub mod routes;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::RelayError;
pub use tunnel::registry::{DeviceChannel, TunnelRegistry};
pub use tunnel::relay::{relay_router, RelayState};
