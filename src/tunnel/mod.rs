//! HTTP-over-WebSocket tunnel.
//!
//! Provides two roles:
//!
//! - **Relay** (`towers-tunnel serve`): accepts device registrations over WS,
//!   relays caller HTTP requests to devices via their tunnel connection.
//! - **Agent** (`towers-tunnel agent`): connects outbound to a relay, answers
//!   relayed requests from a local upstream HTTP service.
//!
//! ```text
//! caller ─HTTP─▶ routes::proxy ─▶ correlation ─▶ registry ─WS─▶ device
//! caller ◀─HTTP─ routes::proxy ◀─ correlation ◀─ channel  ◀─WS── device
//! ```

pub mod agent;
pub mod channel;
pub mod correlation;
pub mod envelope;
pub mod registry;
pub mod relay;
