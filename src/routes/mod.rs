//! HTTP route handlers.
//!
//! - [`index`] — `GET /` tunnel listing
//! - [`proxy`] — `ANY /{identifier}/{*path}` relayed to the device
//!
//! Both also accept device WebSocket upgrades, so devices may connect on
//! any path of the listener.

pub mod index;
pub mod proxy;
