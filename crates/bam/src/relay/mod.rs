//! Relay transport: how agents reach the shared message broker.
//!
//! The broker itself is an external service; this module only speaks its
//! contract. Agents are written against the [`RelayTransport`] seam, with
//! a WebSocket client for the real relay and an in-process hub for tests
//! and single-host setups.

mod hub;
mod transport;
mod ws;

pub use hub::RelayHub;
pub use transport::{
    ConnectOptions, RelayConnection, RelayError, RelayEvent, RelaySender, RelayTransport,
};
pub use ws::WsRelay;
