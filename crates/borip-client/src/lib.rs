//! borip-client: operate a remote BorIP receiver as if it were local.
//!
//! [`BoripClient`] connects to a BorIP server, selects and configures a
//! device, starts streaming, and keeps the session alive with a periodic
//! `PING`. Samples arrive on a channel fed by a UDP receiver. The client
//! implements [`Device`](borip_core::Device) and
//! [`NetworkTransport`](borip_core::NetworkTransport).
//!
//! Connection loss is handled by reconnecting within
//! [`ClientOptions::reconnect_attempts`] and replaying the last known
//! antenna, frequency, and gain. Progress is observable through
//! [`BoripClient::subscribe`].

pub mod client;
mod keepalive;
pub mod options;

pub use client::{BoripClient, ClientEvent};
pub use options::{ClientOptions, ServerAddress};
