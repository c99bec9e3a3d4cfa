//! # borip -- remote software-defined receivers
//!
//! `borip` lets a receiver attached to one machine be tuned and streamed
//! over a LAN as if it were local. A text control channel over TCP
//! configures the device; samples travel as UDP datagrams.
//!
//! ## Quick Start
//!
//! Serve the simulated backends:
//!
//! ```no_run
//! use borip::server::{BoripServer, DeviceRegistry, ServerOptions, sim};
//!
//! #[tokio::main]
//! async fn main() -> borip::Result<()> {
//!     let mut registry = DeviceRegistry::new(28888);
//!     sim::register(&mut registry);
//!
//!     let mut server = BoripServer::new(ServerOptions::new(), registry);
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! Drive it from another machine:
//!
//! ```no_run
//! use borip::Device;
//! use borip::client::{BoripClient, ClientOptions};
//!
//! # async fn example() -> borip::Result<()> {
//! let client = BoripClient::connect_to("radio.lan", ClientOptions::new().which("rtl")).await?;
//! client.set_freq(100e6).await?;
//! client.set_gain(20.0).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate               | Purpose                                         |
//! |---------------------|-------------------------------------------------|
//! | `borip-core`        | [`Device`], [`NetworkTransport`], hint parser, errors |
//! | `borip-protocol`    | Line framing, command grammar, device descriptor |
//! | `borip-transport`   | TCP control connection, UDP sample sink/source  |
//! | `borip-server`      | Session manager, device registry, simulator     |
//! | `borip-client`      | Client proxy with reconnect and keepalive       |
//! | **`borip`**         | This facade crate -- re-exports everything      |
//!
//! ## Feature Flags
//!
//! | Feature  | Enables              | Default |
//! |----------|----------------------|---------|
//! | `server` | [`server`] module    | yes     |
//! | `client` | [`client`] module    | yes     |
//! | `full`   | Both                 | no      |

pub use borip_core::*;

/// Wire codec: framing, commands and responses, device descriptors.
pub mod protocol {
    pub use borip_protocol::*;
}

/// TCP control connections and the UDP data plane.
pub mod transport {
    pub use borip_transport::*;
}

/// BorIP server: sessions, device registry, and the simulated backend.
#[cfg(feature = "server")]
pub mod server {
    pub use borip_server::*;
}

/// BorIP client proxy.
#[cfg(feature = "client")]
pub mod client {
    pub use borip_client::*;
}

/// A registry with every built-in backend registered, sending samples to
/// `data_port` by default.
///
/// # Example
///
/// ```
/// let registry = borip::default_registry(28888);
/// assert_eq!(registry.modules(), vec!["RTL".to_string(), "SIM".to_string()]);
/// ```
#[cfg(feature = "server")]
pub fn default_registry(data_port: u16) -> server::DeviceRegistry {
    let mut registry = server::DeviceRegistry::new(data_port);
    server::sim::register(&mut registry);
    registry
}
