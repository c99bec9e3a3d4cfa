//! borip-server: serve local receivers to remote BorIP clients.
//!
//! - [`BoripServer`]: TCP listener, live-client registry, and shutdown
//! - [`DeviceRegistry`]: maps device hints onto [`DeviceFactory`]s
//! - [`ServerOptions`]: ports, device hint, locked mode, logging
//! - [`sim`]: a simulated backend registered as `RTL` and `SIM`
//!
//! Each accepted connection is served by its own task. A session greets
//! the client with the current device descriptor and then processes one
//! command line at a time (see `borip_protocol::codec` for the grammar).
//!
//! In locked mode every session shares a single device and `DEVICE`
//! selection requests are answered with the current descriptor without
//! changing anything. Otherwise each session owns the device it selects and
//! closes it on disconnect.

pub mod options;
pub mod registry;
mod session;
pub mod server;
pub mod sim;

pub use options::ServerOptions;
pub use registry::{DeviceFactory, DeviceRegistry, FactoryContext};
pub use server::BoripServer;
pub use sim::{SimFactory, SimProfile, SimulatedDevice};
