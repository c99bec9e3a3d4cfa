//! borip-test-harness: mock devices and scripted servers for BorIP tests.
//!
//! [`MockDevice`] stands in for a receiver backend when testing the server
//! side, and [`MockBoripServer`] plays back exact protocol text when testing
//! the client proxy.

pub mod mock_device;
pub mod mock_server;

pub use mock_device::MockDevice;
pub use mock_server::{AfterScript, MockBoripServer};
