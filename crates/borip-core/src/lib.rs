//! borip-core: Core traits, types, and error definitions for BorIP.
//!
//! This crate defines the backend-agnostic abstractions shared by the server
//! and the client proxy:
//!
//! - [`Device`]: lifecycle, gain, sample rate, frequency, antenna
//! - [`NetworkTransport`]: UDP destination, framing header, payload size
//! - [`SampleSink`]: the byte-stream collaborator that owns the data socket
//! - [`HintParser`]: turns an operator's device hint into a [`DeviceSpec`]
//!
//! A backend that implements both [`Device`] and [`NetworkTransport`] is a
//! [`StreamDevice`] and can be served to remote clients.

pub mod device;
pub mod error;
pub mod hint;
pub mod stream;
pub mod transport;
pub mod types;

pub use device::{Device, DeviceState, resolve_antenna};
pub use error::{Error, Result};
pub use hint::{DefaultHintMapper, DeviceSpec, HintMapper, HintParser, ModuleMapping};
pub use stream::{Overrun, SampleSink, SinkStatus, StatusQueue};
pub use transport::{
    BYTES_PER_SAMPLE, DEFAULT_PORT, Destination, MAX_PAYLOAD_SIZE, NetworkTransport,
    SinkTransport, StreamDevice, TransportSettings, clamp_payload_size, payload_size_for,
};
pub use types::{AntennaSelector, GainRange, RunState, TuneResult, TuneStatus};
