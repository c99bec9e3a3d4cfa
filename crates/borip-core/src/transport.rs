//! The data-plane side of a device: where samples go and how they are framed.
//!
//! [`NetworkTransport`] is the capability set a session manipulates through
//! `DEST`, `HEADER`, and payload negotiation. [`TransportSettings`] holds the
//! plain values, and [`SinkTransport`] binds those values to a
//! [`SampleSink`] so that every change is pushed to the socket.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::device::Device;
use crate::error::Result;
use crate::stream::SampleSink;

/// Default TCP control and UDP data port.
pub const DEFAULT_PORT: u16 = 28888;

/// Largest UDP payload a datagram can carry: 65536 minus the IP and UDP
/// headers, rounded down to a 512-byte boundary.
pub const MAX_PAYLOAD_SIZE: usize = ((65536 - 29) / 512) * 512;

/// Bytes per complex sample on the wire (16-bit I plus 16-bit Q).
pub const BYTES_PER_SAMPLE: usize = 4;

/// Clip a requested payload size to [`MAX_PAYLOAD_SIZE`].
pub fn clamp_payload_size(size: usize) -> usize {
    size.min(MAX_PAYLOAD_SIZE)
}

/// Payload size for a device's native packet length.
pub fn payload_size_for(samples_per_packet: usize) -> usize {
    clamp_payload_size(samples_per_packet.saturating_mul(BYTES_PER_SAMPLE))
}

/// A UDP destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, using `default_port` when no port is given.
    ///
    /// Returns `None` for an empty host, an unparsable port, or port 0.
    pub fn parse(s: &str, default_port: u16) -> Option<Self> {
        let s = s.trim();
        match s.rfind(':') {
            Some(idx) => {
                let port: u16 = s[idx + 1..].trim().parse().ok()?;
                let host = s[..idx].trim();
                if host.is_empty() || port == 0 {
                    return None;
                }
                Some(Self::new(host, port))
            }
            None if s.is_empty() => None,
            None => Some(Self::new(s, default_port)),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Data-plane configuration of a device.
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    async fn destination(&self) -> Result<Destination>;

    /// Re-point the data plane at `host[:port]`.
    ///
    /// Returns `Ok(false)` for a malformed destination or when the sink
    /// could not be re-pointed; the previous destination stays in effect.
    async fn set_destination(&self, dest: &str) -> Result<bool>;

    async fn header(&self) -> Result<bool>;

    async fn set_header(&self, enable: bool) -> Result<bool>;

    /// Datagram payload size in bytes.
    async fn payload_size(&self) -> Result<usize>;

    /// Request a payload size; it is clipped to [`MAX_PAYLOAD_SIZE`].
    async fn set_payload_size(&self, size: usize) -> Result<bool>;
}

/// A device with a network data plane: what the server hands to sessions.
pub trait StreamDevice: Device + NetworkTransport {}

impl<T: Device + NetworkTransport + ?Sized> StreamDevice for T {}

/// Plain data-plane settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub destination: Destination,
    pub header: bool,
    pub payload_size: usize,
    pub default_port: u16,
}

impl TransportSettings {
    /// Settings pointing at `127.0.0.1:default_port` with framing enabled.
    pub fn new(default_port: u16) -> Self {
        Self {
            destination: Destination::new("127.0.0.1", default_port),
            header: true,
            payload_size: 0,
            default_port,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

/// [`TransportSettings`] bound to a [`SampleSink`].
///
/// Backends embed one of these and forward their [`NetworkTransport`]
/// methods to it.
pub struct SinkTransport {
    settings: Mutex<TransportSettings>,
    sink: Arc<dyn SampleSink>,
}

impl SinkTransport {
    pub fn new(sink: Arc<dyn SampleSink>, default_port: u16) -> Self {
        Self {
            settings: Mutex::new(TransportSettings::new(default_port)),
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportSettings> {
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sink(&self) -> &Arc<dyn SampleSink> {
        &self.sink
    }

    pub fn settings(&self) -> TransportSettings {
        self.lock().clone()
    }

    pub fn destination(&self) -> Destination {
        self.lock().destination.clone()
    }

    /// Parse and apply a destination, rolling back on sink failure.
    ///
    /// On failure the error text is returned so the device can record it.
    pub async fn set_destination(&self, dest: &str) -> std::result::Result<Destination, String> {
        let (previous, default_port) = {
            let s = self.lock();
            (s.destination.clone(), s.default_port)
        };
        let Some(next) = Destination::parse(dest, default_port) else {
            return Err(format!("Invalid destination: {}", dest));
        };

        tracing::debug!(destination = %next, "Re-pointing sample sink");
        match self.sink.connect(&next.host, next.port).await {
            Ok(()) => {
                self.lock().destination = next.clone();
                Ok(next)
            }
            Err(e) => {
                tracing::warn!(
                    destination = %next,
                    previous = %previous,
                    error = %e,
                    "Failed to re-point sample sink, restoring previous destination"
                );
                if let Err(e) = self.sink.connect(&previous.host, previous.port).await {
                    tracing::warn!(destination = %previous, error = %e, "Failed to restore sample sink");
                }
                Err(e.to_string())
            }
        }
    }

    pub fn header(&self) -> bool {
        self.lock().header
    }

    pub fn set_header(&self, enable: bool) {
        self.sink.set_header(enable);
        self.lock().header = enable;
    }

    pub fn payload_size(&self) -> usize {
        self.lock().payload_size
    }

    /// Apply a clipped payload size and return it.
    pub fn set_payload_size(&self, size: usize) -> usize {
        let size = clamp_payload_size(size);
        self.sink.set_payload_size(size);
        self.lock().payload_size = size;
        size
    }

    /// Stop the sink.
    pub async fn disconnect(&self) -> Result<()> {
        self.sink.disconnect().await
    }
}

impl fmt::Debug for SinkTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkTransport")
            .field("settings", &self.settings())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
