//! The byte-stream sink that carries samples onto the data plane.
//!
//! A device backend produces interleaved 16-bit I/Q bytes and hands them to
//! a [`SampleSink`]. The sink owns the socket; the device only re-points it
//! ([`connect`](SampleSink::connect)) and tunes its framing. Failures on the
//! data path are reported through a status queue instead of being returned
//! to the producer.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Kind of sample loss to flag in the next packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Overrun {
    /// The hardware dropped samples.
    Hardware,
    /// The network send path could not keep up.
    Network,
    /// An intermediate buffer overflowed.
    Buffer,
}

/// Status notifications emitted by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStatus {
    /// The sink now sends to `host:port`.
    Connected { host: String, port: u16 },
    /// The sink stopped sending.
    Disconnected,
    /// The receiver refused a datagram; the data was discarded.
    SendRefused,
    /// A datagram could not be sent.
    SendFailed(String),
}

/// Sender half of a sink status queue.
pub type StatusQueue = mpsc::UnboundedSender<SinkStatus>;

/// A network-attached sample sink.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Re-point the sink at `host:port`. On error the previous destination
    /// is no longer guaranteed; callers roll back by reconnecting.
    async fn connect(&self, host: &str, port: u16) -> Result<()>;

    /// Stop sending, flushing an end-of-stream marker if framing is enabled.
    async fn disconnect(&self) -> Result<()>;

    /// Enable or disable the per-packet framing header.
    fn set_header(&self, enable: bool);

    /// Set the payload size of each datagram in bytes (header excluded).
    fn set_payload_size(&self, size: usize);

    /// Queue sample bytes. Full packets are sent immediately, the remainder
    /// is kept until the next write. Returns the number of bytes accepted.
    async fn write(&self, data: &[u8]) -> Result<usize>;

    /// Flag sample loss in the next packet.
    fn report_overrun(&self, kind: Overrun);

    /// Install the queue that receives [`SinkStatus`] notifications.
    fn set_status_queue(&self, queue: StatusQueue);
}
