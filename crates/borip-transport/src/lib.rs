//! Socket plumbing for BorIP.
//!
//! - [`ControlConnection`]: the line-framed TCP control channel, used by
//!   both the server sessions and the client proxy
//! - [`UdpSampleSink`]: packetizes device output into UDP datagrams
//! - [`UdpSampleSource`]: receives datagrams and yields sample payloads
//!
//! # Example
//!
//! ```no_run
//! use borip_core::SampleSink;
//! use borip_transport::{UdpSampleSink, UdpSampleSource};
//!
//! # async fn example() -> borip_core::Result<()> {
//! let (source, mut samples) = UdpSampleSource::bind("0.0.0.0:28888", 4096, true).await?;
//!
//! let sink = UdpSampleSink::new();
//! sink.connect("127.0.0.1", 28888).await?;
//! sink.write(&[0u8; 8192]).await?;
//!
//! let first = samples.recv().await;
//! source.signal_eos();
//! # Ok(())
//! # }
//! ```

pub mod packet;
pub mod tcp;
pub mod udp;

pub use packet::{HEADER_LEN, PacketFlags, PacketHeader, SequenceTracker};
pub use tcp::{ControlConnection, DEFAULT_CONNECT_TIMEOUT, is_connection_refused};
pub use udp::{DEFAULT_PAYLOAD_SIZE, SourceStats, UdpSampleSink, UdpSampleSource};
