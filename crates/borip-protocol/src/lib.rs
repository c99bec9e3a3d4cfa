//! BorIP wire codec.
//!
//! The control channel is a newline-delimited text protocol over TCP:
//!
//! - [`framing`]: reassembling lines from a byte stream
//! - [`codec`]: the command/response grammar, error escaping, and number
//!   formatting
//! - [`descriptor`]: the pipe-delimited device descriptor

pub mod codec;
pub mod descriptor;
pub mod framing;

pub use codec::{Command, Request, Response};
pub use descriptor::Descriptor;
pub use framing::LineBuffer;
