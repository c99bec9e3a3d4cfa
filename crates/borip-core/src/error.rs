//! Error types for the BorIP stack.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Socket failures, wire-format violations,
//! backend rejections, and bad configuration are all captured here.

/// The error type for all BorIP operations.
///
/// The variants fall into four families:
///
/// - transport: [`Transport`](Error::Transport), [`Timeout`](Error::Timeout),
///   [`NotConnected`](Error::NotConnected), [`ConnectionLost`](Error::ConnectionLost),
///   [`Io`](Error::Io)
/// - protocol: [`Protocol`](Error::Protocol), [`Busy`](Error::Busy)
/// - device: [`Device`](Error::Device)
/// - configuration: [`Config`](Error::Config)
///
/// [`StreamClosed`](Error::StreamClosed) is reported by the data plane once
/// the sample stream has ended.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A socket-level failure (refused, unreachable, rejected bind).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer sent something that does not follow the BorIP grammar
    /// (malformed greeting, response without a result token, bad descriptor).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend rejected a setting or failed to open.
    #[error("device error: {0}")]
    Device(String),

    /// Invalid configuration detected before any network activity
    /// (empty address, unknown module, bad destination string).
    #[error("configuration error: {0}")]
    Config(String),

    /// The server greeted with `BUSY` instead of a device descriptor.
    #[error("server busy")]
    Busy,

    /// Timed out waiting for the peer.
    #[error("timeout waiting for response")]
    Timeout,

    /// No control connection has been established.
    #[error("not connected")]
    NotConnected,

    /// The control connection was closed or reset by the peer.
    #[error("connection lost")]
    ConnectionLost,

    /// The sample stream reached its end.
    #[error("stream closed")]
    StreamClosed,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error came from the socket layer.
    ///
    /// The client proxy reconnects on transport errors and surfaces every
    /// other kind immediately.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Timeout
                | Error::NotConnected
                | Error::ConnectionLost
                | Error::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("connection refused: 10.0.0.2:28888".into());
        assert_eq!(
            e.to_string(),
            "transport error: connection refused: 10.0.0.2:28888"
        );
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("Response without result".into());
        assert_eq!(e.to_string(), "protocol error: Response without result");
    }

    #[test]
    fn error_display_device_and_config() {
        assert_eq!(
            Error::Device("tuner locked".into()).to_string(),
            "device error: tuner locked"
        );
        assert_eq!(
            Error::Config("no address".into()).to_string(),
            "configuration error: no address"
        );
    }

    #[test]
    fn error_display_busy() {
        assert_eq!(Error::Busy.to_string(), "server busy");
    }

    #[test]
    fn transport_classification() {
        assert!(Error::Transport("x".into()).is_transport());
        assert!(Error::Timeout.is_transport());
        assert!(Error::NotConnected.is_transport());
        assert!(Error::ConnectionLost.is_transport());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(Error::from(io).is_transport());

        assert!(!Error::Protocol("x".into()).is_transport());
        assert!(!Error::Device("x".into()).is_transport());
        assert!(!Error::Config("x".into()).is_transport());
        assert!(!Error::Busy.is_transport());
        assert!(!Error::StreamClosed.is_transport());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
