//! Server configuration.

use std::time::Duration;

use borip_core::transport::DEFAULT_PORT;

/// Options for a [`BoripServer`](crate::BoripServer).
///
/// # Example
///
/// ```
/// use borip_server::ServerOptions;
///
/// let options = ServerOptions::new()
///     .listen_port(28888)
///     .device_hint("rtl")
///     .lock(true);
/// assert_eq!(options.data_port, 28888);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    /// TCP control port.
    pub listen_port: u16,
    /// Default UDP destination port handed to device transports.
    pub data_port: u16,
    /// Interface the listener binds to.
    pub bind_host: String,
    /// Hint for the device created at accept (per-session mode) or at start
    /// (locked mode).
    pub device_hint: Option<String>,
    /// Module used when a hint is empty or `-`.
    pub default_module: Option<String>,
    /// Share one device between all sessions and ignore `DEVICE` selection.
    pub lock: bool,
    /// Delay between bind attempts while the port is in use.
    pub bind_retry_interval: Duration,
    /// Log every command and response at info level instead of debug.
    pub log_commands: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            data_port: DEFAULT_PORT,
            bind_host: "0.0.0.0".to_string(),
            device_hint: None,
            default_module: None,
            lock: false,
            bind_retry_interval: Duration::from_secs(5),
            log_commands: false,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn data_port(mut self, port: u16) -> Self {
        self.data_port = port;
        self
    }

    pub fn bind_host(mut self, host: &str) -> Self {
        self.bind_host = host.to_string();
        self
    }

    pub fn device_hint(mut self, hint: &str) -> Self {
        self.device_hint = Some(hint.to_string());
        self
    }

    pub fn default_module(mut self, module: &str) -> Self {
        self.default_module = Some(module.to_string());
        self
    }

    pub fn lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn bind_retry_interval(mut self, interval: Duration) -> Self {
        self.bind_retry_interval = interval;
        self
    }

    pub fn log_commands(mut self, enabled: bool) -> Self {
        self.log_commands = enabled;
        self
    }

    /// `bind_host:listen_port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.listen_port)
    }
}
