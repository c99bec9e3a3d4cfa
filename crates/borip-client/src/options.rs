//! Client configuration.

use std::time::Duration;

use borip_core::error::{Error, Result};
use borip_core::transport::DEFAULT_PORT;

/// Complex samples per datagram assumed by a listen-only client.
pub const LISTEN_ONLY_PACKET_SAMPLES: usize = 4096;

/// Options for a [`BoripClient`](crate::BoripClient).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use borip_client::ClientOptions;
///
/// let options = ClientOptions::new()
///     .which("rtl")
///     .reconnect_attempts(-1)
///     .keepalive_interval(Duration::from_secs(2));
/// assert_eq!(options.default_port, 28888);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Server used when `connect` is given no address.
    pub default_server: Option<String>,
    /// Control port used when the address has no `:port`.
    pub default_port: u16,
    /// Local UDP port for samples. `None` uses the control port number.
    pub udp_port: Option<u16>,
    /// Device hint sent as the `DEVICE` payload.
    pub which: Option<String>,
    /// Sub-device spec appended to the hint.
    pub subdevice: Option<String>,
    /// Sample rate requested after connecting. Must be accepted.
    pub sample_rate: Option<f64>,
    /// Decimation of the master clock, used when `sample_rate` is unset.
    pub decim_rate: Option<u32>,
    /// Datagram payload size in bytes for listen-only mode.
    pub packet_size: Option<usize>,
    /// `-1` retries forever, `0` never, `n > 0` at most `n` times.
    pub reconnect_attempts: i32,
    pub reconnect_interval: Duration,
    pub keepalive_interval: Duration,
    /// Read timeout for one response line.
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    /// Whether incoming datagrams carry the BorIP packet header.
    pub header: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_server: None,
            default_port: DEFAULT_PORT,
            udp_port: None,
            which: None,
            subdevice: None,
            sample_rate: None,
            decim_rate: None,
            packet_size: None,
            reconnect_attempts: 0,
            reconnect_interval: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            header: true,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_server(mut self, server: &str) -> Self {
        self.default_server = Some(server.to_string());
        self
    }

    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn udp_port(mut self, port: u16) -> Self {
        self.udp_port = Some(port);
        self
    }

    pub fn which(mut self, hint: &str) -> Self {
        self.which = Some(hint.to_string());
        self
    }

    pub fn subdevice(mut self, spec: &str) -> Self {
        self.subdevice = Some(spec.to_string());
        self
    }

    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn decim_rate(mut self, decim: u32) -> Self {
        self.decim_rate = Some(decim);
        self
    }

    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = Some(size);
        self
    }

    pub fn reconnect_attempts(mut self, attempts: i32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn header(mut self, enable: bool) -> Self {
        self.header = enable;
        self
    }

    /// The `DEVICE` payload: the hint plus sub-device spec, `-` when both
    /// are empty.
    pub fn device_hint(&self) -> String {
        let mut hint = self.which.clone().unwrap_or_default();
        if let Some(subdev) = self.subdevice.as_deref().filter(|s| !s.is_empty()) {
            if !hint.is_empty() {
                hint.push(' ');
            }
            hint.push_str(subdev);
        }
        if hint.trim().is_empty() {
            "-".to_string()
        } else {
            hint
        }
    }

    /// Resolve `address` (or the default server) to a host and port.
    pub fn resolve(&self, address: Option<&str>) -> Result<ServerAddress> {
        let address = address
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .or(self.default_server.as_deref().map(str::trim))
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::Config("Server address required".to_string()))?;

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("Invalid port in address: {}", address)))?;
                (host.trim().to_string(), port)
            }
            None => (address.to_string(), self.default_port),
        };
        if host.is_empty() {
            return Err(Error::Config(format!("Invalid address: {}", address)));
        }

        Ok(ServerAddress {
            udp_port: self.udp_port.unwrap_or(port),
            host,
            port,
        })
    }
}

/// A resolved server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    /// Local port the UDP receiver binds.
    pub udp_port: u16,
}

impl ServerAddress {
    /// `-` as the host selects listen-only mode.
    pub fn is_listen_only(&self) -> bool {
        self.host == "-"
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
