//! Per-connection session: greeting, command dispatch, and teardown.
//!
//! A session moves through `Accepted -> Greeted -> (DeviceSelected <-> Idle)
//! -> Closed`. Exactly one buffered command line is handled per loop
//! iteration and the socket is only read when no complete line is
//! buffered, so responses always follow requests in order.

use std::net::SocketAddr;
use std::sync::Arc;

use borip_core::error::{Error, Result};
use borip_core::transport::{Destination, StreamDevice, TransportSettings};
use borip_core::types::AntennaSelector;
use borip_protocol::codec::{
    Command, NO_DEVICE, RELEASE_DEVICE, RESULT_DEVICE, RESULT_OK, RESULT_UNKNOWN, Request, fail,
    format_error, format_float, format_response, format_tune, parse_lenient,
};
use borip_protocol::descriptor::{Descriptor, format_descriptor};
use borip_transport::ControlConnection;
use tokio_util::sync::CancellationToken;

use crate::options::ServerOptions;
use crate::registry::DeviceRegistry;

/// Error reported when a freshly created device cannot be pointed at the
/// client.
const TRANSPORT_INIT_FAILED: &str = "Failed to initialise NetworkTransport";

/// Server-wide state shared by all sessions.
pub(crate) struct SessionContext {
    pub registry: Arc<DeviceRegistry>,
    pub options: Arc<ServerOptions>,
    /// The shared device in locked mode.
    pub shared: Option<Arc<dyn StreamDevice>>,
}

/// One accepted control connection.
pub(crate) struct Session {
    id: u64,
    peer: SocketAddr,
    conn: ControlConnection,
    device: Option<Arc<dyn StreamDevice>>,
    /// Data-plane settings used while no device is selected.
    detached: TransportSettings,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        id: u64,
        conn: ControlConnection,
        peer: SocketAddr,
        ctx: Arc<SessionContext>,
        cancel: CancellationToken,
    ) -> Self {
        let detached = TransportSettings::new(ctx.options.data_port);
        Self {
            id,
            peer,
            conn,
            device: None,
            detached,
            ctx,
            cancel,
        }
    }

    fn locked(&self) -> bool {
        self.ctx.options.lock
    }

    fn peer_ip(&self) -> String {
        self.peer.ip().to_string()
    }

    /// Whether the session's device must be closed when the session ends.
    fn owns_device(&self) -> bool {
        match (&self.device, &self.ctx.shared) {
            (Some(device), Some(shared)) => !Arc::ptr_eq(device, shared),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn log_line(&self, direction: &'static str, line: &str) {
        if self.ctx.options.log_commands {
            tracing::info!(session = self.id, peer = %self.peer, direction, line = %line, "Control line");
        } else {
            tracing::debug!(session = self.id, peer = %self.peer, direction, line = %line, "Control line");
        }
    }

    /// Resolve the initial device, greet the client, and serve commands
    /// until the peer disconnects or the session is cancelled.
    pub async fn run(mut self) {
        tracing::info!(session = self.id, peer = %self.peer, "Connection from client");

        self.attach_initial_device().await;

        let greeting = format!("{} {}", RESULT_DEVICE, self.describe().await);
        let greeted = self.send(&greeting).await;

        if greeted {
            self.serve().await;
        }
        self.teardown().await;
    }

    async fn attach_initial_device(&mut self) {
        let device = match (&self.ctx.shared, &self.ctx.options.device_hint) {
            (Some(shared), _) => Some(Arc::clone(shared)),
            (None, Some(hint)) => match self.ctx.registry.create(hint).await {
                Ok(device) => Some(device),
                Err(e) => {
                    tracing::warn!(session = self.id, hint = %hint, error = %e, "Failed to create session device");
                    None
                }
            },
            (None, None) => None,
        };
        let Some(device) = device else {
            return;
        };

        match device.set_destination(&self.peer_ip()).await {
            Ok(true) => self.device = Some(device),
            result => {
                tracing::warn!(session = self.id, peer = %self.peer, result = ?result, "Failed to point device at client");
                self.device = Some(device);
                if self.owns_device() {
                    self.close_device().await;
                } else {
                    self.device = None;
                }
            }
        }
    }

    async fn serve(&mut self) {
        let cancel = self.cancel.clone();
        loop {
            let line = match self.conn.next_buffered_line() {
                Some(line) => line,
                None => {
                    let read = tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!(session = self.id, "Session cancelled");
                            break;
                        }
                        read = self.conn.fill() => read,
                    };
                    match read {
                        Ok(_) => continue,
                        Err(Error::ConnectionLost) => {
                            tracing::debug!(session = self.id, peer = %self.peer, "Peer closed connection");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(session = self.id, peer = %self.peer, error = %e, "Control read failed");
                            break;
                        }
                    }
                }
            };

            let Some(request) = Request::parse(&line) else {
                continue;
            };
            self.log_line("<", &line);
            let response = self.dispatch(&request).await;
            if !self.send(&response).await {
                break;
            }
        }
    }

    async fn send(&mut self, line: &str) -> bool {
        self.log_line(">", line);
        match self.conn.send_line(line).await {
            Ok(()) => true,
            Err(Error::ConnectionLost) => false,
            Err(e) => {
                tracing::warn!(session = self.id, peer = %self.peer, error = %e, "Failed to send response");
                false
            }
        }
    }

    async fn teardown(mut self) {
        tracing::info!(session = self.id, peer = %self.peer, "Disconnection from client");
        self.release_device().await;
        self.conn.close().await;
    }

    /// Close and drop the session's private device.
    async fn close_device(&mut self) {
        if let Some(device) = self.device.take() {
            tracing::info!(session = self.id, name = %device.name(), "Closing device");
            if let Err(e) = device.close().await {
                tracing::warn!(session = self.id, error = %e, "Device close failed");
            }
        }
    }

    /// Release the current device: private devices are closed, the shared
    /// one is only detached.
    async fn release_device(&mut self) {
        if self.owns_device() {
            self.close_device().await;
        }
        self.device = None;
    }

    async fn describe(&self) -> String {
        match &self.device {
            Some(device) => {
                let payload_size = device.payload_size().await.unwrap_or_default();
                Descriptor::from_device(device.as_ref(), payload_size).to_string()
            }
            None => format_descriptor(None),
        }
    }

    /// Execute one request and build its response line.
    pub(crate) async fn dispatch(&mut self, request: &Request) -> String {
        let command = &request.command;
        let body = match self.execute(request).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(session = self.id, command = %command, error = %e, "Command failed");
                match command {
                    Command::Device => format!("{}{}", NO_DEVICE, format_error(Some(&e.to_string()))),
                    _ => fail(Some(&e.to_string())),
                }
            }
        };
        format_response(command, &body)
    }

    async fn execute(&mut self, request: &Request) -> Result<String> {
        let data = request.data.as_deref();
        match &request.command {
            Command::Device => self.select_device(data).await,
            Command::Dest => self.destination(data).await,
            Command::Header => self.header(data).await,
            Command::Ping => Ok(RESULT_OK.to_string()),
            Command::Unknown(_) => Ok(RESULT_UNKNOWN.to_string()),
            command => {
                let Some(device) = self.device.clone() else {
                    return Ok(RESULT_DEVICE.to_string());
                };
                self.device_command(command, data, device.as_ref()).await
            }
        }
    }

    async fn device_command(
        &self,
        command: &Command,
        data: Option<&str>,
        device: &dyn StreamDevice,
    ) -> Result<String> {
        let rejected = || fail(device.last_error().as_deref());

        match (command, data) {
            (Command::Go, _) => {
                if device.is_running() {
                    Ok(format!("{} RUNNING", RESULT_OK))
                } else if device.start().await? {
                    Ok(RESULT_OK.to_string())
                } else {
                    Ok(rejected())
                }
            }
            (Command::Stop, _) => {
                let was_running = device.is_running();
                device.stop().await?;
                if was_running {
                    Ok(format!("{} STOPPED", RESULT_OK))
                } else {
                    Ok(RESULT_OK.to_string())
                }
            }
            (Command::Freq, None) => Ok(format_float(device.frequency().await?)),
            (Command::Freq, Some(data)) => {
                let freq = self.lenient(command, data);
                if device.set_frequency(freq).await? {
                    Ok(format_tune(
                        device.was_tune_successful(),
                        &device.last_tune_result(),
                    ))
                } else {
                    Ok(rejected())
                }
            }
            (Command::Gain, None) => Ok(format_float(device.gain().await?)),
            (Command::Gain, Some(data)) => {
                let gain = self.lenient(command, data);
                if device.set_gain(gain).await? {
                    Ok(RESULT_OK.to_string())
                } else {
                    Ok(rejected())
                }
            }
            (Command::Rate, None) => Ok(format_float(device.sample_rate().await?)),
            (Command::Rate, Some(data)) => {
                let rate = self.lenient(command, data);
                if device.set_sample_rate(rate).await? {
                    Ok(format!(
                        "{} {}",
                        RESULT_OK,
                        format_float(device.sample_rate().await?)
                    ))
                } else {
                    Ok(rejected())
                }
            }
            (Command::Antenna, None) => Ok(device
                .antenna()
                .await?
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| RESULT_UNKNOWN.to_string())),
            (Command::Antenna, Some(data)) => {
                if device.set_antenna(AntennaSelector::from(data)).await? {
                    Ok(RESULT_OK.to_string())
                } else {
                    Ok(rejected())
                }
            }
            _ => Ok(RESULT_UNKNOWN.to_string()),
        }
    }

    fn lenient(&self, command: &Command, data: &str) -> f64 {
        let (value, parsed) = parse_lenient(data);
        if !parsed {
            tracing::warn!(session = self.id, command = %command, data = %data, "Unparsable number, using 0");
        }
        value
    }

    async fn select_device(&mut self, hint: Option<&str>) -> Result<String> {
        let mut error = None;

        if let (false, Some(hint)) = (self.locked(), hint) {
            self.release_device().await;

            if hint != RELEASE_DEVICE {
                match self.ctx.registry.create(hint).await {
                    Ok(device) => match device.set_destination(&self.peer_ip()).await {
                        Ok(true) => self.device = Some(device),
                        _ => {
                            error = Some(TRANSPORT_INIT_FAILED.to_string());
                            if let Err(e) = device.close().await {
                                tracing::debug!(session = self.id, error = %e, "Close after failed init also failed");
                            }
                        }
                    },
                    Err(e) => error = Some(e.to_string()),
                }
            }
        }

        Ok(format!(
            "{}{}",
            self.describe().await,
            format_error(error.as_deref())
        ))
    }

    async fn destination(&mut self, data: Option<&str>) -> Result<String> {
        let Some(data) = data else {
            return Ok(self.current_destination().await?.to_string());
        };
        let target = if data == NO_DEVICE {
            self.peer_ip()
        } else {
            data.to_string()
        };

        let applied = match &self.device {
            Some(device) => device.set_destination(&target).await?,
            None => match Destination::parse(&target, self.detached.default_port) {
                Some(dest) => {
                    self.detached.destination = dest;
                    true
                }
                None => false,
            },
        };
        if applied {
            Ok(format!("{} {}", RESULT_OK, self.current_destination().await?))
        } else {
            Ok(fail(Some("Failed to set destination")))
        }
    }

    async fn current_destination(&self) -> Result<Destination> {
        match &self.device {
            Some(device) => device.destination().await,
            None => Ok(self.detached.destination.clone()),
        }
    }

    async fn header(&mut self, data: Option<&str>) -> Result<String> {
        let Some(data) = data else {
            let enabled = match &self.device {
                Some(device) => device.header().await?,
                None => self.detached.header,
            };
            return Ok(if enabled { "ON" } else { "OFF" }.to_string());
        };

        let enable = match data.to_ascii_uppercase().as_str() {
            "ON" => true,
            "OFF" => false,
            _ => return Ok(fail(Some(&format!("Invalid header mode: {}", data)))),
        };
        let applied = match &self.device {
            Some(device) => device.set_header(enable).await?,
            None => {
                self.detached.header = enable;
                true
            }
        };
        if applied {
            Ok(RESULT_OK.to_string())
        } else {
            Ok(fail(None))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
