//! BorIP client proxy.
//!
//! [`BoripClient`] drives a remote receiver over the BorIP control channel
//! and receives its samples over UDP. It implements [`Device`] and
//! [`NetworkTransport`], so it can stand in wherever a local device is
//! expected.
//!
//! Connection sequence: TCP connect (retrying refused connections within
//! the reconnect budget), read the `DEVICE` greeting, select a device if
//! none is selected or a hint was configured, negotiate the sample rate,
//! start the UDP receiver, replay the last known antenna, frequency, and
//! gain, then `GO` and start the keepalive.
//!
//! A transport failure during any exchange tears the connection down and
//! runs the reconnect loop. When the budget is spent the sample stream is
//! ended instead: the payload channel closes and
//! [`ClientEvent::EndOfStream`] is broadcast.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use borip_core::device::{Device, resolve_antenna};
use borip_core::error::{Error, Result};
use borip_core::transport::{
    BYTES_PER_SAMPLE, Destination, NetworkTransport, clamp_payload_size,
};
use borip_core::types::{AntennaSelector, GainRange, TuneResult, TuneStatus};
use borip_protocol::Descriptor;
use borip_protocol::codec::{
    Command, NO_DEVICE, RESULT_DEVICE, RESULT_FAIL, RESULT_UNKNOWN, Request, Response,
    format_float, parse_tune, unescape_error,
};
use borip_transport::{ControlConnection, UdpSampleSource, is_connection_refused};

use crate::keepalive::Keepalive;
use crate::options::{ClientOptions, LISTEN_ONLY_PACKET_SAMPLES, ServerAddress};

/// Broadcast channel capacity for [`ClientEvent`] subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Name reported before a device descriptor has been received.
const REMOTE_NAME: &str = "(Remote device)";

/// Master clock assumed before a device descriptor has been received.
const DEFAULT_MASTER_CLOCK: f64 = 64e6;

/// Antenna list reported when the server sent none.
const DEFAULT_ANTENNA: &str = "(default)";

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A session is established and streaming.
    Connected,
    /// The control connection was lost or closed.
    Disconnected,
    /// Reconnect attempt `attempt` (1-based) is starting.
    Reconnecting { attempt: u32 },
    /// The sample stream has ended for good.
    EndOfStream,
}

/// Settings replayed on every new session.
#[derive(Debug, Clone, Default, PartialEq)]
struct LastKnown {
    frequency: Option<f64>,
    gain: Option<f64>,
    antenna: Option<String>,
}

#[derive(Debug, Default)]
struct RemoteState {
    address: Option<ServerAddress>,
    descriptor: Option<Descriptor>,
    last_known: LastKnown,
    created: bool,
    listen_only: bool,
    running: bool,
    packet_size: usize,
    last_error: Option<String>,
    last_tune: Option<TuneResult>,
    tune_status: Option<TuneStatus>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A remote BorIP receiver.
///
/// # Example
///
/// ```no_run
/// use borip_client::{BoripClient, ClientOptions};
/// use borip_core::Device;
///
/// # async fn example() -> borip_core::Result<()> {
/// let client = BoripClient::new(ClientOptions::new().which("rtl"));
/// client.connect(Some("192.168.1.20")).await?;
/// client.set_freq(100e6).await?;
/// client.set_gain(20.0).await?;
///
/// let mut samples = client.take_samples().expect("stream already taken");
/// while let Some(payload) = samples.recv().await {
///     println!("{} bytes", payload.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct BoripClient {
    options: ClientOptions,
    /// Control connection. Held for the whole of each exchange.
    conn: Arc<Mutex<Option<ControlConnection>>>,
    state: StdMutex<RemoteState>,
    attempts_to_go: AtomicI32,
    /// Cancelled by a user-initiated [`destroy`](Self::destroy).
    closing: StdMutex<CancellationToken>,
    keepalive: StdMutex<Option<Keepalive>>,
    source: StdMutex<Option<Arc<UdpSampleSource>>>,
    samples: StdMutex<Option<mpsc::Receiver<Bytes>>>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl BoripClient {
    /// A disconnected client. Call [`connect`](Self::connect) next.
    pub fn new(options: ClientOptions) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            attempts_to_go: AtomicI32::new(options.reconnect_attempts),
            options,
            conn: Arc::new(Mutex::new(None)),
            state: StdMutex::new(RemoteState::default()),
            closing: StdMutex::new(CancellationToken::new()),
            keepalive: StdMutex::new(None),
            source: StdMutex::new(None),
            samples: StdMutex::new(None),
            event_tx,
        }
    }

    /// Create a client and connect it to `address`.
    pub async fn connect_to(address: &str, options: ClientOptions) -> Result<Self> {
        let client = Self::new(options);
        client.connect(Some(address)).await?;
        Ok(client)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// The descriptor of the remote device, if one is selected.
    pub fn descriptor(&self) -> Option<Descriptor> {
        lock(&self.state).descriptor.clone()
    }

    /// Whether a control session is established.
    pub fn is_created(&self) -> bool {
        lock(&self.state).created
    }

    pub fn is_listen_only(&self) -> bool {
        lock(&self.state).listen_only
    }

    /// Expected datagram payload size in bytes.
    pub fn packet_size(&self) -> usize {
        lock(&self.state).packet_size
    }

    /// Take the sample payload channel. It closes at end of stream.
    pub fn take_samples(&self) -> Option<mpsc::Receiver<Bytes>> {
        lock(&self.samples).take()
    }

    /// The UDP receiver, for its counters and local address.
    pub fn source(&self) -> Option<Arc<UdpSampleSource>> {
        lock(&self.source).clone()
    }

    fn closing(&self) -> CancellationToken {
        lock(&self.closing).clone()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Connect to `address` (`host[:port]`), or to the configured default
    /// server when `None`. An address of `-` only starts the UDP receiver.
    ///
    /// Previously known settings are forgotten.
    pub async fn connect(&self, address: Option<&str>) -> Result<()> {
        let address = self.options.resolve(address)?;

        *lock(&self.closing) = CancellationToken::new();
        self.drop_connection().await;
        {
            let mut state = lock(&self.state);
            state.address = Some(address.clone());
            state.last_known = LastKnown::default();
            state.listen_only = address.is_listen_only();
        }

        if address.is_listen_only() {
            let packet_size = self
                .options
                .packet_size
                .unwrap_or(LISTEN_ONLY_PACKET_SAMPLES * BYTES_PER_SAMPLE);
            lock(&self.state).packet_size = packet_size;
            self.ensure_source(address.udp_port, packet_size).await?;
            tracing::info!(
                udp_port = address.udp_port,
                packet_size,
                "BorIP client only listening"
            );
            return Ok(());
        }

        self.establish(&address, false).await
    }

    /// Close the session and end the sample stream. No reconnection is
    /// attempted afterwards.
    pub async fn destroy(&self) {
        self.closing().cancel();
        let was_created = self.is_created();
        self.drop_connection().await;

        let source = lock(&self.source).take();
        if let Some(source) = source {
            source.close().await;
        }
        lock(&self.state).listen_only = false;

        if was_created {
            self.emit(ClientEvent::Disconnected);
        }
        tracing::debug!("BorIP client destroyed");
    }

    /// Stop the keepalive and close the control connection.
    async fn drop_connection(&self) {
        let keepalive = lock(&self.keepalive).take();
        if let Some(keepalive) = keepalive {
            keepalive.stop();
        }

        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            conn.close().await;
        }

        let mut state = lock(&self.state);
        state.created = false;
        state.running = false;
    }

    /// Sleep for the reconnect interval. Returns `false` if the client was
    /// destroyed meanwhile.
    async fn pause(&self) -> bool {
        let closing = self.closing();
        tokio::select! {
            _ = closing.cancelled() => false,
            _ = tokio::time::sleep(self.options.reconnect_interval) => true,
        }
    }

    /// TCP connect, retrying refused connections within the budget unless
    /// this is already a reconnect.
    async fn open_control(&self, address: &ServerAddress, reconnect: bool) -> Result<ControlConnection> {
        let addr = address.control_addr();
        let budget = self.options.reconnect_attempts;
        let mut remaining = budget;

        loop {
            match ControlConnection::connect_with_timeout(&addr, self.options.connect_timeout).await
            {
                Ok(conn) => return Ok(conn),
                Err(e)
                    if is_connection_refused(&e)
                        && !reconnect
                        && (budget < 0 || remaining > 0) =>
                {
                    if budget > 0 {
                        tracing::warn!(addr = %addr, remaining, "Connection refused, trying again");
                    } else {
                        tracing::warn!(addr = %addr, "Connection refused, trying again");
                    }
                    remaining -= 1;
                    if !self.pause().await {
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "Failed to connect to server");
                    return Err(e);
                }
            }
        }
    }

    /// Run the full connection sequence and install the new session.
    async fn establish(&self, address: &ServerAddress, reconnect: bool) -> Result<()> {
        let timeout = self.options.command_timeout;
        let mut conn = self.open_control(address, reconnect).await?;
        self.attempts_to_go
            .store(self.options.reconnect_attempts, Ordering::SeqCst);

        let greeting = Response::parse(&conn.recv_line(timeout).await?)?;
        if greeting.is_busy() {
            tracing::warn!(addr = %conn.addr(), "Server is busy");
            return Err(Error::Busy);
        }
        if greeting.command != RESULT_DEVICE {
            return Err(Error::Protocol(format!(
                "Unexpected greeting: {}",
                greeting.command
            )));
        }
        let mut descriptor = Descriptor::parse_optional(greeting.result().unwrap_or(NO_DEVICE))?;

        if descriptor.is_none() || self.options.which.is_some() {
            let hint = self.options.device_hint();
            let request = Request::new(Command::Device, Some(hint.clone()));
            let response = round_trip(&mut conn, &request, timeout).await?;
            if response.result() == Some(NO_DEVICE) {
                if let Some(err) = response.data() {
                    return Err(Error::Device(format!(
                        "Failed to create device: \"{}\"",
                        unescape_error(err)
                    )));
                }
                descriptor = None;
            } else {
                descriptor = Descriptor::parse_optional(response.result().unwrap_or(NO_DEVICE))?;
            }
            tracing::debug!(hint = %hint, selected = descriptor.is_some(), "Device selected");
        }

        let master_clock = descriptor
            .as_ref()
            .map_or(DEFAULT_MASTER_CLOCK, |d| d.master_clock);
        let packet_size = descriptor
            .as_ref()
            .map(Descriptor::payload_size)
            .or(self.options.packet_size)
            .unwrap_or(LISTEN_ONLY_PACKET_SAMPLES * BYTES_PER_SAMPLE);
        {
            let mut state = lock(&self.state);
            state.descriptor = descriptor;
            state.packet_size = packet_size;
        }

        if let Some(rate) = self.options.sample_rate {
            expect_ok(&mut conn, &Request::new(Command::Rate, Some(format_float(rate))), timeout)
                .await?;
        } else if let Some(decim) = self.options.decim_rate {
            let rate = master_clock / f64::from(decim.max(1));
            let request = Request::new(Command::Rate, Some(format_float(rate)));
            if !round_trip(&mut conn, &request, timeout).await?.is_ok() {
                return Err(Error::Config(format!(
                    "Invalid decimation: {} (sample rate: {})",
                    decim, rate
                )));
            }
        }

        self.ensure_source(address.udp_port, packet_size).await?;

        let last_known = lock(&self.state).last_known.clone();
        if let Some(antenna) = last_known.antenna {
            replay(&mut conn, Request::new(Command::Antenna, Some(antenna)), timeout).await?;
        }
        if let Some(freq) = last_known.frequency {
            replay(&mut conn, Request::new(Command::Freq, Some(format_float(freq))), timeout)
                .await?;
        }
        if let Some(gain) = last_known.gain {
            replay(&mut conn, Request::new(Command::Gain, Some(format_float(gain))), timeout)
                .await?;
        }

        expect_ok(&mut conn, &Request::query(Command::Go), timeout).await?;

        tracing::info!(addr = %conn.addr(), reconnect, "BorIP session established");
        *self.conn.lock().await = Some(conn);
        {
            let mut state = lock(&self.state);
            state.created = true;
            state.running = true;
        }
        let keepalive = Keepalive::spawn(
            Arc::clone(&self.conn),
            self.options.keepalive_interval,
            timeout,
        );
        if let Some(previous) = lock(&self.keepalive).replace(keepalive) {
            previous.stop();
        }
        self.emit(ClientEvent::Connected);
        Ok(())
    }

    /// Start the UDP receiver unless one is already running.
    async fn ensure_source(&self, udp_port: u16, packet_size: usize) -> Result<()> {
        if lock(&self.source).as_ref().is_some_and(|s| !s.is_closed()) {
            return Ok(());
        }
        let (source, samples) = UdpSampleSource::bind(
            &format!("0.0.0.0:{}", udp_port),
            packet_size,
            self.options.header,
        )
        .await?;
        tracing::debug!(local_addr = %source.local_addr(), packet_size, "UDP receiver listening");
        *lock(&self.source) = Some(Arc::new(source));
        *lock(&self.samples) = Some(samples);
        Ok(())
    }

    /// Close the sample stream and tell subscribers.
    fn end_of_stream(&self) {
        tracing::warn!("Reconnect attempts exhausted, ending sample stream");
        if let Some(source) = lock(&self.source).as_ref() {
            source.signal_eos();
        }
        self.emit(ClientEvent::EndOfStream);
    }

    /// Tear down after a transport failure and try to reconnect.
    ///
    /// Returns `true` once a new session is established.
    async fn recover(&self) -> bool {
        self.drop_connection().await;
        let closing = self.closing();
        if closing.is_cancelled() {
            return false;
        }
        self.emit(ClientEvent::Disconnected);

        let Some(address) = lock(&self.state).address.clone() else {
            return false;
        };

        let mut attempt = 0u32;
        loop {
            let to_go = self.attempts_to_go.load(Ordering::SeqCst);
            if to_go == 0 {
                break;
            }
            if to_go > 0 {
                tracing::info!(remaining = to_go, "Reconnect attempts remaining");
                self.attempts_to_go.store(to_go - 1, Ordering::SeqCst);
            }
            attempt += 1;
            self.emit(ClientEvent::Reconnecting { attempt });

            match self.establish(&address, true).await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect failed");
                    if closing.is_cancelled() || !self.pause().await {
                        return false;
                    }
                }
            }
        }

        self.end_of_stream();
        false
    }

    // -----------------------------------------------------------------
    // Exchanges
    // -----------------------------------------------------------------

    /// Send `request` and read its response, reconnecting once on a
    /// transport failure and retrying on the new session.
    ///
    /// A response that does not echo the request's command means the
    /// stream is out of step, and is handled as a transport failure.
    async fn exchange(&self, request: Request) -> Result<Response> {
        if self.is_listen_only() {
            return Err(Error::NotConnected);
        }

        let mut recovered = false;
        loop {
            let result = {
                let mut guard = self.conn.lock().await;
                match guard.as_mut() {
                    Some(conn) => round_trip(conn, &request, self.options.command_timeout)
                        .await
                        .and_then(|response| check_echo(&request, response)),
                    // The keepalive dropped a failed connection.
                    None if self.is_created() => Err(Error::ConnectionLost),
                    None => return Err(Error::NotConnected),
                }
            };

            match result {
                Ok(response) => {
                    self.record_failure(&response);
                    return Ok(response);
                }
                Err(e) if e.is_transport() && !recovered => {
                    tracing::warn!(command = %request.command, error = %e, "Control connection failed");
                    if !self.recover().await {
                        return Err(e);
                    }
                    recovered = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_failure(&self, response: &Response) {
        if response.command == RESULT_DEVICE {
            return;
        }
        let error = match response.result() {
            Some(RESULT_FAIL) => response
                .data()
                .map(unescape_error)
                .unwrap_or_else(|| format!("{} failed", response.command)),
            Some(RESULT_DEVICE) => "No device selected".to_string(),
            _ => return,
        };
        lock(&self.state).last_error = Some(error);
    }

    /// A setter: `true` if the server replied `OK`.
    async fn set(&self, command: Command, value: String) -> Result<bool> {
        Ok(self.exchange(Request::new(command, Some(value))).await?.is_ok())
    }

    /// A query whose answer sits in the result position.
    async fn query(&self, command: Command) -> Result<String> {
        let response = self.exchange(Request::query(command)).await?;
        match response.result() {
            Some(RESULT_DEVICE) => Err(Error::Device("No device selected".to_string())),
            Some(RESULT_FAIL) => Err(Error::Device(
                response.data().map(unescape_error).unwrap_or_default(),
            )),
            Some(value) => Ok(value.to_string()),
            None => Err(Error::Protocol(format!(
                "Response without result: {}",
                response.command
            ))),
        }
    }

    async fn query_number(&self, command: Command) -> Result<f64> {
        let value = self.query(command.clone()).await?;
        value
            .parse()
            .map_err(|_| Error::Protocol(format!("Malformed {} response: {}", command, value)))
    }

    // -----------------------------------------------------------------
    // Command helpers
    // -----------------------------------------------------------------

    /// Tune to `freq` hertz. Returns the tune result reported by the
    /// server, `None` if it refused.
    pub async fn set_freq(&self, freq: f64) -> Result<Option<TuneResult>> {
        let response = self
            .exchange(Request::new(Command::Freq, Some(format_float(freq))))
            .await?;
        let Some(status) = response.result().and_then(TuneStatus::from_token) else {
            return Ok(None);
        };
        let result = parse_tune(response.data().unwrap_or_default())?;

        let mut state = lock(&self.state);
        state.last_known.frequency = Some(freq);
        state.last_tune = Some(result);
        state.tune_status = Some(status);
        Ok(Some(result))
    }

    /// Select an antenna by name.
    pub async fn select_rx_antenna(&self, antenna: &str) -> Result<bool> {
        let ok = self.set(Command::Antenna, antenna.to_string()).await?;
        if ok {
            lock(&self.state).last_known.antenna = Some(antenna.to_string());
        }
        Ok(ok)
    }

    /// Request `master_clock / decim` as the sample rate.
    pub async fn set_decim_rate(&self, decim: u32) -> Result<bool> {
        if decim == 0 {
            return Err(Error::Config("Decimation rate must be positive".to_string()));
        }
        let rate = self.master_clock() / f64::from(decim);
        self.set(Command::Rate, format_float(rate)).await
    }

    /// Start streaming.
    pub async fn go(&self) -> Result<bool> {
        let ok = self.exchange(Request::query(Command::Go)).await?.is_ok();
        if ok {
            lock(&self.state).running = true;
        }
        Ok(ok)
    }
}

impl Drop for BoripClient {
    fn drop(&mut self) {
        lock(&self.closing).cancel();
        if let Some(keepalive) = lock(&self.keepalive).take() {
            keepalive.stop();
        }
        if let Some(source) = lock(&self.source).as_ref() {
            source.signal_eos();
        }
    }
}

/// One request/response exchange on `conn`.
async fn round_trip(
    conn: &mut ControlConnection,
    request: &Request,
    timeout: std::time::Duration,
) -> Result<Response> {
    let line = request.to_string();
    tracing::debug!(addr = %conn.addr(), command = %line, "->");
    conn.send_line(&line).await?;
    let reply = conn.recv_line(timeout).await?;
    tracing::debug!(addr = %conn.addr(), response = %reply, "<-");
    Response::parse(&reply)
}

/// Require `response` to answer `request`.
fn check_echo(request: &Request, response: Response) -> Result<Response> {
    if response.command != request.command.as_str() {
        return Err(Error::Transport(format!(
            "Out-of-step response to {}: {}",
            request.command, response.command
        )));
    }
    Ok(response)
}

/// Exchange `request` and require an `OK` result echoing the command.
async fn expect_ok(
    conn: &mut ControlConnection,
    request: &Request,
    timeout: std::time::Duration,
) -> Result<Response> {
    let response = round_trip(conn, request, timeout).await?;
    if response.command != request.command.as_str() {
        return Err(Error::Protocol(format!(
            "Received command {} != {}",
            response.command, request.command
        )));
    }
    if !response.is_ok() {
        let detail = response.data().map(unescape_error).unwrap_or_default();
        return Err(Error::Device(
            format!(
                "Expecting OK, received {} {}",
                response.result().unwrap_or_default(),
                detail
            )
            .trim_end()
            .to_string(),
        ));
    }
    Ok(response)
}

/// Re-apply a remembered setting; a refusal is logged, not fatal.
async fn replay(
    conn: &mut ControlConnection,
    request: Request,
    timeout: std::time::Duration,
) -> Result<()> {
    let response = round_trip(conn, &request, timeout).await?;
    let accepted = response.is_ok() || response.result().and_then(TuneStatus::from_token).is_some();
    if !accepted {
        tracing::warn!(command = %request, result = ?response.result(), "Replayed setting refused");
    }
    Ok(())
}

#[async_trait]
impl Device for BoripClient {
    fn name(&self) -> String {
        lock(&self.state)
            .descriptor
            .as_ref()
            .map_or_else(|| REMOTE_NAME.to_string(), |d| d.name.clone())
    }

    fn serial(&self) -> String {
        match lock(&self.state).descriptor.as_ref() {
            Some(d) if !d.serial.is_empty() => d.serial.clone(),
            Some(d) => d.name.clone(),
            None => REMOTE_NAME.to_string(),
        }
    }

    fn gain_range(&self) -> GainRange {
        lock(&self.state)
            .descriptor
            .as_ref()
            .map_or_else(GainRange::default, |d| d.gain_range)
    }

    fn master_clock(&self) -> f64 {
        lock(&self.state)
            .descriptor
            .as_ref()
            .map_or(DEFAULT_MASTER_CLOCK, |d| d.master_clock)
    }

    fn samples_per_packet(&self) -> usize {
        self.packet_size() / BYTES_PER_SAMPLE
    }

    fn antennas(&self) -> Vec<String> {
        match lock(&self.state).descriptor.as_ref() {
            Some(d) if !d.antennas.is_empty() => d.antennas.clone(),
            _ => vec![DEFAULT_ANTENNA.to_string()],
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    async fn open(&self) -> Result<bool> {
        if self.is_created() {
            return Ok(true);
        }
        let address = lock(&self.state).address.clone();
        let address = address.map(|a| a.control_addr());
        match self.connect(address.as_deref()).await {
            Ok(()) => Ok(true),
            Err(Error::Device(msg)) => {
                lock(&self.state).last_error = Some(msg);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<()> {
        self.destroy().await;
        Ok(())
    }

    async fn start(&self) -> Result<bool> {
        self.go().await
    }

    async fn stop(&self) -> Result<bool> {
        if !self.is_created() {
            return Ok(true);
        }
        let ok = self.exchange(Request::query(Command::Stop)).await?.is_ok();
        if ok {
            lock(&self.state).running = false;
        }
        Ok(ok)
    }

    async fn gain(&self) -> Result<f64> {
        self.query_number(Command::Gain).await
    }

    async fn set_gain(&self, gain: f64) -> Result<bool> {
        let ok = self.set(Command::Gain, format_float(gain)).await?;
        if ok {
            lock(&self.state).last_known.gain = Some(gain);
        }
        Ok(ok)
    }

    async fn sample_rate(&self) -> Result<f64> {
        self.query_number(Command::Rate).await
    }

    async fn set_sample_rate(&self, rate: f64) -> Result<bool> {
        if !(rate > 0.0) {
            lock(&self.state).last_error = Some(format!("Invalid sample rate: {}", rate));
            return Ok(false);
        }
        self.set(Command::Rate, format_float(rate)).await
    }

    async fn frequency(&self) -> Result<f64> {
        self.query_number(Command::Freq).await
    }

    async fn set_frequency(&self, freq: f64) -> Result<bool> {
        Ok(self.set_freq(freq).await?.is_some())
    }

    fn last_tune_result(&self) -> TuneResult {
        let state = lock(&self.state);
        state.last_tune.unwrap_or_else(|| {
            let freq = state.last_known.frequency.unwrap_or_default();
            TuneResult::new(freq, freq)
        })
    }

    /// The status the server reported for the last tune.
    fn was_tune_successful(&self) -> TuneStatus {
        lock(&self.state).tune_status.unwrap_or(TuneStatus::Ok)
    }

    async fn antenna(&self) -> Result<Option<String>> {
        let value = self.query(Command::Antenna).await?;
        Ok((value != RESULT_UNKNOWN).then_some(value))
    }

    async fn set_antenna(&self, antenna: AntennaSelector) -> Result<bool> {
        let Some(name) = resolve_antenna(&antenna, &self.antennas()) else {
            lock(&self.state).last_error = Some(format!("Invalid antenna: {:?}", antenna));
            return Ok(false);
        };
        self.select_rx_antenna(&name).await
    }
}

#[async_trait]
impl NetworkTransport for BoripClient {
    async fn destination(&self) -> Result<Destination> {
        let value = self.query(Command::Dest).await?;
        let default_port = lock(&self.state)
            .address
            .as_ref()
            .map_or(self.options.default_port, |a| a.udp_port);
        Destination::parse(&value, default_port)
            .ok_or_else(|| Error::Protocol(format!("Malformed DEST response: {}", value)))
    }

    async fn set_destination(&self, dest: &str) -> Result<bool> {
        self.set(Command::Dest, dest.to_string()).await
    }

    async fn header(&self) -> Result<bool> {
        Ok(self.query(Command::Header).await? == "ON")
    }

    async fn set_header(&self, enable: bool) -> Result<bool> {
        let mode = if enable { "ON" } else { "OFF" };
        let ok = self.set(Command::Header, mode.to_string()).await?;
        if ok {
            if let Some(source) = lock(&self.source).as_ref() {
                source.set_header(enable);
            }
        }
        Ok(ok)
    }

    async fn payload_size(&self) -> Result<usize> {
        Ok(self.packet_size())
    }

    /// The server dictates the payload size through its descriptor; this
    /// only changes what the local receiver expects.
    async fn set_payload_size(&self, size: usize) -> Result<bool> {
        lock(&self.state).packet_size = clamp_payload_size(size);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use borip_server::{BoripServer, DeviceRegistry, ServerOptions, sim};
    use borip_test_harness::{AfterScript, MockBoripServer};
    use borip_transport::{PacketFlags, PacketHeader};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, UdpSocket};

    const RTL: &str = "rtl-sdr|0.0|49.6|0.1|2048000|1024|Receive|0001";

    fn options() -> ClientOptions {
        ClientOptions::new()
            .udp_port(0)
            .keepalive_interval(Duration::from_secs(60))
            .command_timeout(Duration::from_secs(2))
            .reconnect_interval(Duration::from_millis(10))
    }

    fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn connect_selects_device_and_streams() {
        let mut server = MockBoripServer::new().await.unwrap();
        server.expect("DEVICE rtl", &format!("DEVICE {}", RTL));
        server.expect("GO", "GO OK");
        server.expect(
            "FREQ 100000000.0",
            "FREQ OK 100000000.000000 100000000.000000 0.000000 0.000000",
        );
        server.expect("GAIN 20.0", "GAIN OK");
        server.expect("GAIN", "GAIN 20.0");
        server.expect("ANTENNA Receive", "ANTENNA OK");
        server.expect("RATE 0.5", "RATE FAIL Invalid sample rate: 0.5");
        let addr = server.addr().to_string();
        server.start();

        let client = BoripClient::new(options().which("rtl"));
        let mut events = client.subscribe();
        client.connect(Some(&addr)).await.unwrap();

        assert!(client.is_created());
        assert!(client.is_running());
        assert_eq!(client.name(), "rtl-sdr");
        assert_eq!(client.serial(), "0001");
        assert_eq!(client.master_clock(), 2_048_000.0);
        assert_eq!(client.packet_size(), 4096);
        assert_eq!(client.antennas(), vec!["Receive".to_string()]);

        let tune = client.set_freq(100e6).await.unwrap().unwrap();
        assert_eq!(tune.actual_rf_freq, 100e6);
        assert_eq!(client.was_tune_successful(), TuneStatus::Ok);
        assert!(client.set_gain(20.0).await.unwrap());
        assert_eq!(client.gain().await.unwrap(), 20.0);
        assert!(client.set_antenna(0.into()).await.unwrap());
        assert!(!client.set_antenna(3.into()).await.unwrap());
        assert!(!client.set_sample_rate(0.5).await.unwrap());
        assert_eq!(client.last_error().as_deref(), Some("Invalid sample rate: 0.5"));

        client.destroy().await;
        assert_eq!(
            drain(&mut events),
            vec![ClientEvent::Connected, ClientEvent::Disconnected]
        );
        let lines = server.wait().await.unwrap();
        assert_eq!(lines.len(), 7);
    }

    #[tokio::test]
    async fn greeting_with_device_skips_selection() {
        let mut server = MockBoripServer::new().await.unwrap();
        server.greeting(&format!("DEVICE {}", RTL));
        server.expect("RATE 256000.0", "RATE OK 256000.0");
        server.expect("GO", "GO OK");
        let addr = server.addr().to_string();
        server.start();

        let client = BoripClient::new(options().decim_rate(8));
        client.connect(Some(&addr)).await.unwrap();
        assert_eq!(client.descriptor().unwrap().name, "rtl-sdr");
        client.destroy().await;
        assert_eq!(server.wait().await.unwrap(), vec!["RATE 256000.0", "GO"]);
    }

    #[tokio::test]
    async fn busy_greeting_is_an_error() {
        let mut server = MockBoripServer::new().await.unwrap();
        server.greeting("BUSY");
        let addr = server.addr().to_string();
        server.start();

        let client = BoripClient::new(options());
        assert!(matches!(client.connect(Some(&addr)).await, Err(Error::Busy)));
        assert!(!client.is_created());
    }

    #[tokio::test]
    async fn unexpected_greeting_is_a_protocol_error() {
        let mut server = MockBoripServer::new().await.unwrap();
        server.greeting("HELLO there");
        let addr = server.addr().to_string();
        server.start();

        let client = BoripClient::new(options());
        match client.connect(Some(&addr)).await {
            Err(Error::Protocol(msg)) => assert!(msg.contains("HELLO"), "got: {}", msg),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_device_creation() {
        let mut server = MockBoripServer::new().await.unwrap();
        server.expect("DEVICE nosuch", "DEVICE - No such module: NOSUCH");
        let addr = server.addr().to_string();
        server.start();

        let client = BoripClient::new(options().which("nosuch"));
        match client.connect(Some(&addr)).await {
            Err(Error::Device(msg)) => assert!(msg.contains("NOSUCH"), "got: {}", msg),
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn refused_connect_retries_within_budget() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let interval = Duration::from_millis(30);
        let client = BoripClient::new(options().reconnect_attempts(2).reconnect_interval(interval));
        let started = tokio::time::Instant::now();
        let err = client.connect(Some(&addr)).await.unwrap_err();
        assert!(is_connection_refused(&err));
        assert!(started.elapsed() >= interval * 2);

        let client = BoripClient::new(options());
        assert!(client.connect(None).await.is_err());
    }

    async fn dropped_session(budget: i32) -> (BoripClient, broadcast::Receiver<ClientEvent>) {
        let mut server = MockBoripServer::new().await.unwrap();
        server.greeting(&format!("DEVICE {}", RTL));
        server.expect("GO", "GO OK");
        server.after_script(AfterScript::Close);
        let addr = server.addr().to_string();
        server.start();

        let client = BoripClient::new(options().reconnect_attempts(budget));
        let events = client.subscribe();
        client.connect(Some(&addr)).await.unwrap();
        server.wait().await.unwrap();
        (client, events)
    }

    #[tokio::test]
    async fn reconnect_budget_exhausted_ends_stream() {
        let (client, mut events) = dropped_session(2).await;
        let mut samples = client.take_samples().unwrap();

        assert!(client.set_gain(1.0).await.is_err());
        assert_eq!(
            drain(&mut events),
            vec![
                ClientEvent::Connected,
                ClientEvent::Disconnected,
                ClientEvent::Reconnecting { attempt: 1 },
                ClientEvent::Reconnecting { attempt: 2 },
                ClientEvent::EndOfStream,
            ]
        );
        let end = tokio::time::timeout(Duration::from_secs(2), samples.recv()).await;
        assert_eq!(end.unwrap(), None);
        assert!(!client.is_created());
    }

    #[tokio::test]
    async fn zero_budget_never_reconnects() {
        let (client, mut events) = dropped_session(0).await;

        assert!(client.gain().await.is_err());
        assert_eq!(
            drain(&mut events),
            vec![
                ClientEvent::Connected,
                ClientEvent::Disconnected,
                ClientEvent::EndOfStream,
            ]
        );
    }

    #[tokio::test]
    async fn response_for_another_command_forces_reconnect() {
        let mut server = MockBoripServer::new().await.unwrap();
        server.greeting(&format!("DEVICE {}", RTL));
        server.expect("GO", "GO OK");
        server.expect("GAIN 10.0", "PING OK");
        let addr = server.addr().to_string();
        server.start();

        let client = BoripClient::new(options());
        let mut events = client.subscribe();
        client.connect(Some(&addr)).await.unwrap();

        assert!(matches!(client.set_gain(10.0).await, Err(Error::Transport(_))));
        assert_eq!(client.last_error(), None);
        assert_eq!(
            drain(&mut events),
            vec![
                ClientEvent::Connected,
                ClientEvent::Disconnected,
                ClientEvent::EndOfStream,
            ]
        );
        assert_eq!(server.wait().await.unwrap(), vec!["GO", "GAIN 10.0"]);
    }

    /// Two sessions: the first answers `PING` only after `ping_delay`, the
    /// second refuses every `GAIN`. Returns the lines each session received.
    async fn late_ping_server(
        ping_delay: Duration,
    ) -> (String, tokio::task::JoinHandle<Vec<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut sessions = Vec::new();
            for session in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let (reader, mut writer) = stream.into_split();
                let greeting = format!("DEVICE {}\n", RTL);
                writer.write_all(greeting.as_bytes()).await.unwrap();

                let mut seen = Vec::new();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    let reply = match line.split(' ').next().unwrap_or_default() {
                        "GO" => "GO OK",
                        "PING" => {
                            if session == 0 {
                                tokio::time::sleep(ping_delay).await;
                            }
                            "PING OK"
                        }
                        "GAIN" => "GAIN FAIL nope",
                        _ => "UNKNOWN UNKNOWN",
                    };
                    seen.push(line);
                    let reply = format!("{}\n", reply);
                    if writer.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
                sessions.push(seen);
            }
            sessions
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn late_keepalive_reply_is_never_taken_for_a_command_response() {
        let (addr, server) = late_ping_server(Duration::from_millis(300)).await;

        let client = BoripClient::new(
            options()
                .reconnect_attempts(1)
                .keepalive_interval(Duration::from_millis(50))
                .command_timeout(Duration::from_millis(100)),
        );
        let mut events = client.subscribe();
        client.connect(Some(&addr)).await.unwrap();

        // Let the keepalive time out on the slow PING.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(!client.set_gain(10.0).await.unwrap());
        assert_eq!(client.last_error().as_deref(), Some("nope"));
        assert_eq!(
            drain(&mut events),
            vec![
                ClientEvent::Connected,
                ClientEvent::Disconnected,
                ClientEvent::Reconnecting { attempt: 1 },
                ClientEvent::Connected,
            ]
        );

        client.destroy().await;
        let sessions = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sessions[0], vec!["GO", "PING"]);
        assert_eq!(sessions[1][0], "GO");
        assert_eq!(
            sessions[1].iter().filter(|l| l.starts_with("GAIN")).count(),
            1
        );
    }

    fn sim_server(port: u16) -> BoripServer {
        let mut registry = DeviceRegistry::new(28888);
        sim::register(&mut registry);
        let options = ServerOptions::new()
            .bind_host("127.0.0.1")
            .listen_port(port)
            .bind_retry_interval(Duration::from_millis(20));
        BoripServer::new(options, registry)
    }

    #[tokio::test]
    async fn reconnect_replays_last_known_settings() {
        let mut server = sim_server(0);
        let port = server.start().await.unwrap().port();

        let client = BoripClient::new(
            options()
                .which("rtl")
                .reconnect_attempts(5)
                .reconnect_interval(Duration::from_millis(50)),
        );
        let mut events = client.subscribe();
        client
            .connect(Some(&format!("127.0.0.1:{}", port)))
            .await
            .unwrap();
        assert!(client.set_freq(100e6).await.unwrap().is_some());
        assert!(client.set_gain(20.0).await.unwrap());

        server.stop().await;
        let mut server = sim_server(port);
        server.start().await.unwrap();

        assert_eq!(client.gain().await.unwrap(), 20.0);
        assert_eq!(client.frequency().await.unwrap(), 100e6);
        assert!(client.is_running());

        let events = drain(&mut events);
        assert!(events.contains(&ClientEvent::Reconnecting { attempt: 1 }));
        assert_eq!(events.last(), Some(&ClientEvent::Connected));

        client.destroy().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn listen_only_receives_without_control_channel() {
        let client = BoripClient::new(options());
        client.connect(Some("-")).await.unwrap();
        assert!(client.is_listen_only());
        assert!(!client.is_created());
        assert_eq!(client.packet_size(), 4096 * 4);
        assert!(matches!(client.gain().await, Err(Error::NotConnected)));

        let port = client.source().unwrap().local_addr().port();
        let mut samples = client.take_samples().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = PacketHeader::new(PacketFlags::STREAM_START, 0).encode().to_vec();
        datagram.extend_from_slice(&[1, 2, 3, 4]);
        sender
            .send_to(&datagram, format!("127.0.0.1:{}", port))
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), samples.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], &[1, 2, 3, 4]);

        client.destroy().await;
        assert!(samples.recv().await.is_none());
    }
}
