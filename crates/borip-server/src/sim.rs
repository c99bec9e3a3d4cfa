//! Simulated receiver backend.
//!
//! [`SimulatedDevice`] behaves like a real tuner from the network's point of
//! view: it honours every [`Device`] and [`NetworkTransport`] operation and,
//! while running, streams a paced I/Q tone plus noise as interleaved 16-bit
//! little-endian samples through a [`UdpSampleSink`].
//!
//! Profiles are defined as factory functions, like hardware model tables:
//!
//! | Profile | Module | Name | Gain (dB) | Clock | Samples/packet | Tuning |
//! |---------|--------|------|-----------|-------|----------------|--------|
//! | [`rtl()`] | `RTL` | rtl-sdr | 0 to 49.6, step 0.1 | 2.048 MHz | 1024 | direct |
//! | [`generic()`] | `SIM` | sim | 0 to 31.5, step 0.5 | 64 MHz | 2048 | 1 MHz RF step + NCO |
//!
//! Hint arguments `serial=` and `name=` override the profile's identity.

use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use borip_core::device::{Device, DeviceState};
use borip_core::error::Result;
use borip_core::hint::DeviceSpec;
use borip_core::stream::{SampleSink, SinkStatus};
use borip_core::transport::{
    Destination, NetworkTransport, SinkTransport, StreamDevice, payload_size_for,
};
use borip_core::types::{AntennaSelector, GainRange, TuneResult};
use borip_transport::UdpSampleSink;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::registry::{DeviceFactory, DeviceRegistry, FactoryContext};

/// Generator pacing interval.
const TICK: Duration = Duration::from_millis(10);

/// Baseband offset of the synthetic tone.
const TONE_OFFSET_HZ: f64 = 10_000.0;

/// Upper bound on samples produced per tick, to survive scheduler stalls.
const MAX_SAMPLES_PER_TICK: usize = 1 << 18;

/// Static description of a simulated receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct SimProfile {
    pub name: String,
    pub serial: String,
    pub gain_range: GainRange,
    pub master_clock: f64,
    pub samples_per_packet: usize,
    pub antennas: Vec<String>,
    /// Sample rate after `open()`.
    pub default_sample_rate: f64,
    /// RF synthesizer step. The remainder is tuned by a 32-bit NCO clocked
    /// at `master_clock`.
    pub tune_step: Option<f64>,
    /// Acceptable tuning error in hertz.
    pub tune_tolerance: Option<f64>,
}

/// An RTL2832-style dongle.
pub fn rtl() -> SimProfile {
    SimProfile {
        name: "rtl-sdr".to_string(),
        serial: "0001".to_string(),
        gain_range: GainRange::new(0.0, 49.6, 0.1),
        master_clock: 2_048_000.0,
        samples_per_packet: 1024,
        antennas: vec!["Receive".to_string()],
        default_sample_rate: 2_048_000.0,
        tune_step: None,
        tune_tolerance: None,
    }
}

/// A wideband receiver with coarse RF tuning and a digital down-converter.
pub fn generic() -> SimProfile {
    SimProfile {
        name: "sim".to_string(),
        serial: "SIM0".to_string(),
        gain_range: GainRange::new(0.0, 31.5, 0.5),
        master_clock: 64_000_000.0,
        samples_per_packet: 2048,
        antennas: vec!["RX2".to_string(), "TX/RX".to_string()],
        default_sample_rate: 1_000_000.0,
        tune_step: Some(1_000_000.0),
        tune_tolerance: Some(1.0),
    }
}

impl SimProfile {
    /// Split `freq` into RF and DSP stages.
    fn tune(&self, freq: f64) -> TuneResult {
        let Some(step) = self.tune_step.filter(|s| *s > 0.0) else {
            return TuneResult::new(freq, freq);
        };
        let actual_rf = (freq / step).round() * step;
        let target_dsp = freq - actual_rf;
        let resolution = self.master_clock / 4_294_967_296.0;
        let actual_dsp = if resolution > 0.0 {
            (target_dsp / resolution).round() * resolution
        } else {
            target_dsp
        };
        TuneResult {
            target_rf_freq: freq,
            actual_rf_freq: actual_rf,
            target_dsp_freq: target_dsp,
            actual_dsp_freq: actual_dsp,
        }
    }
}

struct Generator {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A software-only receiver.
pub struct SimulatedDevice {
    profile: SimProfile,
    state: Arc<DeviceState>,
    sink: Arc<UdpSampleSink>,
    transport: SinkTransport,
    status: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SinkStatus>>>,
    generator: Mutex<Option<Generator>>,
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("profile", &self.profile)
            .field("state", &self.state)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl SimulatedDevice {
    /// An unopened device whose transport defaults to `127.0.0.1:data_port`.
    pub fn new(profile: SimProfile, data_port: u16) -> Self {
        let sink = Arc::new(UdpSampleSink::new());
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        sink.set_status_queue(status_tx);
        let transport = SinkTransport::new(sink.clone(), data_port);
        Self {
            profile,
            state: Arc::new(DeviceState::new()),
            sink,
            transport,
            status: Arc::new(tokio::sync::Mutex::new(status_rx)),
            generator: Mutex::new(None),
        }
    }

    pub fn profile(&self) -> &SimProfile {
        &self.profile
    }

    fn spawn_generator(&self) {
        let mut generator = self.generator.lock().unwrap_or_else(|p| p.into_inner());
        if generator.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(generate(
            Arc::clone(&self.sink),
            Arc::clone(&self.state),
            self.profile.gain_range,
            Arc::clone(&self.status),
            cancel.clone(),
        ));
        *generator = Some(Generator { cancel, task });
    }

    async fn stop_generator(&self) {
        let generator = self
            .generator
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(generator) = generator {
            generator.cancel.cancel();
            if let Err(e) = generator.task.await {
                tracing::warn!(name = %self.profile.name, error = %e, "Sample generator ended abnormally");
            }
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        let generator = self
            .generator
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(generator) = generator {
            generator.cancel.cancel();
        }
    }
}

#[async_trait]
impl Device for SimulatedDevice {
    fn name(&self) -> String {
        self.profile.name.clone()
    }

    fn serial(&self) -> String {
        self.profile.serial.clone()
    }

    fn gain_range(&self) -> GainRange {
        self.profile.gain_range
    }

    fn master_clock(&self) -> f64 {
        self.profile.master_clock
    }

    fn samples_per_packet(&self) -> usize {
        self.profile.samples_per_packet
    }

    fn antennas(&self) -> Vec<String> {
        self.profile.antennas.clone()
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    async fn open(&self) -> Result<bool> {
        if self.state.is_open() {
            return Ok(true);
        }
        self.state.open(&self.profile.antennas);
        if self.state.sample_rate() <= 0.0 {
            self.state.set_sample_rate(self.profile.default_sample_rate);
        }
        self.state.set_gain(self.profile.gain_range.start, None);
        let payload = self
            .transport
            .set_payload_size(payload_size_for(self.profile.samples_per_packet));
        tracing::debug!(name = %self.profile.name, payload_size = payload, "Simulated device opened");
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.stop_generator().await;
        self.state.close();
        self.transport.disconnect().await
    }

    async fn start(&self) -> Result<bool> {
        if !self.state.start() {
            return Ok(false);
        }
        self.spawn_generator();
        Ok(true)
    }

    async fn stop(&self) -> Result<bool> {
        self.stop_generator().await;
        Ok(self.state.stop())
    }

    async fn gain(&self) -> Result<f64> {
        Ok(self.state.gain())
    }

    async fn set_gain(&self, gain: f64) -> Result<bool> {
        Ok(self.state.set_gain(gain, Some(&self.profile.gain_range)))
    }

    async fn sample_rate(&self) -> Result<f64> {
        Ok(self.state.sample_rate())
    }

    async fn set_sample_rate(&self, rate: f64) -> Result<bool> {
        if rate > self.profile.master_clock {
            self.state.set_last_error(format!(
                "Sample rate {} exceeds master clock {}",
                rate, self.profile.master_clock
            ));
            return Ok(false);
        }
        Ok(self.state.set_sample_rate(rate))
    }

    async fn frequency(&self) -> Result<f64> {
        Ok(self.state.frequency())
    }

    async fn set_frequency(&self, freq: f64) -> Result<bool> {
        if !freq.is_finite() || freq < 0.0 {
            return Ok(self.state.set_frequency(freq, freq));
        }
        let result = self.profile.tune(freq);
        if !self.state.set_frequency(result.tuned_freq(), freq) {
            return Ok(false);
        }
        self.state.record_tune(result);
        Ok(true)
    }

    fn last_tune_result(&self) -> TuneResult {
        self.state.last_tune_result()
    }

    fn tune_tolerance(&self) -> Option<f64> {
        self.profile.tune_tolerance
    }

    async fn antenna(&self) -> Result<Option<String>> {
        Ok(self.state.antenna())
    }

    async fn set_antenna(&self, antenna: AntennaSelector) -> Result<bool> {
        Ok(self.state.set_antenna(&antenna, &self.profile.antennas))
    }
}

#[async_trait]
impl NetworkTransport for SimulatedDevice {
    async fn destination(&self) -> Result<Destination> {
        Ok(self.transport.destination())
    }

    async fn set_destination(&self, dest: &str) -> Result<bool> {
        match self.transport.set_destination(dest).await {
            Ok(_) => Ok(true),
            Err(e) => {
                self.state.set_last_error(e);
                Ok(false)
            }
        }
    }

    async fn header(&self) -> Result<bool> {
        Ok(self.transport.header())
    }

    async fn set_header(&self, enable: bool) -> Result<bool> {
        self.transport.set_header(enable);
        Ok(true)
    }

    async fn payload_size(&self) -> Result<usize> {
        Ok(self.transport.payload_size())
    }

    async fn set_payload_size(&self, size: usize) -> Result<bool> {
        self.transport.set_payload_size(size);
        Ok(true)
    }
}

/// Produce samples at the current rate until cancelled.
async fn generate(
    sink: Arc<UdpSampleSink>,
    state: Arc<DeviceState>,
    gain_range: GainRange,
    status: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SinkStatus>>>,
    cancel: CancellationToken,
) {
    let mut status = status.lock().await;
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last = Instant::now();
    let mut carry = 0.0f64;
    let mut phase = 0.0f64;
    let mut buf: Vec<u8> = Vec::new();

    tracing::debug!("Sample generator started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = status.recv() => {
                match event {
                    SinkStatus::SendFailed(e) => tracing::debug!(error = %e, "Sample send failed"),
                    other => tracing::trace!(status = ?other, "Sink status"),
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let rate = state.sample_rate();
        let exact = rate * now.duration_since(last).as_secs_f64() + carry;
        last = now;
        let count = (exact.max(0.0).floor() as usize).min(MAX_SAMPLES_PER_TICK);
        carry = (exact - count as f64).clamp(0.0, 1.0);
        if count == 0 || rate <= 0.0 {
            continue;
        }

        let level_db = state.gain() - gain_range.start;
        let amplitude = (0.01 * 10f64.powf(level_db / 20.0)).min(0.9) * f64::from(i16::MAX);
        let noise = 0.005 * f64::from(i16::MAX);
        let step = TAU * TONE_OFFSET_HZ / rate;

        buf.clear();
        buf.reserve(count * 4);
        for _ in 0..count {
            let i = amplitude * phase.cos() + noise * rng.gen_range(-1.0..1.0);
            let q = amplitude * phase.sin() + noise * rng.gen_range(-1.0..1.0);
            buf.extend_from_slice(&(i as i16).to_le_bytes());
            buf.extend_from_slice(&(q as i16).to_le_bytes());
            phase = (phase + step) % TAU;
        }

        if let Err(e) = sink.write(&buf).await {
            tracing::debug!(error = %e, "Sample sink rejected write");
        }
    }
    tracing::debug!("Sample generator stopped");
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds [`SimulatedDevice`]s from one profile.
#[derive(Debug, Clone)]
pub struct SimFactory {
    profile: SimProfile,
}

impl SimFactory {
    pub fn new(profile: SimProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl DeviceFactory for SimFactory {
    async fn create(
        &self,
        spec: &DeviceSpec,
        ctx: &FactoryContext,
    ) -> Result<Arc<dyn StreamDevice>> {
        let mut profile = self.profile.clone();
        if let Some(serial) = spec.value("serial") {
            profile.serial = serial;
        }
        if let Some(name) = spec.value("name") {
            profile.name = name;
        }
        Ok(Arc::new(SimulatedDevice::new(profile, ctx.data_port)))
    }
}

/// Register the simulated profiles under `RTL` and `SIM`.
pub fn register(registry: &mut DeviceRegistry) {
    registry.register("RTL", Arc::new(SimFactory::new(rtl())));
    registry.register("SIM", Arc::new(SimFactory::new(generic())));
}
