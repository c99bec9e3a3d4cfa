//! The `Device` trait -- the contract every remotely operable radio satisfies.
//!
//! Concrete hardware backends, the simulated backend, and the client proxy
//! all implement [`Device`]. The server session manager programs against
//! `dyn StreamDevice` (a device with a UDP data plane, see
//! [`NetworkTransport`](crate::NetworkTransport)) and never needs to know
//! which backend is behind it.
//!
//! [`DeviceState`] carries the live settings and default semantics common to
//! all backends, so an adapter only has to forward the calls its hardware
//! actually cares about.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AntennaSelector, GainRange, RunState, TuneResult, TuneStatus};

/// Asynchronous interface for a receiver that can be tuned and streamed.
///
/// Capability information ([`name`](Device::name), [`gain_range`](Device::gain_range),
/// ...) is synchronous and cheap. Everything that may touch hardware or the
/// network is `async`.
///
/// Setters return `Ok(false)` when the backend rejected the value; a reason
/// may then be available from [`last_error`](Device::last_error). `Err` is
/// reserved for hard failures (a dead control connection, a crashed driver).
#[async_trait]
pub trait Device: Send + Sync {
    /// Human-readable device name.
    fn name(&self) -> String;

    /// Serial number, or the name when the backend has none.
    fn serial(&self) -> String;

    fn gain_range(&self) -> GainRange;

    /// Master (ADC) clock in hertz, `0.0` if unknown.
    fn master_clock(&self) -> f64;

    /// Native number of complex samples per transport packet.
    fn samples_per_packet(&self) -> usize;

    /// Selectable antenna names, in index order. Never empty.
    fn antennas(&self) -> Vec<String>;

    fn is_running(&self) -> bool;

    /// The most recent human-readable failure reason, if any.
    fn last_error(&self) -> Option<String>;

    /// Allocate resources and select the default antenna.
    ///
    /// Idempotent if already open.
    async fn open(&self) -> Result<bool>;

    /// Release resources, stopping first if running.
    async fn close(&self) -> Result<()>;

    /// Start streaming. Idempotent.
    async fn start(&self) -> Result<bool>;

    /// Stop streaming. Idempotent; a no-op returning `true` while closed.
    async fn stop(&self) -> Result<bool>;

    async fn gain(&self) -> Result<f64>;

    async fn set_gain(&self, gain: f64) -> Result<bool>;

    async fn sample_rate(&self) -> Result<f64>;

    /// Change the sample rate. Rates `<= 0` are rejected.
    async fn set_sample_rate(&self, rate: f64) -> Result<bool>;

    /// The frequency the device is currently tuned to, in hertz.
    async fn frequency(&self) -> Result<f64>;

    /// Tune to `freq` hertz. On success the outcome is available from
    /// [`last_tune_result`](Device::last_tune_result).
    async fn set_frequency(&self, freq: f64) -> Result<bool>;

    /// Snapshot of the most recent successful tune.
    fn last_tune_result(&self) -> TuneResult;

    /// Acceptable tuning error in hertz, `None` if unknown.
    fn tune_tolerance(&self) -> Option<f64> {
        None
    }

    /// Classify the last tune against [`tune_tolerance`](Device::tune_tolerance).
    fn was_tune_successful(&self) -> TuneStatus {
        TuneStatus::evaluate(&self.last_tune_result(), self.tune_tolerance())
    }

    /// The selected antenna name, `None` if none has been selected yet.
    async fn antenna(&self) -> Result<Option<String>>;

    /// Select an antenna by index or name. An out-of-range index or an
    /// empty name is rejected.
    async fn set_antenna(&self, antenna: AntennaSelector) -> Result<bool>;
}

#[derive(Debug, Default)]
struct Settings {
    run_state: RunState,
    frequency: f64,
    requested_frequency: f64,
    gain: f64,
    sample_rate: f64,
    antenna: Option<String>,
    last_error: Option<String>,
    last_tune: Option<TuneResult>,
}

/// Live settings and default behaviour shared by device backends.
///
/// Backends embed a `DeviceState` and delegate to it after (or instead of)
/// talking to their hardware. All methods are synchronous and hold the
/// internal lock only for the duration of the call, so one state can be
/// shared by several sessions.
#[derive(Debug, Default)]
pub struct DeviceState {
    inner: Mutex<Settings>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        // Settings are plain values; a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn run_state(&self) -> RunState {
        self.lock().run_state
    }

    pub fn is_open(&self) -> bool {
        self.lock().run_state != RunState::Closed
    }

    pub fn is_running(&self) -> bool {
        self.lock().run_state == RunState::Running
    }

    /// Mark the device open, selecting `antennas[0]` if no antenna is set.
    ///
    /// Returns `true`; opening an already open device changes nothing.
    pub fn open(&self, antennas: &[String]) -> bool {
        let mut s = self.lock();
        if s.run_state != RunState::Closed {
            return true;
        }
        if s.antenna.is_none() {
            s.antenna = antennas.first().cloned();
        }
        s.run_state = RunState::Open;
        true
    }

    /// Mark the device closed. Returns whether it was running beforehand,
    /// so the caller can stop its hardware.
    pub fn close(&self) -> bool {
        let mut s = self.lock();
        let was_running = s.run_state == RunState::Running;
        s.run_state = RunState::Closed;
        was_running
    }

    /// Transition to `Running`.
    ///
    /// Returns `true` if the device is now running (including when it
    /// already was), `false` if it is closed.
    pub fn start(&self) -> bool {
        let mut s = self.lock();
        match s.run_state {
            RunState::Running => true,
            RunState::Open | RunState::Stopped => {
                s.run_state = RunState::Running;
                true
            }
            RunState::Closed => {
                s.last_error = Some("Device is not open".to_string());
                false
            }
        }
    }

    /// Transition out of `Running`. Always succeeds.
    pub fn stop(&self) -> bool {
        let mut s = self.lock();
        if s.run_state == RunState::Running {
            s.run_state = RunState::Stopped;
        }
        true
    }

    pub fn gain(&self) -> f64 {
        self.lock().gain
    }

    /// Store a gain, rejecting values outside `range` when one is given.
    pub fn set_gain(&self, gain: f64, range: Option<&GainRange>) -> bool {
        if let Some(range) = range {
            if !range.contains(gain) {
                self.set_last_error(format!(
                    "Gain {} outside range [{}, {}]",
                    gain, range.start, range.stop
                ));
                return false;
            }
        }
        self.lock().gain = gain;
        true
    }

    pub fn sample_rate(&self) -> f64 {
        self.lock().sample_rate
    }

    /// Store a sample rate. Rates `<= 0` (and NaN) are rejected.
    pub fn set_sample_rate(&self, rate: f64) -> bool {
        if !(rate > 0.0) {
            self.set_last_error(format!("Invalid sample rate: {}", rate));
            return false;
        }
        self.lock().sample_rate = rate;
        true
    }

    pub fn frequency(&self) -> f64 {
        self.lock().frequency
    }

    pub fn requested_frequency(&self) -> f64 {
        self.lock().requested_frequency
    }

    /// Record a completed tune.
    ///
    /// `tuned` is where the device ended up, `requested` what the caller
    /// asked for. Negative and non-finite frequencies are rejected; zero is
    /// accepted so that a lenient `FREQ` parse still tunes.
    pub fn set_frequency(&self, tuned: f64, requested: f64) -> bool {
        if !tuned.is_finite() || tuned < 0.0 {
            self.set_last_error(format!("Invalid frequency: {}", tuned));
            return false;
        }
        let mut s = self.lock();
        s.frequency = tuned;
        s.requested_frequency = if requested > 0.0 { requested } else { tuned };
        true
    }

    /// Store the detailed outcome of the last tune.
    pub fn record_tune(&self, result: TuneResult) {
        self.lock().last_tune = Some(result);
    }

    /// Forget the detailed tune outcome, falling back to the synthesized one.
    pub fn clear_tune(&self) {
        self.lock().last_tune = None;
    }

    /// The detailed tune outcome if one was recorded, otherwise
    /// `{requested, tuned, 0, 0}`.
    pub fn last_tune_result(&self) -> TuneResult {
        let s = self.lock();
        s.last_tune
            .unwrap_or_else(|| TuneResult::new(s.requested_frequency, s.frequency))
    }

    pub fn antenna(&self) -> Option<String> {
        self.lock().antenna.clone()
    }

    /// Resolve `selector` against `antennas` and store the result.
    pub fn set_antenna(&self, selector: &AntennaSelector, antennas: &[String]) -> bool {
        match resolve_antenna(selector, antennas) {
            Some(name) => {
                self.lock().antenna = Some(name);
                true
            }
            None => {
                self.set_last_error(format!("Invalid antenna: {:?}", selector));
                false
            }
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        let error = error.into();
        tracing::debug!(error = %error, "Device error recorded");
        self.lock().last_error = Some(error);
    }

    pub fn clear_last_error(&self) {
        self.lock().last_error = None;
    }
}

/// Map an antenna selector onto a name.
///
/// Indices must be in range; names must be non-empty but need not appear in
/// `antennas` (backends may accept aliases).
pub fn resolve_antenna(selector: &AntennaSelector, antennas: &[String]) -> Option<String> {
    match selector {
        AntennaSelector::Index(i) => antennas.get(*i).cloned(),
        AntennaSelector::Name(name) if name.is_empty() => None,
        AntennaSelector::Name(name) => Some(name.clone()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
