//! Scriptable in-memory device for testing sessions and registries.
//!
//! [`MockDevice`] implements [`Device`] and [`NetworkTransport`] on top of
//! [`DeviceState`] and plain [`TransportSettings`], so nothing touches the
//! network. Failure modes are switched on at runtime and every operation is
//! recorded by name.
//!
//! # Example
//!
//! ```
//! use borip_core::Device;
//! use borip_test_harness::MockDevice;
//!
//! # async fn example() -> borip_core::Result<()> {
//! let mock = MockDevice::new("bench");
//! assert!(mock.open().await?);
//!
//! mock.set_reject(true);
//! assert!(!mock.set_gain(5.0).await?);
//! assert_eq!(mock.last_error().as_deref(), Some("Rejected: gain 5"));
//! assert_eq!(mock.calls(), vec!["open", "set_gain"]);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use borip_core::device::{Device, DeviceState};
use borip_core::error::{Error, Result};
use borip_core::transport::{
    DEFAULT_PORT, Destination, NetworkTransport, TransportSettings, clamp_payload_size,
};
use borip_core::types::{AntennaSelector, GainRange, TuneResult};

/// An in-memory [`Device`] with switchable failure modes.
///
/// Defaults: antennas `RX` and `TX`, gain range 0 to 50 dB in 0.5 dB steps,
/// a 1 MHz master clock, 1024 samples per packet, framing header enabled.
#[derive(Debug)]
pub struct MockDevice {
    name: String,
    antennas: Vec<String>,
    gain_range: GainRange,
    state: DeviceState,
    transport: Mutex<TransportSettings>,
    fail_open: AtomicBool,
    reject: AtomicBool,
    hard_error: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockDevice {
    /// A closed device reporting `name` as both its name and serial.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            antennas: vec!["RX".to_string(), "TX".to_string()],
            gain_range: GainRange::new(0.0, 50.0, 0.5),
            state: DeviceState::new(),
            transport: Mutex::new(TransportSettings::new(DEFAULT_PORT)),
            fail_open: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            hard_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make `open()` return `Ok(false)`.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make setters and `start()` return `Ok(false)` with a
    /// `Rejected: ...` reason.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Make setters and `start()` fail with [`Error::Device`].
    pub fn set_hard_error(&self, error: Option<&str>) {
        *lock(&self.hard_error) = error.map(str::to_string);
    }

    /// Names of the operations invoked so far, in order.
    ///
    /// Read-only queries are not recorded.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: &str) {
        lock(&self.calls).push(call.to_string());
    }

    /// Record `call` and apply the configured failure mode.
    ///
    /// `Ok(false)` means the call was rejected; `reason` becomes the last
    /// error.
    fn check(&self, call: &str, reason: impl FnOnce() -> String) -> Result<bool> {
        self.record(call);
        if let Some(msg) = lock(&self.hard_error).clone() {
            return Err(Error::Device(msg));
        }
        if self.reject.load(Ordering::SeqCst) {
            self.state.set_last_error(format!("Rejected: {}", reason()));
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl Device for MockDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn serial(&self) -> String {
        self.name.clone()
    }

    fn gain_range(&self) -> GainRange {
        self.gain_range
    }

    fn master_clock(&self) -> f64 {
        1_000_000.0
    }

    fn samples_per_packet(&self) -> usize {
        1024
    }

    fn antennas(&self) -> Vec<String> {
        self.antennas.clone()
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    async fn open(&self) -> Result<bool> {
        self.record("open");
        if self.fail_open.load(Ordering::SeqCst) {
            self.state.set_last_error("Mock device refused to open");
            return Ok(false);
        }
        Ok(self.state.open(&self.antennas))
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        self.state.close();
        Ok(())
    }

    async fn start(&self) -> Result<bool> {
        if !self.check("start", || "start".to_string())? {
            return Ok(false);
        }
        Ok(self.state.start())
    }

    async fn stop(&self) -> Result<bool> {
        self.record("stop");
        Ok(self.state.stop())
    }

    async fn gain(&self) -> Result<f64> {
        Ok(self.state.gain())
    }

    async fn set_gain(&self, gain: f64) -> Result<bool> {
        if !self.check("set_gain", || format!("gain {}", gain))? {
            return Ok(false);
        }
        Ok(self.state.set_gain(gain, Some(&self.gain_range)))
    }

    async fn sample_rate(&self) -> Result<f64> {
        Ok(self.state.sample_rate())
    }

    async fn set_sample_rate(&self, rate: f64) -> Result<bool> {
        if !self.check("set_sample_rate", || format!("rate {}", rate))? {
            return Ok(false);
        }
        Ok(self.state.set_sample_rate(rate))
    }

    async fn frequency(&self) -> Result<f64> {
        Ok(self.state.frequency())
    }

    async fn set_frequency(&self, freq: f64) -> Result<bool> {
        if !self.check("set_frequency", || format!("frequency {}", freq))? {
            return Ok(false);
        }
        if !self.state.set_frequency(freq, freq) {
            return Ok(false);
        }
        self.state.record_tune(TuneResult::new(freq, freq));
        Ok(true)
    }

    fn last_tune_result(&self) -> TuneResult {
        self.state.last_tune_result()
    }

    async fn antenna(&self) -> Result<Option<String>> {
        Ok(self.state.antenna())
    }

    async fn set_antenna(&self, antenna: AntennaSelector) -> Result<bool> {
        if !self.check("set_antenna", || format!("antenna {:?}", antenna))? {
            return Ok(false);
        }
        Ok(self.state.set_antenna(&antenna, &self.antennas))
    }
}

#[async_trait]
impl NetworkTransport for MockDevice {
    async fn destination(&self) -> Result<Destination> {
        Ok(lock(&self.transport).destination.clone())
    }

    async fn set_destination(&self, dest: &str) -> Result<bool> {
        self.record("set_destination");
        let mut transport = lock(&self.transport);
        match Destination::parse(dest, transport.default_port) {
            Some(destination) => {
                transport.destination = destination;
                Ok(true)
            }
            None => {
                drop(transport);
                self.state
                    .set_last_error(format!("Invalid destination: {}", dest));
                Ok(false)
            }
        }
    }

    async fn header(&self) -> Result<bool> {
        Ok(lock(&self.transport).header)
    }

    async fn set_header(&self, enable: bool) -> Result<bool> {
        self.record("set_header");
        lock(&self.transport).header = enable;
        Ok(true)
    }

    async fn payload_size(&self) -> Result<usize> {
        Ok(lock(&self.transport).payload_size)
    }

    async fn set_payload_size(&self, size: usize) -> Result<bool> {
        self.record("set_payload_size");
        lock(&self.transport).payload_size = clamp_payload_size(size);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
