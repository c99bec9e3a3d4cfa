//! Value types shared by devices, the wire protocol, and the client proxy.

use std::fmt;

/// How a requested frequency was actually achieved by a tuning backend.
///
/// Two-stage tuners reach the target with a coarse RF step plus a digital
/// down-conversion offset; single-stage backends report `0.0` for both DSP
/// fields.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TuneResult {
    /// The frequency that was requested, in hertz.
    pub target_rf_freq: f64,
    /// The frequency the RF front end settled on, in hertz.
    pub actual_rf_freq: f64,
    /// The DSP offset the backend aimed for, in hertz.
    pub target_dsp_freq: f64,
    /// The DSP offset actually applied, in hertz.
    pub actual_dsp_freq: f64,
}

impl TuneResult {
    /// A result for a backend that tuned exactly where it reports, with no
    /// DSP stage.
    pub fn new(target_rf_freq: f64, actual_rf_freq: f64) -> Self {
        Self {
            target_rf_freq,
            actual_rf_freq,
            target_dsp_freq: 0.0,
            actual_dsp_freq: 0.0,
        }
    }

    /// The frequency the receiver is effectively centred on.
    pub fn tuned_freq(&self) -> f64 {
        self.actual_rf_freq + self.actual_dsp_freq
    }

    /// Tuning error: `target_rf - (actual_rf + actual_dsp)`.
    pub fn error(&self) -> f64 {
        self.target_rf_freq - self.tuned_freq()
    }
}

impl fmt::Display for TuneResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} + {} ({})",
            self.target_rf_freq, self.actual_rf_freq, self.target_dsp_freq, self.actual_dsp_freq
        )
    }
}

/// Outcome of the last tune, relative to the backend's tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TuneStatus {
    /// The tuning error is below `-tolerance`.
    Low,
    /// Within tolerance, or the backend has no tolerance.
    Ok,
    /// The tuning error exceeds `tolerance`.
    High,
}

impl TuneStatus {
    /// Classify a tune result against an optional tolerance.
    ///
    /// With `d = result.error()`, the status is [`High`](TuneStatus::High)
    /// iff `d > tolerance` and [`Low`](TuneStatus::Low) iff `d < -tolerance`.
    /// An unknown tolerance always yields [`Ok`](TuneStatus::Ok).
    pub fn evaluate(result: &TuneResult, tolerance: Option<f64>) -> Self {
        let Some(tolerance) = tolerance else {
            return TuneStatus::Ok;
        };
        let d = result.error();
        if d > tolerance {
            TuneStatus::High
        } else if d < -tolerance {
            TuneStatus::Low
        } else {
            TuneStatus::Ok
        }
    }

    /// The `{-1, 0, 1}` encoding used by device backends.
    pub fn as_i8(self) -> i8 {
        match self {
            TuneStatus::Low => -1,
            TuneStatus::Ok => 0,
            TuneStatus::High => 1,
        }
    }

    /// The result token sent in a `FREQ` response.
    pub fn as_token(self) -> &'static str {
        match self {
            TuneStatus::Low => "LOW",
            TuneStatus::Ok => "OK",
            TuneStatus::High => "HIGH",
        }
    }

    /// Parse a `FREQ` result token (case-insensitive).
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "LOW" => Some(TuneStatus::Low),
            "OK" => Some(TuneStatus::Ok),
            "HIGH" => Some(TuneStatus::High),
            _ => None,
        }
    }
}

impl fmt::Display for TuneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Gain bounds of a device, in dB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl GainRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Whether `gain` lies within `[start, stop]`.
    pub fn contains(&self, gain: f64) -> bool {
        gain >= self.start && gain <= self.stop
    }
}

impl Default for GainRange {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 1.0,
            step: 1.0,
        }
    }
}

/// Lifecycle state of a device.
///
/// `Running` is only reachable from `Open` or `Stopped`; closing a running
/// device stops it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunState {
    #[default]
    Closed,
    Open,
    Running,
    Stopped,
}

/// Antenna selection by position in [`Device::antennas`](crate::Device::antennas)
/// or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AntennaSelector {
    Index(usize),
    Name(String),
}

impl From<usize> for AntennaSelector {
    fn from(index: usize) -> Self {
        AntennaSelector::Index(index)
    }
}

impl From<&str> for AntennaSelector {
    fn from(name: &str) -> Self {
        AntennaSelector::Name(name.to_string())
    }
}

impl From<String> for AntennaSelector {
    fn from(name: String) -> Self {
        AntennaSelector::Name(name)
    }
}
