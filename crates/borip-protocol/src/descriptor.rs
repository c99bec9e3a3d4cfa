//! Device descriptor: the pipe-delimited capability summary sent in the
//! greeting and in `DEVICE` responses.
//!
//! ```text
//! name|gain_start|gain_stop|gain_step|master_clock|payload_samples|ant1,ant2,...|serial
//! ```
//!
//! `payload_samples` is the negotiated datagram payload divided by four
//! (bytes per complex sample), so the receiver can size its packets.

use std::fmt;

use borip_core::device::Device;
use borip_core::error::{Error, Result};
use borip_core::transport::BYTES_PER_SAMPLE;
use borip_core::types::GainRange;

use crate::codec::{NO_DEVICE, format_float, format_integral};

/// Name reported for a device that sent an empty name field.
pub const UNNAMED: &str = "(No name)";

/// Capabilities of a selected device as exchanged on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub name: String,
    pub gain_range: GainRange,
    pub master_clock: f64,
    /// Complex samples per datagram.
    pub payload_samples: usize,
    pub antennas: Vec<String>,
    pub serial: String,
}

impl Descriptor {
    /// Describe a device whose transport negotiated `payload_size` bytes.
    pub fn from_device<D: Device + ?Sized>(device: &D, payload_size: usize) -> Self {
        Self {
            name: device.name(),
            gain_range: device.gain_range(),
            master_clock: device.master_clock(),
            payload_samples: payload_size / BYTES_PER_SAMPLE,
            antennas: device.antennas(),
            serial: device.serial(),
        }
    }

    /// Datagram payload size in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload_samples * BYTES_PER_SAMPLE
    }

    /// Parse a descriptor field list.
    ///
    /// Six to eight fields are accepted; the antenna list and serial were
    /// added to the format later and may be missing.
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || Error::Protocol(format!("Malformed device response: {}", s));

        let fields: Vec<&str> = s.split('|').collect();
        if !(6..=8).contains(&fields.len()) {
            return Err(malformed());
        }

        let number = |i: usize| fields[i].trim().parse::<f64>().map_err(|_| malformed());

        let name = match fields[0] {
            "" => UNNAMED.to_string(),
            n => n.to_string(),
        };
        let gain_range = GainRange::new(number(1)?, number(2)?, number(3)?);
        let master_clock = number(4)?;
        let payload_samples = fields[5].trim().parse::<usize>().map_err(|_| malformed())?;
        let antennas = fields
            .get(6)
            .map(|a| {
                a.split(',')
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let serial = fields.get(7).map(|s| s.to_string()).unwrap_or_default();

        Ok(Self {
            name,
            gain_range,
            master_clock,
            payload_samples,
            antennas,
            serial,
        })
    }

    /// Parse the result position of a greeting or `DEVICE` response:
    /// `None` for `-`.
    pub fn parse_optional(s: &str) -> Result<Option<Self>> {
        if s.trim() == NO_DEVICE {
            Ok(None)
        } else {
            Self::parse(s).map(Some)
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.name,
            format_float(self.gain_range.start),
            format_float(self.gain_range.stop),
            format_float(self.gain_range.step),
            format_integral(self.master_clock),
            self.payload_samples,
            self.antennas.join(","),
            self.serial
        )
    }
}

/// Format an optional descriptor, `-` when no device is selected.
pub fn format_descriptor(descriptor: Option<&Descriptor>) -> String {
    descriptor.map_or_else(|| NO_DEVICE.to_string(), Descriptor::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtl() -> Descriptor {
        Descriptor {
            name: "rtl-sdr".into(),
            gain_range: GainRange::new(0.0, 49.6, 0.1),
            master_clock: 2_048_000.0,
            payload_samples: 1024,
            antennas: vec!["Receive".into()],
            serial: "0001".into(),
        }
    }

    #[test]
    fn format_matches_wire_example() {
        assert_eq!(
            rtl().to_string(),
            "rtl-sdr|0.0|49.6|0.1|2048000|1024|Receive|0001"
        );
        assert_eq!(rtl().payload_size(), 4096);
    }

    #[test]
    fn parse_full_descriptor() {
        let d = Descriptor::parse("rtl-sdr|0.0|49.6|0.1|2048000|1024|Receive|0001").unwrap();
        assert_eq!(d, rtl());
    }

    #[test]
    fn parse_fixed_point_fields() {
        let d = Descriptor::parse("USRP|0.000000|31.500000|0.500000|64000000.000000|2048|RX2,TX/RX|F1").unwrap();
        assert_eq!(d.gain_range, GainRange::new(0.0, 31.5, 0.5));
        assert_eq!(d.master_clock, 64e6);
        assert_eq!(d.antennas, vec!["RX2", "TX/RX"]);
    }

    #[test]
    fn parse_short_descriptor() {
        let d = Descriptor::parse("|0|1|1|0|4096").unwrap();
        assert_eq!(d.name, UNNAMED);
        assert!(d.antennas.is_empty());
        assert_eq!(d.serial, "");
        assert_eq!(d.payload_size(), 16384);
    }

    #[test]
    fn wrong_field_count_is_protocol_error() {
        assert!(matches!(
            Descriptor::parse("a|1|2|3|4"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Descriptor::parse("a|1|2|3|4|5|6|7|8"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Descriptor::parse("a|x|2|3|4|5"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn optional_descriptor() {
        assert_eq!(Descriptor::parse_optional("-").unwrap(), None);
        assert_eq!(format_descriptor(None), "-");
        assert_eq!(
            Descriptor::parse_optional(&format_descriptor(Some(&rtl()))).unwrap(),
            Some(rtl())
        );
    }
}
