//! BorIP command/response grammar.
//!
//! Client to server: `COMMAND[ DATA]`. Server to client:
//! `COMMAND RESULT[ DATA]`, where the result is `OK`, `FAIL`, `DEVICE`,
//! `UNKNOWN`, or a command-specific token. `DEVICE` responses carry the
//! descriptor (or `-`) in the result position, and a bare `BUSY` line is a
//! valid rejection of a new connection.
//!
//! This module is pure: no I/O, only parsing and formatting of single lines
//! (without the terminator, see [`framing`](crate::framing)).

use std::fmt;

use borip_core::error::{Error, Result};
use borip_core::types::{TuneResult, TuneStatus};

/// Result token: success.
pub const RESULT_OK: &str = "OK";
/// Result token: the device rejected the command.
pub const RESULT_FAIL: &str = "FAIL";
/// Result token: no device is selected.
pub const RESULT_DEVICE: &str = "DEVICE";
/// Result token: the command is not recognized.
pub const RESULT_UNKNOWN: &str = "UNKNOWN";
/// Bare rejection line sent instead of a greeting.
pub const BUSY: &str = "BUSY";
/// Descriptor placeholder for "no device selected".
pub const NO_DEVICE: &str = "-";
/// `DEVICE` payload that releases the current device.
pub const RELEASE_DEVICE: &str = "!";

/// Commands understood by a BorIP server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Go,
    Stop,
    Device,
    Freq,
    Gain,
    Rate,
    Antenna,
    Dest,
    Header,
    Ping,
    /// Anything else, upper-cased.
    Unknown(String),
}

impl Command {
    /// Parse a command word (case-insensitive).
    pub fn parse(word: &str) -> Self {
        match word.to_ascii_uppercase().as_str() {
            "GO" => Command::Go,
            "STOP" => Command::Stop,
            "DEVICE" => Command::Device,
            "FREQ" => Command::Freq,
            "GAIN" => Command::Gain,
            "RATE" => Command::Rate,
            "ANTENNA" => Command::Antenna,
            "DEST" => Command::Dest,
            "HEADER" => Command::Header,
            "PING" => Command::Ping,
            other => Command::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Go => "GO",
            Command::Stop => "STOP",
            Command::Device => "DEVICE",
            Command::Freq => "FREQ",
            Command::Gain => "GAIN",
            Command::Rate => "RATE",
            Command::Antenna => "ANTENNA",
            Command::Dest => "DEST",
            Command::Header => "HEADER",
            Command::Ping => "PING",
            Command::Unknown(word) => word,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed client command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    /// Trimmed payload; `None` means the command is a query.
    pub data: Option<String>,
}

impl Request {
    pub fn new(command: Command, data: Option<String>) -> Self {
        Self { command, data }
    }

    pub fn query(command: Command) -> Self {
        Self::new(command, None)
    }

    /// Parse a command line. Returns `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (word, data) = match line.find(' ') {
            Some(idx) => (&line[..idx], Some(line[idx + 1..].trim())),
            None => (line, None),
        };
        let data = data.filter(|d| !d.is_empty()).map(str::to_string);
        Some(Self::new(Command::parse(word), data))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} {}", self.command, data),
            None => write!(f, "{}", self.command),
        }
    }
}

/// Result tokens matched case-insensitively.
const STATUS_WORDS: [&str; 8] = [
    RESULT_OK,
    RESULT_FAIL,
    RESULT_DEVICE,
    RESULT_UNKNOWN,
    "LOW",
    "HIGH",
    "ON",
    "OFF",
];

/// A parsed server response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Echoed command word, upper-cased (`BUSY` for a busy rejection).
    pub command: String,
    /// Result token. Status words (`OK`, `FAIL`, `LOW`, ...) are upper-cased;
    /// values such as antenna names and descriptors keep their case. `None`
    /// only for `BUSY`.
    pub result: Option<String>,
    /// Remaining payload.
    pub data: Option<String>,
}

impl Response {
    /// Parse a response line.
    ///
    /// A line with no result token is a protocol error, except a bare `BUSY`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let Some(idx) = line.find(' ') else {
            if line.eq_ignore_ascii_case(BUSY) {
                return Ok(Self {
                    command: BUSY.to_string(),
                    result: None,
                    data: None,
                });
            }
            return Err(Error::Protocol(format!("Response without result: {}", line)));
        };

        let command = line[..idx].to_ascii_uppercase();
        let rest = line[idx + 1..].trim();

        if command == RESULT_DEVICE {
            // Descriptors may contain spaces; only a `-` result carries a
            // separate error payload.
            let (result, data) = match rest.strip_prefix(NO_DEVICE) {
                Some(err) if err.is_empty() || err.starts_with(' ') => {
                    let err = err.trim();
                    (NO_DEVICE.to_string(), (!err.is_empty()).then(|| err.to_string()))
                }
                _ => (rest.to_string(), None),
            };
            return Ok(Self {
                command,
                result: Some(result),
                data,
            });
        }

        let (result, data) = match rest.find(' ') {
            Some(i) => (&rest[..i], Some(rest[i + 1..].trim().to_string())),
            None => (rest, None),
        };
        let result = if STATUS_WORDS.iter().any(|w| w.eq_ignore_ascii_case(result)) {
            result.to_ascii_uppercase()
        } else {
            result.to_string()
        };
        Ok(Self {
            command,
            result: Some(result),
            data: data.filter(|d| !d.is_empty()),
        })
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.result() == Some(RESULT_OK)
    }

    pub fn is_busy(&self) -> bool {
        self.command == BUSY && self.result.is_none()
    }
}

/// Format a response line: `COMMAND BODY`.
pub fn format_response(command: &Command, body: &str) -> String {
    format!("{} {}", command, body)
}

/// `FAIL` followed by the escaped error, if any.
pub fn fail(error: Option<&str>) -> String {
    format!("{}{}", RESULT_FAIL, format_error(error))
}

// ---------------------------------------------------------------------------
// Error strings
// ---------------------------------------------------------------------------

/// Escape an error string so it fits on one line.
///
/// Backslash becomes `\\`, CR becomes `\r`, and LF becomes `\n`.
pub fn escape_error(error: &str) -> String {
    let mut out = String::with_capacity(error.len());
    for c in error.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape_error`].
pub fn unescape_error(error: &str) -> String {
    let mut out = String::with_capacity(error.len());
    let mut chars = error.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// A trimmed, escaped error prefixed with a space, or an empty string when
/// there is nothing to report.
pub fn format_error(error: Option<&str>) -> String {
    match error.map(str::trim) {
        Some(e) if !e.is_empty() => format!(" {}", escape_error(e)),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

/// Format a number the way query responses do: shortest round-trip digits,
/// with `.0` appended to integral values (`49.6`, `0.0`, `2048000.0`).
pub fn format_float(value: f64) -> String {
    let s = value.to_string();
    if value.is_finite() && !s.contains('.') {
        format!("{}.0", s)
    } else {
        s
    }
}

/// Like [`format_float`], but integral values print without a fraction
/// (`2048000`).
pub fn format_integral(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format_float(value)
    }
}

/// Six-decimal fixed formatting used in `FREQ` set responses.
pub fn format_fixed(value: f64) -> String {
    format!("{:.6}", value)
}

/// Parse a number leniently: anything unparsable becomes `0.0`.
///
/// Returns the value and whether parsing succeeded, so callers can warn.
pub fn parse_lenient(data: &str) -> (f64, bool) {
    match data.trim().parse::<f64>() {
        Ok(v) => (v, true),
        Err(_) => (0.0, false),
    }
}

/// Body of a successful `FREQ` set response: `<status> <target_rf>
/// <actual_rf> <target_dsp> <actual_dsp>`.
pub fn format_tune(status: TuneStatus, result: &TuneResult) -> String {
    format!(
        "{} {} {} {} {}",
        status.as_token(),
        format_fixed(result.target_rf_freq),
        format_fixed(result.actual_rf_freq),
        format_fixed(result.target_dsp_freq),
        format_fixed(result.actual_dsp_freq)
    )
}

/// Parse the four frequencies following a `FREQ` status token.
pub fn parse_tune(data: &str) -> Result<TuneResult> {
    let values: Vec<f64> = data
        .split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| Error::Protocol(format!("Malformed tune result: {}", data)))
        })
        .collect::<Result<_>>()?;
    match values.as_slice() {
        [target_rf, actual_rf, target_dsp, actual_dsp] => Ok(TuneResult {
            target_rf_freq: *target_rf,
            actual_rf_freq: *actual_rf,
            target_dsp_freq: *target_dsp,
            actual_dsp_freq: *actual_dsp,
        }),
        _ => Err(Error::Protocol(format!("Malformed tune result: {}", data))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    #[test]
    fn request_query_and_set() {
        assert_eq!(Request::parse("freq"), Some(Request::query(Command::Freq)));
        assert_eq!(
            Request::parse("FREQ  100e6 "),
            Some(Request::new(Command::Freq, Some("100e6".into())))
        );
        assert_eq!(Request::parse("GAIN "), Some(Request::query(Command::Gain)));
        assert_eq!(Request::parse("   "), None);
    }

    #[test]
    fn request_unknown_command_is_uppercased() {
        let req = Request::parse("shutdown now").unwrap();
        assert_eq!(req.command, Command::Unknown("SHUTDOWN".into()));
        assert_eq!(req.to_string(), "SHUTDOWN now");
    }

    #[test]
    fn request_device_hint_keeps_spaces() {
        let req = Request::parse("DEVICE rtl name=\"a b\"").unwrap();
        assert_eq!(req.data.as_deref(), Some("rtl name=\"a b\""));
    }

    // -----------------------------------------------------------------------
    // Responses
    // -----------------------------------------------------------------------

    #[test]
    fn response_with_result_and_data() {
        let r = Response::parse("FREQ ok 100.000000 99.000000 1.000000 1.000000").unwrap();
        assert_eq!(r.command, "FREQ");
        assert_eq!(r.result(), Some("OK"));
        assert_eq!(r.data(), Some("100.000000 99.000000 1.000000 1.000000"));
        assert!(r.is_ok());
    }

    #[test]
    fn response_result_only() {
        let r = Response::parse("ANTENNA Receive").unwrap();
        assert_eq!(r.result(), Some("Receive"));
        let r = Response::parse("HEADER on").unwrap();
        assert_eq!(r.result(), Some("ON"));

        let r = Response::parse("GO OK").unwrap();
        assert_eq!(r.result(), Some("OK"));
        assert_eq!(r.data(), None);
        let r = Response::parse("GAIN FAIL out of range").unwrap();
        assert_eq!(r.result(), Some("FAIL"));
        assert_eq!(r.data(), Some("out of range"));
    }

    #[test]
    fn response_busy() {
        let r = Response::parse("BUSY").unwrap();
        assert!(r.is_busy());
    }

    #[test]
    fn response_without_result_is_protocol_error() {
        let err = Response::parse("GO").unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("without result")));
    }

    #[test]
    fn response_device_descriptor_kept_whole() {
        let r = Response::parse("DEVICE Fancy Radio|0.0|10.0|1.0|0|1024|A B|x").unwrap();
        assert_eq!(r.result(), Some("Fancy Radio|0.0|10.0|1.0|0|1024|A B|x"));
        assert_eq!(r.data(), None);
    }

    #[test]
    fn response_device_none_with_error() {
        let r = Response::parse("DEVICE -").unwrap();
        assert_eq!(r.result(), Some("-"));
        assert_eq!(r.data(), None);

        let r = Response::parse("DEVICE - No such module: FOO").unwrap();
        assert_eq!(r.result(), Some("-"));
        assert_eq!(r.data(), Some("No such module: FOO"));
    }

    // -----------------------------------------------------------------------
    // Errors and numbers
    // -----------------------------------------------------------------------

    #[test]
    fn escape_error_strings() {
        assert_eq!(escape_error("a\nb"), "a\\nb");
        assert_eq!(escape_error("a\r\nb"), "a\\r\\nb");
        assert_eq!(escape_error("c:\\dev"), "c:\\\\dev");
        assert_eq!(unescape_error(&escape_error("x\\y\r\nz")), "x\\y\r\nz");
    }

    #[test]
    fn format_error_pads_and_trims() {
        assert_eq!(format_error(None), "");
        assert_eq!(format_error(Some("  ")), "");
        assert_eq!(format_error(Some(" boom\n")), " boom");
        assert_eq!(format_error(Some("two\nlines")), " two\\nlines");
        assert_eq!(fail(Some("no")), "FAIL no");
        assert_eq!(fail(None), "FAIL");
    }

    #[test]
    fn number_formats() {
        assert_eq!(format_float(0.0), "0.0");
        assert_eq!(format_float(49.6), "49.6");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(2_048_000.0), "2048000.0");
        assert_eq!(format_integral(2_048_000.0), "2048000");
        assert_eq!(format_integral(1.5), "1.5");
        assert_eq!(format_fixed(100e6), "100000000.000000");
    }

    #[test]
    fn lenient_parse() {
        assert_eq!(parse_lenient("1e6"), (1e6, true));
        assert_eq!(parse_lenient("notanumber"), (0.0, false));
    }

    #[test]
    fn tune_body_round_trip() {
        let tr = TuneResult {
            target_rf_freq: 100e6,
            actual_rf_freq: 99_999_000.0,
            target_dsp_freq: 1000.0,
            actual_dsp_freq: 999.5,
        };
        let body = format_tune(TuneStatus::Low, &tr);
        assert_eq!(
            body,
            "LOW 100000000.000000 99999000.000000 1000.000000 999.500000"
        );
        let r = Response::parse(&format_response(&Command::Freq, &body)).unwrap();
        assert_eq!(r.result(), Some("LOW"));
        assert_eq!(parse_tune(r.data().unwrap()).unwrap(), tr);
        assert!(parse_tune("1 2 3").is_err());
        assert!(parse_tune("1 2 x 4").is_err());
    }
}
