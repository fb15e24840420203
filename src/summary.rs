//! Emulator Run Summary
//!
//! The emulator prints a plain-text summary when it stops, e.g.
//!
//! ```text
//! Emulator Start Timestamp : 2025-05-13 18:30:59.512345
//! Device Type : 2
//! Device ID : 1000200
//! Success Sensor Data Requests Sent: 60
//! Success Sync Data Requests Sent: 12
//! Emualtor End Timestamp : 2025-05-13 18:31:59.004321
//! ```
//!
//! The end label carries the emulator's own misspelling; the correct spelling
//! is accepted as well.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::ReconcileError;
use crate::window::parse_emulator_timestamp;

/// Device type used when the log does not name a device.
pub const DEFAULT_DEVICE_TYPE: &str = "2";
/// Device id used when the log does not name a device.
pub const DEFAULT_DEVICE_ID: &str = "1000200";

lazy_static! {
    static ref START_RE: Regex = Regex::new(r"Emulator Start Timestamp\s*:[ \t]*(.*)").unwrap();
    static ref END_RE: Regex = Regex::new(r"Em(?:ulator|ualtor) End Timestamp\s*:[ \t]*(.*)").unwrap();
    static ref DEVICE_TYPE_RE: Regex = Regex::new(r"Device Type\s*:[ \t]*(.*)").unwrap();
    static ref DEVICE_ID_RE: Regex = Regex::new(r"Device ID\s*:[ \t]*(.*)").unwrap();
    static ref SENSOR_SENT_RE: Regex =
        Regex::new(r"Success Sensor Data Requests Sent:[ \t]*(\d+)").unwrap();
    static ref SYNC_SENT_RE: Regex =
        Regex::new(r"Success Sync Data Requests Sent:[ \t]*(\d+)").unwrap();
}

/// Device identity as known to the emulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    pub device_type: String,
    pub device_id: String,
}

impl DeviceRef {
    pub fn new(device_type: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            device_id: device_id.into(),
        }
    }
}

impl Default for DeviceRef {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_TYPE, DEFAULT_DEVICE_ID)
    }
}

impl std::fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device_type, self.device_id)
    }
}

/// What the emulator claims it did during one run.
///
/// Timestamps keep their sub-second precision; normalization happens later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub device: DeviceRef,
    /// "Success Sensor Data Requests Sent"
    pub reported_vital_count: u64,
    /// "Success Sync Data Requests Sent"
    pub reported_status_count: u64,
}

impl RunSummary {
    pub fn from_file(path: &Path) -> Result<Self, ReconcileError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::Parse(format!("cannot read {}: {}", path.display(), e))
        })?;
        parse_run_summary(&content)
    }
}

/// Extract a [`RunSummary`] from emulator output.
pub fn parse_run_summary(content: &str) -> Result<RunSummary, ReconcileError> {
    let start = capture(&START_RE, content)
        .ok_or_else(|| missing("Emulator Start Timestamp"))
        .and_then(parse_emulator_timestamp)?;
    let end = capture(&END_RE, content)
        .ok_or_else(|| missing("Emulator End Timestamp"))
        .and_then(parse_emulator_timestamp)?;

    let device = match (
        capture(&DEVICE_TYPE_RE, content),
        capture(&DEVICE_ID_RE, content),
    ) {
        (Some(device_type), Some(device_id)) => DeviceRef::new(device_type, device_id),
        _ => {
            let device = DeviceRef::default();
            info!(device = %device, "Device not named in emulator output, using default");
            device
        }
    };

    let reported_vital_count = capture(&SENSOR_SENT_RE, content)
        .ok_or_else(|| missing("Success Sensor Data Requests Sent"))
        .and_then(|v| parse_count("Success Sensor Data Requests Sent", v))?;
    let reported_status_count = capture(&SYNC_SENT_RE, content)
        .ok_or_else(|| missing("Success Sync Data Requests Sent"))
        .and_then(|v| parse_count("Success Sync Data Requests Sent", v))?;

    Ok(RunSummary {
        start,
        end,
        device,
        reported_vital_count,
        reported_status_count,
    })
}

fn capture<'a>(re: &Regex, content: &'a str) -> Option<&'a str> {
    re.captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

fn parse_count(label: &str, value: &str) -> Result<u64, ReconcileError> {
    value
        .parse()
        .map_err(|e| ReconcileError::Parse(format!("{}: bad count '{}': {}", label, value, e)))
}

fn missing(label: &str) -> ReconcileError {
    ReconcileError::Parse(format!("missing field '{}'", label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    const LOG: &str = "\
==== Emulator Summary ====
Emulator Start Timestamp : 2025-05-13 09:30:59.512345Z
Device Type : 3
Device ID : 42
Total Sensor Data Requests Sent: 61
Success Sensor Data Requests Sent: 60
Success Sync Data Requests Sent: 12
Emualtor End Timestamp : 2025-05-13 09:31:59.004321Z
";

    #[test]
    fn test_parse_full_log() {
        let s = parse_run_summary(LOG).unwrap();
        assert_eq!(
            s.start,
            Utc.with_ymd_and_hms(2025, 5, 13, 9, 30, 59).unwrap()
                + chrono::Duration::microseconds(512_345)
        );
        assert_eq!(
            s.end,
            Utc.with_ymd_and_hms(2025, 5, 13, 9, 31, 59).unwrap()
                + chrono::Duration::microseconds(4_321)
        );
        assert_eq!(s.device, DeviceRef::new("3", "42"));
        assert_eq!(s.reported_vital_count, 60);
        assert_eq!(s.reported_status_count, 12);
    }

    #[test]
    fn test_device_defaults_when_absent() {
        let log = LOG.replace("Device Type : 3\n", "");
        let s = parse_run_summary(&log).unwrap();
        assert_eq!(s.device, DeviceRef::new("2", "1000200"));
    }

    #[test]
    fn test_correct_end_label_spelling_accepted() {
        let log = LOG.replace("Emualtor End", "Emulator End");
        assert!(parse_run_summary(&log).is_ok());
    }

    #[test]
    fn test_missing_count_is_parse_error() {
        let log = LOG.replace("Success Sync Data Requests Sent: 12\n", "");
        let err = parse_run_summary(&log).unwrap_err();
        assert_eq!(
            err,
            ReconcileError::Parse("missing field 'Success Sync Data Requests Sent'".into())
        );
    }

    #[test]
    fn test_bad_timestamp_is_parse_error() {
        let log = LOG.replace("2025-05-13 09:30:59.512345Z", "not a time");
        assert!(matches!(
            parse_run_summary(&log),
            Err(ReconcileError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LOG.as_bytes()).unwrap();
        let s = RunSummary::from_file(file.path()).unwrap();
        assert_eq!(s.reported_vital_count, 60);
    }
}
