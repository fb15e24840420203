//! Error taxonomy shared by every stage of a validation run.

use chrono::{DateTime, Utc};

/// Errors that can abort a validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Normalized window has start after end (input end < input start).
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// The identity service has no device-user mapping for the device.
    Resolution(String),
    /// Credentials were rejected by an external service.
    Auth(String),
    /// An external service could not be reached or answered unexpectedly.
    Transport(String),
    /// The store rejected the query or returned values we cannot read.
    Query(String),
    /// The emulator run summary is malformed.
    Parse(String),
    /// Configuration is missing or invalid.
    Config(String),
}

impl ReconcileError {
    /// Only transport failures are worth re-running later; everything else is
    /// an input, credential or construction problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Map a reqwest failure that happened before any response was received.
    pub(crate) fn from_request(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("{}: timed out: {}", context, err))
        } else {
            Self::Transport(format!("{}: {}", context, err))
        }
    }
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidWindow { start, end } => write!(
                f,
                "invalid window: start {} is after end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            ),
            Self::Resolution(msg) => write!(f, "identity resolution failed: {}", msg),
            Self::Auth(msg) => write!(f, "authentication failed: {}", msg),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Query(msg) => write!(f, "query error: {}", msg),
            Self::Parse(msg) => write!(f, "parse error: {}", msg),
            Self::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for ReconcileError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_invalid_window_display() {
        let err = ReconcileError::InvalidWindow {
            start: Utc.with_ymd_and_hms(2025, 5, 13, 9, 31, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 5, 13, 9, 30, 0).unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "invalid window: start 2025-05-13T09:31:00+00:00 is after end 2025-05-13T09:30:00+00:00"
        );
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(ReconcileError::Transport("down".into()).is_retryable());
        assert!(!ReconcileError::Auth("401".into()).is_retryable());
        assert!(!ReconcileError::Query("bad".into()).is_retryable());
        assert!(!ReconcileError::Resolution("none".into()).is_retryable());
    }
}
