//! Time Window Normalization
//!
//! The emulator stamps its run with microsecond precision, while count queries
//! are issued over a second-aligned range. Normalization only ever widens the
//! window: the start is floored and the end is ceiled, so a record written in
//! the last fraction of a second is never cut off by the query boundary.
//!
//! All arithmetic happens in UTC. Inputs carrying another zone are converted
//! before any truncation.

use chrono::{
    DateTime, Duration, Local, LocalResult, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone,
    Timelike, Utc,
};
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

/// Emulator log timestamp layout, e.g. `2025-05-13 18:30:59.123456`.
/// `%.f` also accepts a stamp without a fractional part.
pub const EMULATOR_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const ZONED_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %:z",
    "%Y-%m-%d %H:%M:%S%.f %z",
];

/// Closed, second-aligned time range a count query is evaluated over.
///
/// Invariants: `start <= end` and neither bound has a sub-second component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Floor `start`, ceil `end`, both in UTC.
    ///
    /// Fails with [`ReconcileError::InvalidWindow`] when the normalized start
    /// lies after the normalized end. The bounds are never swapped.
    pub fn normalize<Tz: TimeZone>(
        start: &DateTime<Tz>,
        end: &DateTime<Tz>,
    ) -> Result<Self, ReconcileError> {
        let start = floor_to_second(&start.with_timezone(&Utc));
        let end = ceil_to_second(&end.with_timezone(&Utc));

        if start > end {
            return Err(ReconcileError::InvalidWindow { start, end });
        }

        Ok(Self { start, end })
    }

    #[inline]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[inline]
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Start bound as used in queries, e.g. `2025-05-13T09:30:59Z`.
    pub fn start_rfc3339(&self) -> String {
        format_rfc3339(&self.start)
    }

    /// End bound as used in queries, e.g. `2025-05-13T09:31:59Z`.
    pub fn end_rfc3339(&self) -> String {
        format_rfc3339(&self.end)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start_rfc3339(), self.end_rfc3339())
    }
}

/// Drop the sub-second component (truncation, no rounding).
#[inline]
pub fn floor_to_second(ts: &DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Round up to the next whole second unless already aligned.
#[inline]
pub fn ceil_to_second(ts: &DateTime<Utc>) -> DateTime<Utc> {
    let floored = ts.trunc_subsecs(0);
    if ts.nanosecond() == 0 {
        floored
    } else {
        floored + Duration::seconds(1)
    }
}

/// `2025-05-13T09:30:59Z` for aligned stamps, fractional seconds otherwise.
pub fn format_rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an emulator log timestamp.
///
/// A trailing `Z` or numeric offset is honoured. A naive stamp is taken to be
/// in the host's local zone, which is how the emulator writes it.
pub fn parse_emulator_timestamp(text: &str) -> Result<DateTime<Utc>, ReconcileError> {
    let text = text.trim();

    if let Some(naive) = text.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(naive.trim_end(), EMULATOR_TIMESTAMP_FORMAT)
            .map_err(|e| ReconcileError::Parse(format!("bad timestamp '{}': {}", text, e)))?;
        return Ok(Utc.from_utc_datetime(&naive));
    }

    for fmt in ZONED_TIMESTAMP_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(text, fmt) {
            return Ok(ts.with_timezone(&Utc));
        }
    }

    let naive = NaiveDateTime::parse_from_str(text, EMULATOR_TIMESTAMP_FORMAT)
        .map_err(|e| ReconcileError::Parse(format!("bad timestamp '{}': {}", text, e)))?;

    local_to_utc(&naive, |n| {
        Local
            .from_local_datetime(n)
            .map(|ts| ts.with_timezone(&Utc))
    })
    .ok_or_else(|| {
        ReconcileError::Parse(format!(
            "timestamp '{}' does not exist in the local time zone",
            text
        ))
    })
}

/// Resolve a wall-clock time through `resolve`, taking the earlier instant of
/// an ambiguous time. A time skipped by a forward DST jump is read with the
/// offset in force just before the jump.
fn local_to_utc<F>(naive: &NaiveDateTime, resolve: F) -> Option<DateTime<Utc>>
where
    F: Fn(&NaiveDateTime) -> LocalResult<DateTime<Utc>>,
{
    resolve(naive).earliest().or_else(|| {
        let before = *naive - Duration::hours(1);
        resolve(&before).earliest().map(|ts| ts + Duration::hours(1))
    })
}

/// Parse an RFC3339 stamp such as `2025-05-13T09:30:59Z` or `...+09:00`.
pub fn parse_rfc3339(text: &str) -> Result<DateTime<Utc>, ReconcileError> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ReconcileError::Parse(format!("bad RFC3339 timestamp '{}': {}", text, e)))
}
