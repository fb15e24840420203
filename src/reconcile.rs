//! Reconciliation Engine
//!
//! One pass, no retries:
//!
//! 1. normalize the run window
//! 2. resolve the device user
//! 3. count vital records for that user
//! 4. count device status records for the device
//! 5. compare each observed count with the reported one
//!
//! Any failure in 1-4 aborts the run and names the step; no partial verdicts
//! are produced. A mismatch is a normal outcome, not an error.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::counter::{CountKind, CountResult, DeviceCounter, RecordCounter, SubjectCounter};
use crate::error::ReconcileError;
use crate::identity::{IdentityResolver, Subject};
use crate::store::TimeSeriesStore;
use crate::summary::RunSummary;
use crate::window::TimeWindow;

/// Reported vs observed comparison for one count kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: CountKind,
    pub reported: u64,
    pub observed: u64,
    /// The store returned no rows at all (observed is then 0).
    pub no_data: bool,
    pub matched: bool,
}

impl Verdict {
    pub fn new(kind: CountKind, reported: u64, observed: CountResult) -> Self {
        let observed_count = observed.value();
        Self {
            kind,
            reported,
            observed: observed_count,
            no_data: observed.is_empty(),
            matched: reported == observed_count,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: reported {}, observed {}{} -> {}",
            self.kind,
            self.reported,
            self.observed,
            if self.no_data { " (no data in range)" } else { "" },
            if self.matched { "Match" } else { "Mismatch" }
        )
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub window: TimeWindow,
    pub subject: Subject,
    pub vital: Verdict,
    pub device_status: Verdict,
}

impl RunReport {
    pub fn verdicts(&self) -> [&Verdict; 2] {
        [&self.vital, &self.device_status]
    }

    pub fn all_matched(&self) -> bool {
        self.vital.matched && self.device_status.matched
    }
}

/// Step of the run that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStep {
    NormalizeWindow,
    ResolveSubject,
    CountVital,
    CountDeviceStatus,
}

impl std::fmt::Display for RunStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NormalizeWindow => write!(f, "window normalization"),
            Self::ResolveSubject => write!(f, "device user resolution"),
            Self::CountVital => write!(f, "vital count"),
            Self::CountDeviceStatus => write!(f, "device status count"),
        }
    }
}

/// A run that could not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAborted {
    pub step: RunStep,
    pub error: ReconcileError,
}

impl std::fmt::Display for RunAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

impl std::error::Error for RunAborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

trait AtStep<T> {
    fn at(self, step: RunStep) -> Result<T, RunAborted>;
}

impl<T> AtStep<T> for Result<T, ReconcileError> {
    fn at(self, step: RunStep) -> Result<T, RunAborted> {
        self.map_err(|error| {
            error!(%step, %error, "Validation run aborted");
            RunAborted { step, error }
        })
    }
}

/// Drives one validation run against a resolver and a store the caller owns.
pub struct Reconciler<'a, R: ?Sized, S> {
    resolver: &'a R,
    store: &'a S,
    bucket: &'a str,
}

impl<'a, R, S> Reconciler<'a, R, S>
where
    R: IdentityResolver + ?Sized,
    S: TimeSeriesStore,
{
    pub fn new(resolver: &'a R, store: &'a S, bucket: &'a str) -> Self {
        Self {
            resolver,
            store,
            bucket,
        }
    }

    pub async fn run(&self, summary: &RunSummary) -> Result<RunReport, RunAborted> {
        let window = TimeWindow::normalize(&summary.start, &summary.end)
            .at(RunStep::NormalizeWindow)?;
        info!(%window, device = %summary.device, "Normalized run window");

        let subject = self
            .resolver
            .resolve(&summary.device)
            .await
            .at(RunStep::ResolveSubject)?;
        info!(%subject, "Device user ID");

        let vital_counter = SubjectCounter::new(self.store, self.bucket, subject.clone());
        let observed_vital = vital_counter.count(&window).await.at(RunStep::CountVital)?;

        let status_counter = DeviceCounter::new(self.store, self.bucket, summary.device.clone());
        let observed_status = status_counter
            .count(&window)
            .await
            .at(RunStep::CountDeviceStatus)?;

        let vital = Verdict::new(
            vital_counter.kind(),
            summary.reported_vital_count,
            observed_vital,
        );
        let device_status = Verdict::new(
            status_counter.kind(),
            summary.reported_status_count,
            observed_status,
        );

        for verdict in [&vital, &device_status] {
            if verdict.matched {
                info!(kind = %verdict.kind, count = verdict.observed, "Count match");
            } else {
                warn!(
                    kind = %verdict.kind,
                    reported = verdict.reported,
                    observed = verdict.observed,
                    no_data = verdict.no_data,
                    "Count mismatch"
                );
            }
        }

        Ok(RunReport {
            window,
            subject,
            vital,
            device_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::DeviceRef;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedResolver(Result<Subject, ReconcileError>);

    #[async_trait]
    impl IdentityResolver for FixedResolver {
        async fn resolve(&self, _device: &DeviceRef) -> Result<Subject, ReconcileError> {
            self.0.clone()
        }
    }

    /// Answers vital and device status queries from separate canned results.
    struct SplitStore {
        vital: Result<Vec<i64>, ReconcileError>,
        status: Result<Vec<i64>, ReconcileError>,
        calls: AtomicUsize,
    }

    impl SplitStore {
        fn new(vital: Vec<i64>, status: Vec<i64>) -> Self {
            Self {
                vital: Ok(vital),
                status: Ok(status),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TimeSeriesStore for SplitStore {
        async fn query_values(&self, flux: &str) -> Result<Vec<i64>, ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if flux.contains("\"device_status\"") {
                self.status.clone()
            } else {
                self.vital.clone()
            }
        }
    }

    fn ts(h: u32, m: u32, s: u32, millis: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 13, h, m, s).unwrap() + Duration::milliseconds(millis)
    }

    fn summary(vital: u64, status: u64) -> RunSummary {
        RunSummary {
            start: ts(9, 30, 59, 500),
            end: ts(9, 31, 59, 250),
            device: DeviceRef::default(),
            reported_vital_count: vital,
            reported_status_count: status,
        }
    }

    fn resolver() -> FixedResolver {
        FixedResolver(Ok(Subject::new("user-1")))
    }

    #[tokio::test]
    async fn test_both_counts_match() {
        let store = SplitStore::new(vec![5], vec![3]);
        let resolver = resolver();
        let report = Reconciler::new(&resolver, &store, "cotons_vet")
            .run(&summary(5, 3))
            .await
            .unwrap();

        assert_eq!(report.window.start_rfc3339(), "2025-05-13T09:30:59Z");
        assert_eq!(report.window.end_rfc3339(), "2025-05-13T09:32:00Z");
        assert_eq!(report.subject, Subject::new("user-1"));
        assert!(report.vital.matched);
        assert!(report.device_status.matched);
        assert!(report.all_matched());
    }

    #[tokio::test]
    async fn test_no_rows_matches_zero_report() {
        let store = SplitStore::new(vec![5], vec![]);
        let resolver = resolver();
        let report = Reconciler::new(&resolver, &store, "b")
            .run(&summary(5, 0))
            .await
            .unwrap();
        assert_eq!(report.device_status.observed, 0);
        assert!(report.device_status.no_data);
        assert!(report.device_status.matched);
    }

    #[tokio::test]
    async fn test_no_rows_mismatches_nonzero_report() {
        let store = SplitStore::new(vec![5], vec![]);
        let resolver = resolver();
        let report = Reconciler::new(&resolver, &store, "b")
            .run(&summary(5, 3))
            .await
            .unwrap();
        assert!(report.vital.matched);
        assert!(!report.device_status.matched);
        assert!(report.device_status.no_data);
        assert!(!report.all_matched());
        assert_eq!(
            report.device_status.to_string(),
            "device status: reported 3, observed 0 (no data in range) -> Mismatch"
        );
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_before_any_query() {
        let store = SplitStore::new(vec![5], vec![3]);
        let resolver = FixedResolver(Err(ReconcileError::Auth("401 Unauthorized".into())));
        let aborted = Reconciler::new(&resolver, &store, "b")
            .run(&summary(5, 3))
            .await
            .unwrap_err();

        assert_eq!(aborted.step, RunStep::ResolveSubject);
        assert!(matches!(aborted.error, ReconcileError::Auth(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            aborted.to_string(),
            "device user resolution failed: authentication failed: 401 Unauthorized"
        );
    }

    #[tokio::test]
    async fn test_reversed_window_aborts_first() {
        let store = SplitStore::new(vec![5], vec![3]);
        let resolver = resolver();
        let mut s = summary(5, 3);
        std::mem::swap(&mut s.start, &mut s.end);
        s.start = ts(9, 35, 0, 0);

        let aborted = Reconciler::new(&resolver, &store, "b")
            .run(&s)
            .await
            .unwrap_err();
        assert_eq!(aborted.step, RunStep::NormalizeWindow);
        assert!(matches!(aborted.error, ReconcileError::InvalidWindow { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_status_query_failure_is_not_zero() {
        let store = SplitStore {
            vital: Ok(vec![5]),
            status: Err(ReconcileError::Query("bad filter".into())),
            calls: AtomicUsize::new(0),
        };
        let resolver = resolver();
        let aborted = Reconciler::new(&resolver, &store, "b")
            .run(&summary(5, 0))
            .await
            .unwrap_err();
        assert_eq!(aborted.step, RunStep::CountDeviceStatus);
        assert_eq!(aborted.error, ReconcileError::Query("bad filter".into()));
    }

    #[tokio::test]
    async fn test_vital_transport_failure_stops_run() {
        let store = SplitStore {
            vital: Err(ReconcileError::Transport("connection refused".into())),
            status: Ok(vec![3]),
            calls: AtomicUsize::new(0),
        };
        let resolver = resolver();
        let aborted = Reconciler::new(&resolver, &store, "b")
            .run(&summary(5, 3))
            .await
            .unwrap_err();
        assert_eq!(aborted.step, RunStep::CountVital);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verdict_from_found_zero() {
        let v = Verdict::new(CountKind::Vital, 0, CountResult::Found(0));
        assert!(v.matched);
        assert!(!v.no_data);
        assert_eq!(v.to_string(), "vital: reported 0, observed 0 -> Match");
    }
}
