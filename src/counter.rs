//! Record Counters
//!
//! Two counters share one contract, `count(window) -> CountResult`:
//! - [`SubjectCounter`]: vital records of one device user
//! - [`DeviceCounter`]: device status records of one device
//!
//! Both build a [`CountQuery`] (measurement, field, then entity filters, in that
//! order), render it to Flux and run it through the same store path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ReconcileError;
use crate::flux::FluxQuery;
use crate::identity::Subject;
use crate::store::TimeSeriesStore;
use crate::summary::DeviceRef;
use crate::window::TimeWindow;

pub const VITAL_MEASUREMENT: &str = "vital";
pub const VITAL_FIELD: &str = "status";
pub const DEVICE_USER_TAG: &str = "device_user_id";

pub const DEVICE_STATUS_MEASUREMENT: &str = "device_status";
pub const DEVICE_STATUS_FIELD: &str = "battery";
pub const DEVICE_TYPE_TAG: &str = "device_type";
pub const DEVICE_ID_TAG: &str = "device_id";

/// Which reported counter a count is reconciled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountKind {
    /// Sensor data requests -> `vital` records
    Vital,
    /// Sync data requests -> `device_status` records
    DeviceStatus,
}

impl std::fmt::Display for CountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vital => write!(f, "vital"),
            Self::DeviceStatus => write!(f, "device status"),
        }
    }
}

/// Shape of the entity filter a query carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Subject,
    Device,
}

/// One count request: kind, window and ordered equality filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountQuery {
    pub kind: QueryKind,
    pub window: TimeWindow,
    pub filters: Vec<(String, String)>,
}

impl CountQuery {
    pub fn for_subject(subject: &Subject, window: &TimeWindow) -> Self {
        Self {
            kind: QueryKind::Subject,
            window: *window,
            filters: vec![
                ("_measurement".to_string(), VITAL_MEASUREMENT.to_string()),
                ("_field".to_string(), VITAL_FIELD.to_string()),
                (DEVICE_USER_TAG.to_string(), subject.as_str().to_string()),
            ],
        }
    }

    pub fn for_device(device: &DeviceRef, window: &TimeWindow) -> Self {
        Self {
            kind: QueryKind::Device,
            window: *window,
            filters: vec![
                (
                    "_measurement".to_string(),
                    DEVICE_STATUS_MEASUREMENT.to_string(),
                ),
                ("_field".to_string(), DEVICE_STATUS_FIELD.to_string()),
                (DEVICE_TYPE_TAG.to_string(), device.device_type.clone()),
                (DEVICE_ID_TAG.to_string(), device.device_id.clone()),
            ],
        }
    }

    pub fn to_flux(&self, bucket: &str) -> FluxQuery {
        self.filters
            .iter()
            .fold(FluxQuery::count(bucket, &self.window), |q, (k, v)| {
                q.filter(k.as_str(), v.as_str())
            })
    }
}

/// Outcome of a count query.
///
/// `Empty` (store returned no rows) is kept apart from `Found(0)` so callers
/// can tell "nothing in range" from "counted zero"; both compare as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountResult {
    Found(u64),
    Empty,
}

impl CountResult {
    #[inline]
    pub fn value(&self) -> u64 {
        match self {
            Self::Found(n) => *n,
            Self::Empty => 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl std::fmt::Display for CountResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[async_trait]
pub trait RecordCounter: Send + Sync {
    fn kind(&self) -> CountKind;

    async fn count(&self, window: &TimeWindow) -> Result<CountResult, ReconcileError>;
}

/// Counts `vital/status` records of one device user.
pub struct SubjectCounter<'a, S> {
    store: &'a S,
    bucket: &'a str,
    subject: Subject,
}

impl<'a, S: TimeSeriesStore> SubjectCounter<'a, S> {
    pub fn new(store: &'a S, bucket: &'a str, subject: Subject) -> Self {
        Self {
            store,
            bucket,
            subject,
        }
    }
}

#[async_trait]
impl<'a, S: TimeSeriesStore> RecordCounter for SubjectCounter<'a, S> {
    fn kind(&self) -> CountKind {
        CountKind::Vital
    }

    async fn count(&self, window: &TimeWindow) -> Result<CountResult, ReconcileError> {
        let query = CountQuery::for_subject(&self.subject, window);
        execute_count(self.store, self.bucket, &query).await
    }
}

/// Counts `device_status/battery` records of one device.
pub struct DeviceCounter<'a, S> {
    store: &'a S,
    bucket: &'a str,
    device: DeviceRef,
}

impl<'a, S: TimeSeriesStore> DeviceCounter<'a, S> {
    pub fn new(store: &'a S, bucket: &'a str, device: DeviceRef) -> Self {
        Self {
            store,
            bucket,
            device,
        }
    }
}

#[async_trait]
impl<'a, S: TimeSeriesStore> RecordCounter for DeviceCounter<'a, S> {
    fn kind(&self) -> CountKind {
        CountKind::DeviceStatus
    }

    async fn count(&self, window: &TimeWindow) -> Result<CountResult, ReconcileError> {
        let query = CountQuery::for_device(&self.device, window);
        execute_count(self.store, self.bucket, &query).await
    }
}

/// Run `query` and reduce the returned rows to a single count.
///
/// Several rows (one per series) resolve to the last row's value.
pub async fn execute_count<S: TimeSeriesStore + ?Sized>(
    store: &S,
    bucket: &str,
    query: &CountQuery,
) -> Result<CountResult, ReconcileError> {
    let flux = query.to_flux(bucket).render();
    debug!(kind = ?query.kind, query = %flux, "Running count query");

    let values = store.query_values(&flux).await?;

    let Some(&last) = values.last() else {
        warn!(
            kind = ?query.kind,
            window = %query.window,
            query = %flux,
            "No data found in the given time range"
        );
        return Ok(CountResult::Empty);
    };

    if values.len() > 1 {
        debug!(
            rows = values.len(),
            "Count query returned several rows, taking the last"
        );
    }

    u64::try_from(last)
        .map(CountResult::Found)
        .map_err(|_| ReconcileError::Query(format!("negative count {} returned", last)))
}
