//! Data Counter Library
//!
//! Checks that an emulator's self-reported request counts match what landed in
//! InfluxDB over the same window. Exposes the reconciliation pipeline for the
//! binaries and tests.

pub mod config;
pub mod counter;
pub mod error;
pub mod flux;
pub mod identity;
pub mod reconcile;
pub mod store;
pub mod summary;
pub mod window;

pub use config::{AppConfig, CoreApiConfig, InfluxConfig};
pub use counter::{
    CountKind, CountQuery, CountResult, DeviceCounter, QueryKind, RecordCounter, SubjectCounter,
};
pub use error::ReconcileError;
pub use identity::{CoreApiResolver, IdentityResolver, Subject};
pub use reconcile::{Reconciler, RunAborted, RunReport, RunStep, Verdict};
pub use store::{InfluxStore, TimeSeriesStore};
pub use summary::{parse_run_summary, DeviceRef, RunSummary};
pub use window::TimeWindow;

/// Install the stderr log subscriber shared by all binaries.
///
/// `RUST_LOG` wins; otherwise `default_directive` (e.g. `data_counter=info`).
pub fn init_tracing(default_directive: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
