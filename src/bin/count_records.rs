//! Count Records
//!
//! Runs a single count query and prints the integer result.
//!
//! Usage:
//!   count_records --kind vital --subject <DEVICE_USER_ID> \
//!       --start 2025-05-13T09:30:59Z --end 2025-05-13T09:31:59Z
//!   count_records --kind device-status --device-type 2 --device-id 1000200 \
//!       --start 2025-05-13T09:30:59Z --end 2025-05-13T09:31:59Z

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use data_counter::{
    init_tracing, window::parse_rfc3339, AppConfig, DeviceCounter, DeviceRef, InfluxStore,
    RecordCounter, Subject, SubjectCounter, TimeWindow,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Kind {
    Vital,
    DeviceStatus,
}

#[derive(Parser, Debug)]
#[command(name = "count_records")]
#[command(about = "Count vital or device status records in InfluxDB")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "DATA_COUNTER_CONFIG")]
    config: Option<PathBuf>,

    /// Type of data to query
    #[arg(long, value_enum)]
    kind: Kind,

    /// Start time (e.g. 2025-05-13T09:30:59Z)
    #[arg(long)]
    start: String,

    /// End time (e.g. 2025-05-13T09:31:59Z)
    #[arg(long)]
    end: String,

    /// Device user ID (for vital)
    #[arg(long, required_if_eq("kind", "vital"))]
    subject: Option<String>,

    /// Device type (for device-status)
    #[arg(long, required_if_eq("kind", "device-status"))]
    device_type: Option<String>,

    /// Device ID (for device-status)
    #[arg(long, required_if_eq("kind", "device-status"))]
    device_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("data_counter=info,count_records=info");
    let args = Args::parse();

    let start = parse_rfc3339(&args.start).context("--start")?;
    let end = parse_rfc3339(&args.end).context("--end")?;
    let window = TimeWindow::normalize(&start, &end)?;

    let config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    let store = InfluxStore::connect(&config.influx2).context("InfluxDB client")?;
    let bucket = config.influx2.bucket.as_str();

    let result = match args.kind {
        Kind::Vital => {
            let Some(subject) = args.subject else {
                bail!("--subject is required when --kind is 'vital'");
            };
            SubjectCounter::new(&store, bucket, Subject::new(subject))
                .count(&window)
                .await?
        }
        Kind::DeviceStatus => {
            let (Some(device_type), Some(device_id)) = (args.device_type, args.device_id) else {
                bail!("--device-type and --device-id are required when --kind is 'device-status'");
            };
            DeviceCounter::new(&store, bucket, DeviceRef::new(device_type, device_id))
                .count(&window)
                .await?
        }
    };

    info!(kind = ?args.kind, %window, no_data = result.is_empty(), "Counted records");
    println!("{}", result);
    Ok(())
}
