//! Resolve Device User
//!
//! Prints the device user ID the core API maps a device to.
//!
//! Usage:
//!   resolve_device_user <DEVICE_TYPE> <DEVICE_ID>

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use data_counter::{init_tracing, AppConfig, CoreApiResolver, DeviceRef, IdentityResolver};

#[derive(Parser, Debug)]
#[command(name = "resolve_device_user")]
#[command(about = "Look up the device user of a device in the core API")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "DATA_COUNTER_CONFIG")]
    config: Option<PathBuf>,

    device_type: String,

    device_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("data_counter=warn");
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    let resolver = CoreApiResolver::new(&config.core_api).context("core API client")?;

    let subject = resolver
        .resolve(&DeviceRef::new(args.device_type, args.device_id))
        .await?;
    println!("{}", subject);
    Ok(())
}
