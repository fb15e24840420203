//! Data Counter
//!
//! Reconciles an emulator run summary with the records InfluxDB actually holds.
//!
//! Usage:
//!   emulator ... | data_counter
//!   data_counter --log-file output.txt --config data_counter.toml
//!
//! The log is read from `--log-file`, else from stdin when it is piped, else
//! from `output.txt`. Exit status is non-zero when the run aborts, and with
//! `--strict` also when any count mismatches.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use data_counter::{
    init_tracing, parse_run_summary, AppConfig, CoreApiResolver, InfluxStore, Reconciler,
    RunReport, RunSummary,
};

const DEFAULT_LOG_FILE: &str = "output.txt";

#[derive(Parser, Debug)]
#[command(name = "data_counter")]
#[command(about = "Check emulator request counts against InfluxDB")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "DATA_COUNTER_CONFIG")]
    config: Option<PathBuf>,

    /// Emulator output to validate (defaults to stdin when piped, else output.txt)
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Exit with status 2 when any count mismatches
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing("data_counter=info");
    let args = Args::parse();

    match run(&args).await {
        Ok(report) => {
            if args.strict && !report.all_matched() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<RunReport> {
    let summary = read_summary(args.log_file.as_deref())?;
    info!(
        reported_vital = summary.reported_vital_count,
        reported_status = summary.reported_status_count,
        "Parsed emulator summary"
    );

    let config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    let resolver = CoreApiResolver::new(&config.core_api).context("core API client")?;
    let store = InfluxStore::connect(&config.influx2).context("InfluxDB client")?;

    let report = Reconciler::new(&resolver, &store, &config.influx2.bucket)
        .run(&summary)
        .await?;
    drop(store);

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("encoding report")?
        );
    } else {
        print_report(&report);
    }

    Ok(report)
}

fn read_summary(log_file: Option<&std::path::Path>) -> Result<RunSummary> {
    if let Some(path) = log_file {
        return RunSummary::from_file(path)
            .with_context(|| format!("reading emulator output {}", path.display()));
    }

    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        let mut content = String::new();
        stdin
            .lock()
            .read_to_string(&mut content)
            .context("reading emulator output from stdin")?;
        return parse_run_summary(&content).context("parsing emulator output from stdin");
    }

    RunSummary::from_file(std::path::Path::new(DEFAULT_LOG_FILE))
        .with_context(|| format!("reading emulator output {}", DEFAULT_LOG_FILE))
}

fn print_report(report: &RunReport) {
    println!("Window: {}", report.window);
    println!("Device user ID: {}", report.subject);
    for verdict in report.verdicts() {
        println!(
            "File count: {}, Query count: {}{}",
            verdict.reported,
            verdict.observed,
            if verdict.no_data { " (no data)" } else { "" }
        );
    }
    println!("Vital count match: {}", report.vital.matched);
    println!("Device status count match: {}", report.device_status.matched);
}
