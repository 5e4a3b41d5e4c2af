//! `bw` command surface.
//!
//! Embedders that need their own balance source or I/O streams go through:
//! - [`run_cli`] for full parsed CLI execution against the Solana RPC source.
//! - [`run_with_source`] for a resolved command against any [`BalanceSource`].

pub mod config;
pub mod menu;
pub mod schedule;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use balance_watch_core::{
    format_balance, format_signed_balance, format_timestamp, parse_timestamp, BalanceSource,
    DeltaReport, DeltaReporter, Observation, Recorder, SnapshotStore, WatchError,
};
use balance_watch_source_rpc::SolanaRpcSource;
use balance_watch_store_csv::CsvSnapshotStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use time::OffsetDateTime;

pub use config::WatchConfig;
pub use schedule::Cadence;

/// Display unit of balances returned by the RPC source.
const UNIT: &str = "SOL";

#[derive(Debug, Parser)]
#[command(name = "bw")]
#[command(about = "Balance Watch: snapshot a wallet balance and report changes over time")]
pub struct Cli {
    /// YAML config file; flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    rpc_url: Option<String>,
    /// Snapshot log path; `{address}` expands to the watched address.
    #[arg(long, global = true)]
    store: Option<String>,
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Take a one-off snapshot.
    Record(RecordArgs),
    /// Take snapshots on a weekly or per-epoch cadence until interrupted.
    Schedule(ScheduleArgs),
    /// Compute the balance change since a timestamp.
    Diff(DiffArgs),
    /// List stored snapshots.
    History(HistoryArgs),
    /// Interactive prompt.
    Menu,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    address: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ScheduleArgs {
    #[arg(long)]
    address: String,
    #[arg(long, value_enum)]
    cadence: CadenceArg,
    /// Overrides `epoch_interval_hours` for the epoch cadence.
    #[arg(long)]
    interval_hours: Option<u32>,
    /// Also take a snapshot right away.
    #[arg(long)]
    immediately: bool,
}

#[derive(Debug, Args)]
pub struct DiffArgs {
    #[arg(long)]
    address: String,
    /// RFC3339 timestamp with offset, e.g. 2025-07-15T12:00:00+00:00.
    #[arg(long)]
    since: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    address: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CadenceArg {
    Weekly,
    Epoch,
}

impl Cli {
    /// Builds the effective config and hands back the command to run.
    ///
    /// # Errors
    /// Returns an error when the config file is unreadable or the merged
    /// settings are invalid.
    pub fn resolve(self) -> Result<(WatchConfig, Command)> {
        let mut config = match &self.config {
            Some(path) => WatchConfig::load(path)?,
            None => WatchConfig::default(),
        };
        if let Some(rpc_url) = self.rpc_url {
            config.rpc_url = rpc_url;
        }
        if let Some(store) = self.store {
            config.store_path = store;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        config.validate()?;

        Ok((config, self.command))
    }
}

/// Executes the parsed CLI against the configured Solana RPC endpoint.
///
/// # Errors
/// Returns an error when config resolution or the command fails. A missing
/// snapshot history is reported on stdout and is not an error.
pub fn run_cli(cli: Cli) -> Result<()> {
    let (config, command) = cli.resolve()?;
    let source = SolanaRpcSource::new(config.rpc_url.clone(), config.timeout_ms);

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout();
    run_with_source(command, &config, &source, &mut input, &mut out)
}

/// Executes a resolved command with an explicit source and I/O streams.
///
/// # Errors
/// Returns an error when the command fails; see [`run_cli`].
pub fn run_with_source(
    command: Command,
    config: &WatchConfig,
    source: &dyn BalanceSource,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Command::Record(args) => {
            let address = require_address(&args.address)?;
            let observation = record_snapshot(config, source, address)?;
            print_observation(out, config, address, &observation, args.json)
        }
        Command::Schedule(args) => {
            let address = require_address(&args.address)?;
            let cadence = match args.cadence {
                CadenceArg::Weekly => Cadence::Weekly,
                CadenceArg::Epoch => {
                    let hours = args.interval_hours.unwrap_or(config.epoch_interval_hours);
                    if hours == 0 {
                        return Err(anyhow!("--interval-hours must be greater than zero"));
                    }
                    Cadence::every_hours(hours)
                }
            };
            schedule_snapshots(config, source, address, cadence, args.immediately, out)
        }
        Command::Diff(args) => {
            let address = require_address(&args.address)?;
            let target = parse_target(&args.since)?;
            diff_since(config, source, address, target, args.json, out)
        }
        Command::History(args) => {
            let address = require_address(&args.address)?;
            print_history(config, address, args.json, out)
        }
        Command::Menu => menu::run_menu(input, out, config, source),
    }
}

/// Samples `address` once and appends the result to its log.
///
/// # Errors
/// Returns the source or storage failure unchanged.
pub fn record_snapshot(
    config: &WatchConfig,
    source: &dyn BalanceSource,
    address: &str,
) -> Result<Observation> {
    let store = CsvSnapshotStore::open(config.store_path_for(address)?);
    let observation = Recorder::new(source, &store).record(address)?;
    log::info!(
        "recorded {} {UNIT} for {address} from {} into {}",
        format_balance(observation.balance),
        source.source_name(),
        store.path().display()
    );
    Ok(observation)
}

/// Blocks, recording on `cadence` until Ctrl+C.
///
/// # Errors
/// Returns an error when the stop handler cannot be installed or output fails.
pub fn schedule_snapshots(
    config: &WatchConfig,
    source: &dyn BalanceSource,
    address: &str,
    cadence: Cadence,
    immediately: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let running = schedule::install_stop_handler()?;
    writeln!(out, "Scheduled snapshots {cadence} for {address}. Press Ctrl+C to stop.")?;
    out.flush()?;

    let runs = schedule::run_schedule(cadence, immediately, &running, || {
        let observation = record_snapshot(config, source, address)?;
        print_observation(out, config, address, &observation, false)?;
        out.flush()?;
        Ok(())
    });

    writeln!(out, "Scheduler stopped after {runs} run(s).")?;
    Ok(())
}

/// Prints the change since the snapshot nearest to `target`.
///
/// # Errors
/// Returns every [`WatchError`] except `StoreNotFound`, which is printed as
/// "no history".
pub fn diff_since(
    config: &WatchConfig,
    source: &dyn BalanceSource,
    address: &str,
    target: OffsetDateTime,
    json: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let store = CsvSnapshotStore::open(config.store_path_for(address)?);
    match DeltaReporter::new(source, &store).report(address, target) {
        Ok(report) => print_report(out, &report, json),
        Err(WatchError::StoreNotFound(path)) => print_no_history(out, address, &path, json),
        Err(err) => Err(err.into()),
    }
}

fn print_history(config: &WatchConfig, address: &str, json: bool, out: &mut dyn Write) -> Result<()> {
    let store = CsvSnapshotStore::open(config.store_path_for(address)?);
    let observations = match store.load_all() {
        Ok(observations) => observations,
        Err(WatchError::StoreNotFound(path)) => {
            return print_no_history(out, address, &path, json);
        }
        Err(err) => return Err(err.into()),
    };

    if json {
        let payload = json!({
            "address": address,
            "store": store.path().display().to_string(),
            "observations": observations,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        return Ok(());
    }

    writeln!(out, "{:<36} {:>20}", "timestamp", "balance")?;
    writeln!(out, "{}", "-".repeat(57))?;
    for observation in &observations {
        writeln!(
            out,
            "{:<36} {:>20}",
            format_timestamp(observation.timestamp)?,
            format_balance(observation.balance)
        )?;
    }
    writeln!(
        out,
        "{} snapshot(s) in {}",
        observations.len(),
        store.path().display()
    )?;
    Ok(())
}

fn print_observation(
    out: &mut dyn Write,
    config: &WatchConfig,
    address: &str,
    observation: &Observation,
    json: bool,
) -> Result<()> {
    if json {
        let payload = json!({
            "address": address,
            "store": config.store_path_for(address)?.display().to_string(),
            "observation": observation,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        return Ok(());
    }

    writeln!(
        out,
        "[{}] {address} → {} {UNIT}",
        format_timestamp(observation.timestamp)?,
        format_balance(observation.balance)
    )?;
    Ok(())
}

fn print_report(out: &mut dyn Write, report: &DeltaReport, json: bool) -> Result<()> {
    if json {
        let mut payload = serde_json::to_value(report)?;
        payload["distance_seconds"] = json!(report.distance().whole_seconds());
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        return Ok(());
    }

    let matched_at = format_timestamp(report.matched.timestamp)?;
    writeln!(
        out,
        "Snapshot @ {matched_at} → {} {UNIT}",
        format_balance(report.matched.balance)
    )?;
    writeln!(
        out,
        "Current balance → {} {UNIT}",
        format_balance(report.current_balance)
    )?;
    writeln!(
        out,
        "Δ since {matched_at} = {} {UNIT}",
        format_signed_balance(report.delta)
    )?;
    Ok(())
}

fn print_no_history(out: &mut dyn Write, address: &str, path: &str, json: bool) -> Result<()> {
    if json {
        let payload = json!({
            "address": address,
            "store": path,
            "status": "no_history",
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
    } else {
        writeln!(out, "No snapshots found ({path} missing).")?;
    }
    Ok(())
}

fn require_address(raw: &str) -> Result<&str> {
    let address = raw.trim();
    if address.is_empty() {
        return Err(anyhow!("wallet address is required"));
    }
    Ok(address)
}

fn parse_target(raw: &str) -> Result<OffsetDateTime> {
    parse_timestamp(raw.trim()).with_context(|| {
        format!("invalid timestamp '{}'; expected e.g. 2025-07-15T12:00:00+00:00", raw.trim())
    })
}
