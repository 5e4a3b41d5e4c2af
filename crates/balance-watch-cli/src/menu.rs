use std::io::{BufRead, Write};

use anyhow::{anyhow, Result};
use balance_watch_core::BalanceSource;

use crate::schedule::Cadence;
use crate::{
    diff_since, parse_target, print_observation, record_snapshot, schedule_snapshots, WatchConfig,
};

/// Prompt-driven front end: asks for an address, then one action.
///
/// # Errors
/// Returns an error when the address is empty, the chosen action fails, or
/// the prompt streams fail. An unknown choice is not an error.
pub fn run_menu(
    input: &mut dyn BufRead,
    out: &mut dyn Write,
    config: &WatchConfig,
    source: &dyn BalanceSource,
) -> Result<()> {
    writeln!(out, "=== Balance Watch ===")?;
    let address = prompt(input, out, "Enter wallet address: ")?;
    if address.is_empty() {
        writeln!(out, "Wallet address is required. Exiting.")?;
        return Err(anyhow!("wallet address is required"));
    }

    writeln!(out)?;
    writeln!(out, "Select an option:")?;
    writeln!(out, "1) Take a one-off snapshot")?;
    writeln!(out, "2) Schedule weekly snapshots")?;
    writeln!(
        out,
        "3) Schedule per-epoch snapshots (~{}h)",
        config.epoch_interval_hours
    )?;
    writeln!(out, "4) Compute balance change since a timestamp")?;
    let choice = prompt(input, out, "Enter choice (1-4): ")?;

    match choice.as_str() {
        "1" => {
            let observation = record_snapshot(config, source, &address)?;
            print_observation(out, config, &address, &observation, false)
        }
        "2" => schedule_snapshots(config, source, &address, Cadence::Weekly, false, out),
        "3" => schedule_snapshots(
            config,
            source,
            &address,
            Cadence::every_hours(config.epoch_interval_hours),
            false,
            out,
        ),
        "4" => {
            let raw = prompt(
                input,
                out,
                "Enter ISO-8601 timestamp (e.g., 2025-07-15T12:00:00+00:00): ",
            )?;
            let target = parse_target(&raw)?;
            diff_since(config, source, &address, target, false, out)
        }
        _ => {
            writeln!(out, "Invalid choice. Exiting.")?;
            Ok(())
        }
    }
}

fn prompt(input: &mut dyn BufRead, out: &mut dyn Write, label: &str) -> Result<String> {
    write!(out, "{label}")?;
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}
