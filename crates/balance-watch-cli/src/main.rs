use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = balance_watch_cli::Cli::parse();
    balance_watch_cli::run_cli(cli)
}
