//! valkey-cluster-cli - cluster-aware command-line client for Valkey
//!
//! Runs one command, prints the slot map, or starts an interactive prompt.

use anyhow::{Context, Result};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use valkey_cluster_client::config::{CliArgs, ClusterConfig};
use valkey_cluster_client::ClusterClient;

mod cli_mode;

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse_args();
    setup_logging(args.verbose, args.quiet);

    args.validate()
        .map_err(|e| anyhow::anyhow!("Invalid arguments: {}", e))?;
    let config = ClusterConfig::from_cli(&args).context("Configuration error")?;

    info!(
        "Seeds: {:?}, read from: {:?}",
        config.seeds.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        config.read_from
    );
    let client = ClusterClient::connect(config).context("Failed to connect to cluster")?;

    if args.topology {
        cli_mode::print_topology(&client.slot_map(), args.output_format);
        return Ok(());
    }
    if !args.command_args.is_empty() {
        return cli_mode::run_command(&client, &args.command_args, args.output_format);
    }
    cli_mode::run_repl(&client, args.output_format)
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
