//! compliance-node: Contribution limit enforcement for a campaign
//!
//! Runs next to the campaign's payment systems and:
//! - Keeps the local contribution record reconciled with the on-chain ledger
//! - Detects chain reorganizations and suspends affected records
//! - Issues recurring and scheduled payments as they fall due
//!
//! Operator subcommands run the same operations once and print JSON.

mod cli;
mod config;
mod daemon;

use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use config::Config;

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("compliance_node=info".parse()?)
        .add_directive("compliance_engine=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let mut config = Config::load(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(rpc_url) = cli.rpc_url {
        config.ledger.rpc_url = rpc_url;
    }

    info!(config = %cli.config.display(), data_dir = %config.node.data_dir.display(), "Starting compliance-node");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => daemon::run(config).await,
        command => cli::execute(&config, command).await,
    }
}
