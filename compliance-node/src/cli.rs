//! Operator CLI
//!
//! One-shot commands against the same store and ledger the daemon uses.
//! Results are printed as JSON.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use compliance_engine::{
    AdmissionRequest, Cents, DonationType, DonorKey, EngineError, Frequency, PaymentRail,
    RecurringDetails,
};

use crate::config::Config;
use crate::daemon::Engine;

#[derive(Debug, Parser)]
#[command(name = "compliance-node")]
#[command(about = "Contribution limit enforcement and ledger reconciliation")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "COMPLIANCE_CONFIG", default_value = "compliance-node.toml")]
    pub config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "COMPLIANCE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Ledger JSON-RPC endpoint (overrides config file)
    #[arg(long, env = "COMPLIANCE_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "COMPLIANCE_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the reconciler, chain watcher and payment scheduler (default)
    Run,

    /// Ingest contribution events in a block range
    Sync {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },

    /// Sync from the stored cursor to the confirmed head
    Backfill,

    /// Suspend records at or above a replaced block
    Reorg {
        #[arg(long)]
        block: u64,
    },

    /// Re-check reorg suspects and stale pending records against receipts
    Reverify,

    /// Roll back a reorg suspect that will not reappear
    Invalidate {
        #[arg(long)]
        id: Uuid,
    },

    /// Compare local totals with the ledger (all on-chain donors by default)
    Validate {
        #[arg(long)]
        donor: Option<DonorKey>,
    },

    /// Check whether a contribution would be admitted
    Evaluate {
        #[arg(long)]
        donor: DonorKey,
        /// Amount, e.g. "250.00"
        #[arg(long)]
        amount: Cents,
        /// traditional or on_chain
        #[arg(long, default_value = "traditional")]
        rail: PaymentRail,
        /// Evaluate as a recurring plan with this frequency
        #[arg(long)]
        frequency: Option<Frequency>,
        #[arg(long, requires = "frequency")]
        start: Option<NaiveDate>,
        #[arg(long, requires = "frequency")]
        end: Option<NaiveDate>,
    },

    /// Show a donor's limit state
    Status {
        #[arg(long)]
        donor: DonorKey,
    },

    /// Issue recurring and scheduled payments due on a date (today by default)
    ProcessDue {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Stop a recurring plan
    CancelPlan {
        #[arg(long)]
        id: Uuid,
    },

    /// Re-project a recurring plan, optionally at a new amount
    RecomputePlan {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        amount: Option<Cents>,
    },
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn recurring_request(
    donor: DonorKey,
    amount: Cents,
    rail: PaymentRail,
    frequency: Option<Frequency>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> AdmissionRequest {
    match frequency {
        Some(frequency) => AdmissionRequest {
            donor,
            amount,
            rail,
            donation_type: DonationType::Recurring,
            recurring: Some(RecurringDetails {
                frequency,
                start_date: start.unwrap_or_else(|| Utc::now().date_naive()),
                end_date: end,
            }),
        },
        None => AdmissionRequest::one_time(donor, amount, rail),
    }
}

/// Execute a one-shot command.
pub async fn execute(config: &Config, command: Command) -> anyhow::Result<()> {
    let engine = Engine::open(config).await?;

    match command {
        Command::Run => anyhow::bail!("run is handled by the daemon"),

        Command::Sync { from, to } => print(&engine.reconciler.sync_range(from, to).await?),

        Command::Backfill => print(&engine.reconciler.backfill().await?),

        Command::Reorg { block } => print(&engine.reconciler.on_reorg(block).await?),

        Command::Reverify => {
            let suspects = engine.reconciler.reverify_suspects().await?;
            let grace = Duration::from_secs(config.reconciler.pending_grace_secs);
            let pending = engine.reconciler.resolve_pending(grace).await?;
            print(&serde_json::json!({ "suspects": suspects, "pending": pending }))
        }

        Command::Invalidate { id } => print(&engine.reconciler.invalidate_suspect(id)?),

        Command::Validate { donor: Some(donor) } => {
            let wallet = donor.wallet().ok_or_else(|| {
                EngineError::Validation(format!("{} has no on-chain records to validate", donor))
            })?;
            print(&engine.reconciler.validate_against_ledger(wallet).await?)
        }
        Command::Validate { donor: None } => print(&engine.reconciler.validate_all().await?),

        Command::Evaluate {
            donor,
            amount,
            rail,
            frequency,
            start,
            end,
        } => {
            let request = recurring_request(donor, amount, rail, frequency, start, end);
            print(&engine.calculator.evaluate(&request).await?)
        }

        Command::Status { donor } => print(&engine.calculator.limit_state(&donor)?),

        Command::ProcessDue { date } => {
            let today = date.unwrap_or_else(|| Utc::now().date_naive());
            print(&engine.scheduler.process_due(today).await?)
        }

        Command::CancelPlan { id } => print(&engine.scheduler.cancel_plan(id)?),

        Command::RecomputePlan { id, amount } => print(&engine.scheduler.recompute_plan(id, amount)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_evaluate() {
        let cli = Cli::try_parse_from([
            "compliance-node",
            "evaluate",
            "--donor",
            "pat@example.org",
            "--amount",
            "100.00",
            "--frequency",
            "monthly",
            "--start",
            "2024-01-01",
        ])
        .unwrap();

        let Some(Command::Evaluate { amount, frequency, rail, .. }) = cli.command else {
            panic!("expected evaluate");
        };
        assert_eq!(amount, Cents::from_dollars(100));
        assert_eq!(frequency, Some(Frequency::Monthly));
        assert_eq!(rail, PaymentRail::Traditional);
    }

    #[test]
    fn test_start_requires_frequency() {
        let result = Cli::try_parse_from([
            "compliance-node",
            "evaluate",
            "--donor",
            "pat@example.org",
            "--amount",
            "5",
            "--start",
            "2024-01-01",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["compliance-node", "--data-dir", "/tmp/x"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
    }
}
