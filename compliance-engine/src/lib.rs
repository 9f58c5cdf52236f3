//! Compliance Engine - Contribution Limits and Ledger Reconciliation
//!
//! Keeps a donor's cumulative contributions across the traditional and
//! on-chain rails under a configured ceiling:
//! - Admission checks with recurring-plan projection (`compliance`)
//! - Idempotent recording of contributions (`coordinator`, `store`)
//! - Reconciliation of the local record with the chain, including reorgs
//!   (`reconciler`)
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐    ┌───────────────────────────────┐
//! │ ContributionWriteCoordinator  │    │ ContributionLedgerReconciler  │
//! │  (donor-initiated writes)     │    │  (backfill, watcher, reorgs)  │
//! └──────┬──────────────┬─────────┘    └─────────┬──────────────┬──────┘
//!        ▼              │                        │              │
//! ┌──────────────┐      │                        │              │
//! │ Compliance   │      ▼                        ▼              │
//! │ Calculator   │   ┌─────────────────────────────────┐        │
//! └──────┬───────┘   │  ContributionStore (SQLite)     │        │
//!        │           └─────────────────────────────────┘        │
//!        ▼                                                      ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          LedgerClient (JSON-RPC / mock) + PriceOracle           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod compliance;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod models;
pub mod money;
pub mod oracle;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod store;

// Re-export main types for convenience
pub use compliance::{AdmissionRequest, AdmissionResult, ComplianceCalculator, RecurringDetails, RefusalReason};
pub use config::{ComplianceConfig, LedgerConfig, ReconcilerConfig, SchedulerConfig};
pub use coordinator::{
    CompoundRequest, CompoundResult, ContributionRequest, ContributionWriteCoordinator, FinalState,
    SubmissionResult,
};
pub use error::{DonorNotice, EngineError, ErrorKind, Retryable};
pub use identity::{DonorKey, TransactionCode, TxHash, WalletAddress};
pub use ledger::{LedgerClient, LedgerError, MockLedger, RpcLedgerClient};
pub use models::*;
pub use money::{Cents, NativeRate, Wei};
pub use oracle::PriceOracle;
pub use reconciler::{ChainWatcher, ContributionLedgerReconciler, WatchEvent};
pub use retry::RetryPolicy;
pub use scheduler::PaymentScheduler;
pub use store::{ContributionStore, SqliteStore};
