//! Durable contribution store
//!
//! The store is the single serialization point between the write path and the
//! reconciler: duplicate detection and the capacity re-check both run inside
//! one write transaction.

mod schema;
pub mod sqlite;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::identity::{DonorKey, TransactionCode, TxHash};
use crate::models::{
    ContributionLimitState, ContributionRecord, ContributionStatus, DonorProfile, KycAttestation,
    NewContribution, PaymentRail, RecurringPlan,
};
use crate::money::{Cents, NativeRate, Wei};

pub use sqlite::SqliteStore;

/// Optimistic capacity re-check applied at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityGuard {
    /// Reject if completed + pending + this amount would exceed the ceiling
    Enforce(Cents),
    /// Record unconditionally (funds already moved on-chain)
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(ContributionRecord),
    /// An active record already holds this transaction hash or attempt code.
    /// `duplicate_row` is the audit row written for a distinct attempt.
    Duplicate {
        existing: ContributionRecord,
        duplicate_row: Option<Uuid>,
    },
    CapacityExceeded { remaining: Cents },
}

/// Per-donor sums by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DonorTotals {
    pub completed: Cents,
    pub completed_traditional: Cents,
    pub completed_native: Wei,
    pub pending: Cents,
    pub suspect: Cents,
    /// Every record regardless of status
    pub record_count: u64,
}

/// Fields written by a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
}

/// An on-chain send claimed for one donor attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAttempt {
    pub amount_native: Wei,
    pub native_rate: NativeRate,
    /// Unset until the node answers the send
    pub tx_hash: Option<TxHash>,
}

/// Storage seam shared by every component.
pub trait ContributionStore: Send + Sync {
    /// Idempotent insert keyed by chain hash or `(donor, transaction_code)`.
    fn insert_contribution(
        &self,
        new: NewContribution,
        guard: CapacityGuard,
    ) -> Result<InsertOutcome, EngineError>;

    fn get_contribution(&self, id: Uuid) -> Result<Option<ContributionRecord>, EngineError>;

    /// The record holding `tx_hash` in a pending, completed or suspect state.
    fn find_active_by_tx_hash(&self, tx_hash: &TxHash) -> Result<Option<ContributionRecord>, EngineError>;

    /// All records for a hash, duplicates and failures included.
    fn find_all_by_tx_hash(&self, tx_hash: &TxHash) -> Result<Vec<ContributionRecord>, EngineError>;

    fn find_by_transaction_code(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
    ) -> Result<Option<ContributionRecord>, EngineError>;

    fn contributions_for_donor(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
    ) -> Result<Vec<ContributionRecord>, EngineError>;

    fn contributions_by_status(
        &self,
        status: ContributionStatus,
        rail: Option<PaymentRail>,
    ) -> Result<Vec<ContributionRecord>, EngineError>;

    /// Compare-and-set transition; `ConcurrentModification` when the record
    /// is no longer in `expected`.
    fn transition(
        &self,
        id: Uuid,
        expected: ContributionStatus,
        next: ContributionStatus,
        update: StatusUpdate,
    ) -> Result<ContributionRecord, EngineError>;

    /// Move completed on-chain records at or above `from_block` to
    /// `reorg_suspect`, returning the affected records.
    fn mark_reorg_suspects(&self, from_block: u64) -> Result<Vec<ContributionRecord>, EngineError>;

    /// Pending scheduled records dated on or before `today`.
    fn due_scheduled(&self, today: NaiveDate) -> Result<Vec<ContributionRecord>, EngineError>;

    fn donor_totals(&self, donor: &DonorKey, campaign_id: &str) -> Result<DonorTotals, EngineError>;

    /// Recompute the limit state from records, cache it and return it.
    fn limit_state(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
        ceiling: Cents,
    ) -> Result<ContributionLimitState, EngineError>;

    /// Record the result of a ledger comparison on the cached limit state.
    fn record_validation(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
        discrepancy_native: i128,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Donors with at least one on-chain record.
    fn on_chain_donors(&self, campaign_id: &str) -> Result<Vec<DonorKey>, EngineError>;

    fn insert_plan(&self, plan: &RecurringPlan) -> Result<(), EngineError>;
    fn get_plan(&self, id: Uuid) -> Result<Option<RecurringPlan>, EngineError>;
    fn update_plan(&self, plan: &RecurringPlan) -> Result<(), EngineError>;
    fn active_plans(&self) -> Result<Vec<RecurringPlan>, EngineError>;

    /// Returns false when the donor already existed.
    fn register_donor(&self, profile: &DonorProfile) -> Result<bool, EngineError>;
    fn get_donor(&self, donor: &DonorKey) -> Result<Option<DonorProfile>, EngineError>;
    fn delete_donor(&self, donor: &DonorKey) -> Result<bool, EngineError>;

    fn insert_kyc(&self, attestation: &KycAttestation) -> Result<(), EngineError>;
    fn delete_kyc(&self, id: Uuid) -> Result<bool, EngineError>;
    fn latest_kyc(&self, donor: &DonorKey) -> Result<Option<KycAttestation>, EngineError>;

    /// Claim the single on-chain send for `(donor, code)`. Returns false when
    /// the attempt was already claimed.
    fn claim_send(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
        amount_native: Wei,
        rate: NativeRate,
    ) -> Result<bool, EngineError>;
    fn record_send_hash(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
        tx_hash: &TxHash,
    ) -> Result<(), EngineError>;
    fn send_attempt(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
    ) -> Result<Option<SendAttempt>, EngineError>;
    /// Drop a claim whose send the node refused outright.
    fn release_send(&self, donor: &DonorKey, code: &TransactionCode) -> Result<(), EngineError>;

    fn sync_cursor(&self, name: &str) -> Result<Option<u64>, EngineError>;
    fn set_sync_cursor(&self, name: &str, block: u64) -> Result<(), EngineError>;
    /// Forget a cursor so the next scan starts from the configured block.
    fn clear_sync_cursor(&self, name: &str) -> Result<(), EngineError>;
}
