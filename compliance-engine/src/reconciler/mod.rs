//! Ledger reconciliation
//!
//! Maps on-chain contribution events onto contribution records. Backfill
//! (`sync_range`) and live delivery (`ChainWatcher`) share one per-event path,
//! `ingest_event`, so the two cannot diverge.

pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ComplianceConfig, ReconcilerConfig};
use crate::error::EngineError;
use crate::identity::{DonorKey, WalletAddress};
use crate::ledger::{ContributionEvent, LedgerClient, TransactionReceipt};
use crate::models::{ContributionRecord, ContributionStatus, DonationType, NewContribution, PaymentRail};
use crate::money::{Cents, NativeRate, Wei};
use crate::oracle::PriceOracle;
use crate::retry::RetryPolicy;
use crate::store::{CapacityGuard, ContributionStore, InsertOutcome, StatusUpdate};

pub use watcher::{ChainWatcher, WatchEvent};

/// Cursor name for the contribution event backfill.
pub const EVENT_CURSOR: &str = "contribution_events";

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// New completed record
    Stored(Uuid),
    /// A pending record from the write path was confirmed
    Promoted(Uuid),
    /// A reorg suspect was seen again on the canonical chain
    Reconfirmed(Uuid),
    /// Already recorded as completed
    Duplicate(Uuid),
}

impl IngestOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::Duplicate(_))
    }

    pub fn record_id(&self) -> Uuid {
        match self {
            IngestOutcome::Stored(id)
            | IngestOutcome::Promoted(id)
            | IngestOutcome::Reconfirmed(id)
            | IngestOutcome::Duplicate(id) => *id,
        }
    }
}

/// One ingested event and whether its amounts agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ingested {
    pub outcome: IngestOutcome,
    /// The record's fiat amount matches the event's native amount at the
    /// current rate, within tolerance
    pub consistent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub from_block: u64,
    pub to_block: u64,
    pub events_processed: u64,
    /// New records plus pending or suspect records moved to completed
    pub events_stored: u64,
    pub duplicates: u64,
    /// Events whose amounts disagree at the current rate
    pub inconsistent: u64,
}

impl SyncReport {
    /// True when every processed event was already recorded.
    pub fn duplicate(&self) -> bool {
        self.events_processed > 0 && self.duplicates == self.events_processed
    }

    fn absorb(&mut self, other: SyncReport) {
        self.events_processed += other.events_processed;
        self.events_stored += other.events_stored;
        self.duplicates += other.duplicates;
        self.inconsistent += other.inconsistent;
        self.to_block = other.to_block;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReorgReport {
    pub block: u64,
    pub suspects: Vec<Uuid>,
    pub donors: Vec<DonorKey>,
}

/// Result of checking records against receipts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReverifyReport {
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    /// No receipt yet, or the ledger could not be asked
    pub unresolved: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub donor: DonorKey,
    pub ledger_total: Wei,
    pub local_total: Wei,
    /// `ledger_total - local_total`
    pub discrepancy: i128,
    pub sync_required: bool,
}

pub struct ContributionLedgerReconciler {
    store: Arc<dyn ContributionStore>,
    ledger: Arc<dyn LedgerClient>,
    oracle: Arc<PriceOracle>,
    compliance: ComplianceConfig,
    config: ReconcilerConfig,
    retry: RetryPolicy,
}

impl ContributionLedgerReconciler {
    pub fn new(
        store: Arc<dyn ContributionStore>,
        ledger: Arc<dyn LedgerClient>,
        oracle: Arc<PriceOracle>,
        compliance: ComplianceConfig,
        config: ReconcilerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            oracle,
            compliance,
            config,
            retry,
        }
    }

    /// Persist one event at most once and check its amounts against the
    /// current rate. Backfill and live delivery both come through here.
    pub async fn ingest_event(&self, event: &ContributionEvent) -> Result<Ingested, EngineError> {
        let quote = self.oracle.quote().await;
        let outcome = match self.store.find_active_by_tx_hash(&event.tx_hash)? {
            Some(existing) => self.confirm_existing(existing, event)?,
            None => self.store_new(event, quote.rate)?,
        };
        let consistent = match self.store.get_contribution(outcome.record_id())? {
            Some(record) => amounts_agree(&record, event, quote.rate),
            None => true,
        };
        Ok(Ingested { outcome, consistent })
    }

    fn confirm_existing(
        &self,
        existing: ContributionRecord,
        event: &ContributionEvent,
    ) -> Result<IngestOutcome, EngineError> {
        if existing.amount_native != Some(event.amount) {
            warn!(
                tx_hash = %event.tx_hash,
                recorded = ?existing.amount_native,
                event = %event.amount,
                "Recorded native amount differs from chain event"
            );
        }

        let update = StatusUpdate {
            block_number: Some(event.block_number),
            gas_used: None,
        };
        let outcome = match existing.status {
            ContributionStatus::Pending => self
                .store
                .transition(existing.id, ContributionStatus::Pending, ContributionStatus::Completed, update)
                .map(|r| IngestOutcome::Promoted(r.id)),
            ContributionStatus::ReorgSuspect => self
                .store
                .transition(
                    existing.id,
                    ContributionStatus::ReorgSuspect,
                    ContributionStatus::Completed,
                    update,
                )
                .map(|r| IngestOutcome::Reconfirmed(r.id)),
            _ => Ok(IngestOutcome::Duplicate(existing.id)),
        };

        match outcome {
            Ok(outcome) => {
                if !outcome.is_duplicate() {
                    debug!(tx_hash = %event.tx_hash, block = event.block_number, ?outcome, "Contribution confirmed from chain");
                    self.refresh_limit_state(&existing.donor_key);
                }
                Ok(outcome)
            }
            // Another path moved it first
            Err(EngineError::ConcurrentModification(_)) => Ok(IngestOutcome::Duplicate(existing.id)),
            Err(e) => Err(e),
        }
    }

    fn store_new(&self, event: &ContributionEvent, rate: NativeRate) -> Result<IngestOutcome, EngineError> {
        let amount_fiat = rate.to_fiat(event.amount).ok_or_else(|| {
            EngineError::Validation(format!("event amount {} out of range", event.amount))
        })?;
        let donor = DonorKey::Wallet(event.contributor.clone());

        let new = NewContribution {
            donor_key: donor.clone(),
            campaign_id: self.compliance.campaign_id.clone(),
            // Dust below one cent still occupies a record
            amount_fiat: amount_fiat.max(Cents::new(1)),
            amount_native: Some(event.amount),
            native_rate: Some(rate),
            payment_rail: PaymentRail::OnChain,
            chain_tx_hash: Some(event.tx_hash.clone()),
            transaction_code: None,
            donation_type: DonationType::OneTime,
            status: ContributionStatus::Completed,
            block_number: Some(event.block_number),
            gas_used: None,
            plan_id: None,
            scheduled_for: None,
        };

        match self.store.insert_contribution(new, CapacityGuard::Skip)? {
            InsertOutcome::Inserted(record) => {
                info!(
                    tx_hash = %event.tx_hash,
                    donor = %donor,
                    block = event.block_number,
                    amount = %record.amount_fiat,
                    "Recorded contribution from chain"
                );
                self.refresh_limit_state(&donor);
                Ok(IngestOutcome::Stored(record.id))
            }
            InsertOutcome::Duplicate { existing, .. } => Ok(IngestOutcome::Duplicate(existing.id)),
            InsertOutcome::CapacityExceeded { .. } => Err(EngineError::Storage(
                "capacity check applied to a chain event".into(),
            )),
        }
    }

    /// Ingest every contribution event in `[from_block, to_block]`.
    pub async fn sync_range(&self, from_block: u64, to_block: u64) -> Result<SyncReport, EngineError> {
        if from_block > to_block {
            return Err(EngineError::Validation(format!(
                "invalid block range {}..{}",
                from_block, to_block
            )));
        }

        let batch = self.config.batch_size.max(1);
        let mut report = SyncReport {
            from_block,
            to_block: from_block,
            ..Default::default()
        };
        let mut start = from_block;
        while start <= to_block {
            let end = start.saturating_add(batch - 1).min(to_block);
            report.absorb(self.sync_batch(start, end).await?);

            let cursor = self.store.sync_cursor(EVENT_CURSOR)?;
            if cursor.map_or(true, |c| c < end) {
                self.store.set_sync_cursor(EVENT_CURSOR, end)?;
            }
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }

        info!(
            from = from_block,
            to = to_block,
            processed = report.events_processed,
            stored = report.events_stored,
            duplicates = report.duplicates,
            "Block range synced"
        );
        Ok(report)
    }

    async fn sync_batch(&self, from: u64, to: u64) -> Result<SyncReport, EngineError> {
        let events = self
            .retry
            .run("query_events", || self.ledger.query_events(from, to))
            .await?;

        let mut report = SyncReport {
            from_block: from,
            to_block: to,
            ..Default::default()
        };
        for event in &events {
            let ingested = self.ingest_event(event).await?;
            report.events_processed += 1;
            if ingested.outcome.is_duplicate() {
                report.duplicates += 1;
            } else {
                report.events_stored += 1;
            }
            if !ingested.consistent {
                report.inconsistent += 1;
            }
        }
        Ok(report)
    }

    /// Sync from the persisted cursor to the confirmed head.
    pub async fn backfill(&self) -> Result<SyncReport, EngineError> {
        let head = self
            .retry
            .run("block_number", || self.ledger.block_number())
            .await?;
        let safe = head.saturating_sub(self.config.confirmation_depth);
        let from = match self.store.sync_cursor(EVENT_CURSOR)? {
            Some(cursor) => cursor + 1,
            None => self.config.start_block,
        };
        if from > safe {
            debug!(from, safe, "Backfill up to date");
            return Ok(SyncReport {
                from_block: from,
                to_block: safe,
                ..Default::default()
            });
        }
        self.sync_range(from, safe).await
    }

    /// Block `block` changed: suspend every completed record at or above it.
    pub async fn on_reorg(&self, block: u64) -> Result<ReorgReport, EngineError> {
        let suspects = self.store.mark_reorg_suspects(block)?;

        let mut donors: Vec<DonorKey> = Vec::new();
        for record in &suspects {
            if !donors.contains(&record.donor_key) {
                donors.push(record.donor_key.clone());
            }
        }
        for donor in &donors {
            self.refresh_limit_state(donor);
        }

        // Rewind so backfill re-reads the replaced blocks. The cursor names the
        // last scanned block, so a reorg at or below the first block clears it.
        if let Some(cursor) = self.store.sync_cursor(EVENT_CURSOR)? {
            if cursor >= block {
                if block <= self.config.start_block {
                    self.store.clear_sync_cursor(EVENT_CURSOR)?;
                } else {
                    self.store.set_sync_cursor(EVENT_CURSOR, block - 1)?;
                }
            }
        }

        warn!(block, suspects = suspects.len(), donors = donors.len(), "Records suspended after reorg");
        Ok(ReorgReport {
            block,
            suspects: suspects.into_iter().map(|r| r.id).collect(),
            donors,
        })
    }

    /// Re-check reorg suspects against receipts on the current chain.
    pub async fn reverify_suspects(&self) -> Result<ReverifyReport, EngineError> {
        let suspects = self
            .store
            .contributions_by_status(ContributionStatus::ReorgSuspect, Some(PaymentRail::OnChain))?;
        self.resolve_from_receipts(suspects, ContributionStatus::ReorgSuspect).await
    }

    /// Resolve on-chain records left pending longer than `grace`.
    pub async fn resolve_pending(&self, grace: Duration) -> Result<ReverifyReport, EngineError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        let stale: Vec<ContributionRecord> = self
            .store
            .contributions_by_status(ContributionStatus::Pending, Some(PaymentRail::OnChain))?
            .into_iter()
            .filter(|r| r.created_at <= cutoff)
            .collect();
        self.resolve_from_receipts(stale, ContributionStatus::Pending).await
    }

    async fn resolve_from_receipts(
        &self,
        records: Vec<ContributionRecord>,
        expected: ContributionStatus,
    ) -> Result<ReverifyReport, EngineError> {
        let mut report = ReverifyReport::default();
        let mut touched = Vec::new();

        for record in records {
            let Some(tx_hash) = record.chain_tx_hash.clone() else {
                continue;
            };
            let receipt: Option<TransactionReceipt> = match self
                .retry
                .run("transaction_receipt", || self.ledger.transaction_receipt(&tx_hash))
                .await
            {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(id = %record.id, tx_hash = %tx_hash, error = %e, "Receipt lookup failed");
                    report.unresolved.push(record.id);
                    continue;
                }
            };

            let (next, update) = match receipt {
                Some(r) if r.success => (
                    ContributionStatus::Completed,
                    StatusUpdate {
                        block_number: Some(r.block_number),
                        gas_used: Some(r.gas_used),
                    },
                ),
                Some(_) => (ContributionStatus::Failed, StatusUpdate::default()),
                None => {
                    report.unresolved.push(record.id);
                    continue;
                }
            };

            match self.store.transition(record.id, expected, next, update) {
                Ok(updated) => {
                    info!(id = %updated.id, tx_hash = %tx_hash, from = %expected, to = %next, "Record resolved from receipt");
                    if next == ContributionStatus::Completed {
                        report.completed.push(updated.id);
                    } else {
                        report.failed.push(updated.id);
                    }
                    if !touched.contains(&record.donor_key) {
                        touched.push(record.donor_key.clone());
                    }
                }
                Err(EngineError::ConcurrentModification(_)) => {
                    debug!(id = %record.id, "Record changed during re-verification");
                }
                Err(e) => return Err(e),
            }
        }

        for donor in &touched {
            self.refresh_limit_state(donor);
        }
        Ok(report)
    }

    /// Explicitly give up on a reorg suspect.
    pub fn invalidate_suspect(&self, id: Uuid) -> Result<ContributionRecord, EngineError> {
        let record = self.store.transition(
            id,
            ContributionStatus::ReorgSuspect,
            ContributionStatus::RolledBack,
            StatusUpdate::default(),
        )?;
        warn!(%id, donor = %record.donor_key, "Reorg suspect invalidated");
        self.refresh_limit_state(&record.donor_key);
        Ok(record)
    }

    /// Compare the ledger's cumulative total for `wallet` with the locally
    /// completed on-chain records, recording any discrepancy.
    pub async fn validate_against_ledger(
        &self,
        wallet: &WalletAddress,
    ) -> Result<ValidationReport, EngineError> {
        let donor = DonorKey::Wallet(wallet.clone());
        let info = self
            .retry
            .run("contributor_info", || self.ledger.contributor_info(wallet))
            .await?;
        let local = self
            .store
            .donor_totals(&donor, &self.compliance.campaign_id)?
            .completed_native;
        let discrepancy = info.cumulative_amount.signed_diff(local);

        self.store
            .limit_state(&donor, &self.compliance.campaign_id, self.compliance.ceiling)?;
        self.store
            .record_validation(&donor, &self.compliance.campaign_id, discrepancy, Utc::now())?;

        if discrepancy != 0 {
            warn!(
                donor = %donor,
                ledger = %info.cumulative_amount,
                local = %local,
                discrepancy,
                "Local records disagree with ledger"
            );
        } else {
            debug!(donor = %donor, "Local records match ledger");
        }

        Ok(ValidationReport {
            donor,
            ledger_total: info.cumulative_amount,
            local_total: local,
            discrepancy,
            sync_required: discrepancy != 0,
        })
    }

    /// Validate every donor with on-chain records. Per-donor failures are
    /// logged and skipped.
    pub async fn validate_all(&self) -> Result<Vec<ValidationReport>, EngineError> {
        let donors = self.store.on_chain_donors(&self.compliance.campaign_id)?;
        let mut reports = Vec::with_capacity(donors.len());
        for donor in donors {
            let Some(wallet) = donor.wallet() else {
                continue;
            };
            match self.validate_against_ledger(wallet).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(donor = %donor, error = %e, "Ledger validation failed"),
            }
        }
        let mismatched = reports.iter().filter(|r| r.sync_required).count();
        info!(donors = reports.len(), mismatched, "Ledger validation pass finished");
        Ok(reports)
    }

    /// Apply one watcher event.
    pub async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Contribution(event) => {
                if let Err(e) = self.ingest_event(&event).await {
                    error!(tx_hash = %event.tx_hash, error = %e, "Failed to ingest contribution event");
                }
            }
            WatchEvent::Reorg { block } => {
                if let Err(e) = self.on_reorg(block).await {
                    error!(block, error = %e, "Failed to apply reorg");
                }
            }
        }
    }

    /// Run the reconciliation loop until shutdown.
    ///
    /// Consumes watcher events and runs periodic validation and
    /// re-verification passes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut validation_timer =
            tokio::time::interval(Duration::from_secs(self.config.validation_interval_secs.max(1)));
        let mut reverify_timer =
            tokio::time::interval(Duration::from_secs(self.config.reverify_interval_secs.max(1)));
        let grace = Duration::from_secs(self.config.pending_grace_secs);
        info!("Reconciler started");

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle(event).await;
                }
                _ = reverify_timer.tick() => {
                    if let Err(e) = self.reverify_suspects().await {
                        warn!(error = %e, "Suspect re-verification failed");
                    }
                    if let Err(e) = self.resolve_pending(grace).await {
                        warn!(error = %e, "Pending resolution failed");
                    }
                }
                _ = validation_timer.tick() => {
                    if let Err(e) = self.validate_all().await {
                        warn!(error = %e, "Ledger validation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    }

    fn refresh_limit_state(&self, donor: &DonorKey) {
        if let Err(e) = self
            .store
            .limit_state(donor, &self.compliance.campaign_id, self.compliance.ceiling)
        {
            warn!(donor = %donor, error = %e, "Failed to refresh limit state");
        }
    }
}

/// Fiat and native amounts of a record agree at `rate`. A disagreement is
/// reported, never corrected.
fn amounts_agree(record: &ContributionRecord, event: &ContributionEvent, rate: NativeRate) -> bool {
    if rate.is_consistent(record.amount_fiat, event.amount) {
        return true;
    }
    warn!(
        id = %record.id,
        tx_hash = %event.tx_hash,
        fiat = %record.amount_fiat,
        native = %event.amount,
        rate = %rate,
        "Fiat and native amounts disagree"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockLedger;
    use crate::store::SqliteStore;

    fn wallet() -> WalletAddress {
        WalletAddress::parse("0x6666666666666666666666666666666666666666").unwrap()
    }

    fn setup() -> (Arc<MockLedger>, Arc<SqliteStore>, ContributionLedgerReconciler) {
        let ledger = Arc::new(MockLedger::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let oracle = Arc::new(
            PriceOracle::new(ledger.clone(), Cents::from_dollars(3000), RetryPolicy::immediate(1))
                .unwrap(),
        );
        let reconciler = ContributionLedgerReconciler::new(
            store.clone(),
            ledger.clone(),
            oracle,
            ComplianceConfig::default(),
            ReconcilerConfig {
                batch_size: 3,
                confirmation_depth: 0,
                ..Default::default()
            },
            RetryPolicy::immediate(2),
        );
        (ledger, store, reconciler)
    }

    #[tokio::test]
    async fn test_sync_range_twice_stores_once() {
        let (ledger, _store, reconciler) = setup();
        ledger.record_external_contribution(&wallet(), Wei::new(100_000_000_000_000_000));

        let first = reconciler.sync_range(0, 10).await.unwrap();
        let second = reconciler.sync_range(0, 10).await.unwrap();
        assert_eq!(first.events_stored, 1);
        assert_eq!(second.events_stored, 0);
        assert!(second.duplicate());
        assert_eq!(first.inconsistent, 0);
    }

    #[tokio::test]
    async fn test_batches_advance_cursor() {
        let (ledger, store, reconciler) = setup();
        for _ in 0..5 {
            ledger.record_external_contribution(&wallet(), Wei::new(10_000_000_000_000_000));
        }
        let report = reconciler.backfill().await.unwrap();
        assert_eq!(report.events_processed, 5);
        assert_eq!(store.sync_cursor(EVENT_CURSOR).unwrap(), Some(5));

        let again = reconciler.backfill().await.unwrap();
        assert_eq!(again.events_processed, 0);
    }

    #[tokio::test]
    async fn test_invalid_range() {
        let (_ledger, _store, reconciler) = setup();
        assert!(matches!(
            reconciler.sync_range(10, 5).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_flags_mismatch() {
        let (ledger, store, reconciler) = setup();
        ledger.record_external_contribution(&wallet(), Wei::new(100_000_000_000_000_000));
        reconciler.sync_range(0, 10).await.unwrap();

        let clean = reconciler.validate_against_ledger(&wallet()).await.unwrap();
        assert!(!clean.sync_required);

        // Not yet synced
        ledger.record_external_contribution(&wallet(), Wei::new(5));
        let report = reconciler.validate_against_ledger(&wallet()).await.unwrap();
        assert_eq!(report.discrepancy, 5);

        let state = store
            .limit_state(&DonorKey::Wallet(wallet()), "general-2026", Cents::from_dollars(3300))
            .unwrap();
        assert!(state.sync_required);
        assert_eq!(state.discrepancy_native, Some(5));
    }
}
