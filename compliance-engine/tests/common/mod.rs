//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use compliance_engine::store::{CapacityGuard, DonorTotals, InsertOutcome, SendAttempt, StatusUpdate};
use compliance_engine::{
    ComplianceCalculator, ComplianceConfig, ContributionLedgerReconciler, ContributionLimitState,
    ContributionRecord, ContributionStatus, ContributionStore, ContributionWriteCoordinator, DonorKey,
    DonorProfile, EngineError, KycAttestation, LedgerConfig, MockLedger, NewContribution,
    PaymentRail, PaymentScheduler, PriceOracle, ReconcilerConfig, RecurringPlan, RetryPolicy,
    SqliteStore, TransactionCode, TxHash, WalletAddress,
};
use compliance_engine::money::{Cents, NativeRate, Wei};

pub const DONOR_WALLET: &str = "0x7777777777777777777777777777777777777777";

pub fn wallet() -> WalletAddress {
    WalletAddress::parse(DONOR_WALLET).unwrap()
}

pub fn email(s: &str) -> DonorKey {
    DonorKey::parse(s).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Every component wired against a mock ledger and an on-disk store.
pub struct Harness {
    pub dir: TempDir,
    pub ledger: Arc<MockLedger>,
    pub store: Arc<dyn ContributionStore>,
    pub calculator: Arc<ComplianceCalculator>,
    pub coordinator: Arc<ContributionWriteCoordinator>,
    pub reconciler: Arc<ContributionLedgerReconciler>,
    pub scheduler: Arc<PaymentScheduler>,
}

impl Harness {
    pub fn new(ledger: MockLedger) -> Self {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ContributionStore> = Arc::new(SqliteStore::open(dir.path()).unwrap());
        Self::with_store(ledger, store, dir)
    }

    pub fn with_store(ledger: MockLedger, store: Arc<dyn ContributionStore>, dir: TempDir) -> Self {
        let ledger = Arc::new(ledger);
        let retry = RetryPolicy::immediate(3);
        let ledger_config = LedgerConfig {
            receipt_poll_ms: 1,
            confirmation_timeout_secs: 1,
            ..Default::default()
        };
        let compliance = ComplianceConfig::default();

        let oracle = Arc::new(
            PriceOracle::new(ledger.clone(), ledger_config.fallback_price, retry.clone()).unwrap(),
        );
        let calculator = Arc::new(ComplianceCalculator::new(
            store.clone(),
            ledger.clone(),
            oracle.clone(),
            compliance.clone(),
            retry.clone(),
        ));
        let coordinator = Arc::new(ContributionWriteCoordinator::new(
            store.clone(),
            ledger.clone(),
            oracle.clone(),
            calculator.clone(),
            &ledger_config,
            retry.clone(),
        ));
        let reconciler = Arc::new(ContributionLedgerReconciler::new(
            store.clone(),
            ledger.clone(),
            oracle,
            compliance,
            ReconcilerConfig {
                confirmation_depth: 0,
                ..Default::default()
            },
            retry,
        ));
        let scheduler = Arc::new(PaymentScheduler::new(
            store.clone(),
            coordinator.clone(),
            calculator.clone(),
        ));

        Self {
            dir,
            ledger,
            store,
            calculator,
            coordinator,
            reconciler,
            scheduler,
        }
    }

    pub fn register(&self, donor: &DonorKey) {
        self.store
            .register_donor(&DonorProfile {
                donor_key: donor.clone(),
                display_name: None,
                registered_at: Utc::now(),
            })
            .unwrap();
    }

    pub fn campaign(&self) -> String {
        ComplianceConfig::default().campaign_id
    }

    pub fn limit_state(&self, donor: &DonorKey) -> ContributionLimitState {
        self.calculator.limit_state(donor).unwrap()
    }

    /// Record a completed traditional contribution directly.
    pub fn seed_traditional(&self, donor: &DonorKey, amount: Cents) -> ContributionRecord {
        let outcome = self
            .store
            .insert_contribution(
                NewContribution {
                    donor_key: donor.clone(),
                    campaign_id: self.campaign(),
                    amount_fiat: amount,
                    amount_native: None,
                    native_rate: None,
                    payment_rail: PaymentRail::Traditional,
                    chain_tx_hash: None,
                    transaction_code: Some(TransactionCode::generate()),
                    donation_type: compliance_engine::DonationType::OneTime,
                    status: ContributionStatus::Completed,
                    block_number: None,
                    gas_used: None,
                    plan_id: None,
                    scheduled_for: None,
                },
                CapacityGuard::Skip,
            )
            .unwrap();
        match outcome {
            InsertOutcome::Inserted(record) => record,
            other => panic!("seed failed: {:?}", other),
        }
    }
}

/// Store wrapper whose inserts fail on demand.
pub struct FlakyStore {
    inner: SqliteStore,
    /// Inserts left to fail before delegating
    failures: AtomicU32,
    permanent: bool,
    pub insert_calls: AtomicU32,
}

impl FlakyStore {
    /// Fail the next `n` inserts with a busy database.
    pub fn failing(inner: SqliteStore, n: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(n),
            permanent: false,
            insert_calls: AtomicU32::new(0),
        }
    }

    /// Fail every insert.
    pub fn broken(inner: SqliteStore) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
            permanent: true,
            insert_calls: AtomicU32::new(0),
        }
    }

    pub fn inserts(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

impl ContributionStore for FlakyStore {
    fn insert_contribution(
        &self,
        new: NewContribution,
        guard: CapacityGuard,
    ) -> Result<InsertOutcome, EngineError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            return Err(EngineError::Deadlock("database is locked".into()));
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Deadlock("database is locked".into()));
        }
        self.inner.insert_contribution(new, guard)
    }

    fn get_contribution(&self, id: Uuid) -> Result<Option<ContributionRecord>, EngineError> {
        self.inner.get_contribution(id)
    }

    fn find_active_by_tx_hash(&self, tx_hash: &TxHash) -> Result<Option<ContributionRecord>, EngineError> {
        self.inner.find_active_by_tx_hash(tx_hash)
    }

    fn find_all_by_tx_hash(&self, tx_hash: &TxHash) -> Result<Vec<ContributionRecord>, EngineError> {
        self.inner.find_all_by_tx_hash(tx_hash)
    }

    fn find_by_transaction_code(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
    ) -> Result<Option<ContributionRecord>, EngineError> {
        self.inner.find_by_transaction_code(donor, code)
    }

    fn contributions_for_donor(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
    ) -> Result<Vec<ContributionRecord>, EngineError> {
        self.inner.contributions_for_donor(donor, campaign_id)
    }

    fn contributions_by_status(
        &self,
        status: ContributionStatus,
        rail: Option<PaymentRail>,
    ) -> Result<Vec<ContributionRecord>, EngineError> {
        self.inner.contributions_by_status(status, rail)
    }

    fn transition(
        &self,
        id: Uuid,
        expected: ContributionStatus,
        next: ContributionStatus,
        update: StatusUpdate,
    ) -> Result<ContributionRecord, EngineError> {
        self.inner.transition(id, expected, next, update)
    }

    fn mark_reorg_suspects(&self, from_block: u64) -> Result<Vec<ContributionRecord>, EngineError> {
        self.inner.mark_reorg_suspects(from_block)
    }

    fn due_scheduled(&self, today: NaiveDate) -> Result<Vec<ContributionRecord>, EngineError> {
        self.inner.due_scheduled(today)
    }

    fn donor_totals(&self, donor: &DonorKey, campaign_id: &str) -> Result<DonorTotals, EngineError> {
        self.inner.donor_totals(donor, campaign_id)
    }

    fn limit_state(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
        ceiling: Cents,
    ) -> Result<ContributionLimitState, EngineError> {
        self.inner.limit_state(donor, campaign_id, ceiling)
    }

    fn record_validation(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
        discrepancy_native: i128,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.inner.record_validation(donor, campaign_id, discrepancy_native, at)
    }

    fn on_chain_donors(&self, campaign_id: &str) -> Result<Vec<DonorKey>, EngineError> {
        self.inner.on_chain_donors(campaign_id)
    }

    fn insert_plan(&self, plan: &RecurringPlan) -> Result<(), EngineError> {
        self.inner.insert_plan(plan)
    }

    fn get_plan(&self, id: Uuid) -> Result<Option<RecurringPlan>, EngineError> {
        self.inner.get_plan(id)
    }

    fn update_plan(&self, plan: &RecurringPlan) -> Result<(), EngineError> {
        self.inner.update_plan(plan)
    }

    fn active_plans(&self) -> Result<Vec<RecurringPlan>, EngineError> {
        self.inner.active_plans()
    }

    fn register_donor(&self, profile: &DonorProfile) -> Result<bool, EngineError> {
        self.inner.register_donor(profile)
    }

    fn get_donor(&self, donor: &DonorKey) -> Result<Option<DonorProfile>, EngineError> {
        self.inner.get_donor(donor)
    }

    fn delete_donor(&self, donor: &DonorKey) -> Result<bool, EngineError> {
        self.inner.delete_donor(donor)
    }

    fn insert_kyc(&self, attestation: &KycAttestation) -> Result<(), EngineError> {
        self.inner.insert_kyc(attestation)
    }

    fn delete_kyc(&self, id: Uuid) -> Result<bool, EngineError> {
        self.inner.delete_kyc(id)
    }

    fn latest_kyc(&self, donor: &DonorKey) -> Result<Option<KycAttestation>, EngineError> {
        self.inner.latest_kyc(donor)
    }

    fn claim_send(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
        amount_native: Wei,
        rate: NativeRate,
    ) -> Result<bool, EngineError> {
        self.inner.claim_send(donor, code, amount_native, rate)
    }

    fn record_send_hash(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
        tx_hash: &TxHash,
    ) -> Result<(), EngineError> {
        self.inner.record_send_hash(donor, code, tx_hash)
    }

    fn send_attempt(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
    ) -> Result<Option<SendAttempt>, EngineError> {
        self.inner.send_attempt(donor, code)
    }

    fn release_send(&self, donor: &DonorKey, code: &TransactionCode) -> Result<(), EngineError> {
        self.inner.release_send(donor, code)
    }

    fn sync_cursor(&self, name: &str) -> Result<Option<u64>, EngineError> {
        self.inner.sync_cursor(name)
    }

    fn set_sync_cursor(&self, name: &str, block: u64) -> Result<(), EngineError> {
        self.inner.set_sync_cursor(name, block)
    }

    fn clear_sync_cursor(&self, name: &str) -> Result<(), EngineError> {
        self.inner.clear_sync_cursor(name)
    }
}
