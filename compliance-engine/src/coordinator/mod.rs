//! Contribution write path
//!
//! `submit` runs one donor-initiated contribution end to end: admission,
//! the on-chain transaction when the rail needs one, then the durable record.
//! An on-chain submission is sent at most once. When its outcome cannot be
//! established the result is `PendingUnknown` and the reconciler settles it
//! from the chain later.

pub mod saga;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::compliance::{AdmissionRequest, AdmissionResult, ComplianceCalculator, RecurringDetails, RefusalReason};
use crate::config::LedgerConfig;
use crate::error::{DonorNotice, EngineError, ErrorKind};
use crate::identity::{DonorKey, TransactionCode, TxHash, WalletAddress};
use crate::ledger::{self, ContributeOutcome, LedgerClient, LedgerError, LedgerRefusal, TransactionReceipt};
use crate::models::{
    ContributionRecord, ContributionStatus, DonationType, NewContribution, PaymentRail, PlanStatus,
    RecurringPlan,
};
use crate::money::{Cents, NativeRate, Wei};
use crate::oracle::PriceOracle;
use crate::retry::RetryPolicy;
use crate::store::{CapacityGuard, ContributionStore, InsertOutcome, SendAttempt, StatusUpdate};

pub use saga::{CompoundRequest, CompoundResult, KycEvidence, SagaStep};

/// A donor's contribution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionRequest {
    pub donor: DonorKey,
    pub amount: Cents,
    pub rail: PaymentRail,
    pub donation_type: DonationType,
    pub recurring: Option<RecurringDetails>,
    /// Settlement date for scheduled contributions
    pub scheduled_for: Option<NaiveDate>,
    /// Generated once per attempt; reused when the same attempt is retried
    pub transaction_code: TransactionCode,
}

impl ContributionRequest {
    pub fn one_time(donor: DonorKey, amount: Cents, rail: PaymentRail) -> Self {
        Self {
            donor,
            amount,
            rail,
            donation_type: DonationType::OneTime,
            recurring: None,
            scheduled_for: None,
            transaction_code: TransactionCode::generate(),
        }
    }

    pub fn recurring(donor: DonorKey, amount: Cents, details: RecurringDetails) -> Self {
        Self {
            donation_type: DonationType::Recurring,
            recurring: Some(details),
            ..Self::one_time(donor, amount, PaymentRail::Traditional)
        }
    }

    pub fn scheduled(donor: DonorKey, amount: Cents, date: NaiveDate) -> Self {
        Self {
            donation_type: DonationType::Scheduled,
            scheduled_for: Some(date),
            ..Self::one_time(donor, amount, PaymentRail::Traditional)
        }
    }

    fn admission(&self) -> AdmissionRequest {
        AdmissionRequest {
            donor: self.donor.clone(),
            amount: self.amount,
            rail: self.rail,
            donation_type: self.donation_type,
            recurring: self.recurring.clone(),
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        match (self.donation_type, self.scheduled_for) {
            (DonationType::Scheduled, None) => Err(EngineError::Validation(
                "scheduled contributions need a date".into(),
            )),
            (DonationType::OneTime | DonationType::Recurring, Some(_)) => Err(EngineError::Validation(
                "only scheduled contributions take a settlement date".into(),
            )),
            _ => self.admission().validate(),
        }
    }
}

/// How a submission ended, from the funds' point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Completed,
    /// Definitely did not happen
    Failed,
    /// Funds may have moved; the reconciler will decide
    Unknown,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionResult {
    Completed {
        record: ContributionRecord,
        receipt: Option<TransactionReceipt>,
        plan: Option<RecurringPlan>,
        /// This attempt had already been recorded
        duplicate: bool,
    },
    Refused { admission: AdmissionResult },
    Invalid { notice: DonorNotice },
    Failed {
        notice: DonorNotice,
        tx_hash: Option<TxHash>,
        record: Option<Uuid>,
    },
    PendingUnknown {
        tx_hash: Option<TxHash>,
        record: Option<Uuid>,
    },
    /// The transaction confirmed but no record could be written
    RecordKeepingFailed {
        tx_hash: TxHash,
        receipt: TransactionReceipt,
    },
}

impl SubmissionResult {
    pub fn final_state(&self) -> FinalState {
        match self {
            SubmissionResult::Completed { .. } => FinalState::Completed,
            SubmissionResult::Refused { .. }
            | SubmissionResult::Invalid { .. }
            | SubmissionResult::Failed { .. } => FinalState::Failed,
            SubmissionResult::PendingUnknown { .. } => FinalState::Unknown,
            // Funds moved; only the bookkeeping is missing
            SubmissionResult::RecordKeepingFailed { .. } => FinalState::Completed,
        }
    }

    /// What the donor sees when the submission did not complete.
    pub fn notice(&self) -> Option<DonorNotice> {
        match self {
            SubmissionResult::Completed { .. } => None,
            SubmissionResult::Refused { admission } => Some(DonorNotice {
                kind: ErrorKind::NotAdmissible,
                message: admission
                    .reason
                    .as_ref()
                    .map(RefusalReason::message)
                    .unwrap_or("This contribution cannot be accepted."),
            }),
            SubmissionResult::Invalid { notice } | SubmissionResult::Failed { notice, .. } => {
                Some(notice.clone())
            }
            SubmissionResult::PendingUnknown { .. } => {
                Some(DonorNotice::for_kind(ErrorKind::NetworkTimeout))
            }
            SubmissionResult::RecordKeepingFailed { .. } => Some(DonorNotice {
                kind: ErrorKind::Internal,
                message: "Your payment went through, but we could not finish recording it. No action is needed.",
            }),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SubmissionResult::Completed { .. })
    }
}

pub struct ContributionWriteCoordinator {
    store: Arc<dyn ContributionStore>,
    ledger: Arc<dyn LedgerClient>,
    oracle: Arc<PriceOracle>,
    calculator: Arc<ComplianceCalculator>,
    receipt_poll: Duration,
    confirmation_timeout: Duration,
    retry: RetryPolicy,
}

impl ContributionWriteCoordinator {
    pub fn new(
        store: Arc<dyn ContributionStore>,
        ledger: Arc<dyn LedgerClient>,
        oracle: Arc<PriceOracle>,
        calculator: Arc<ComplianceCalculator>,
        ledger_config: &LedgerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            oracle,
            calculator,
            receipt_poll: ledger_config.receipt_poll(),
            confirmation_timeout: ledger_config.confirmation_timeout(),
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn ContributionStore> {
        &self.store
    }

    /// Run one contribution attempt.
    pub async fn submit(&self, request: &ContributionRequest) -> SubmissionResult {
        if let Err(e) = request.validate() {
            return SubmissionResult::Invalid {
                notice: e.donor_notice(),
            };
        }

        // A retried attempt must not be re-admitted against its own amount
        if let Some(result) = self.replay(request).await {
            return result;
        }

        let admission = match self.calculator.evaluate(&request.admission()).await {
            Ok(admission) if admission.admissible => admission,
            Ok(admission) => {
                info!(
                    donor = %request.donor,
                    amount = %request.amount,
                    reason = ?admission.reason,
                    "Contribution refused"
                );
                return SubmissionResult::Refused { admission };
            }
            Err(e) => {
                warn!(donor = %request.donor, error = %e, "Admission check failed");
                return failed(&e, None, None);
            }
        };

        match (request.rail, request.donor.wallet()) {
            (PaymentRail::OnChain, Some(wallet)) => self.submit_on_chain(request, wallet, admission).await,
            _ => self.submit_traditional(request, admission).await,
        }
    }

    /// The earlier outcome of this attempt, if it got far enough to leave a
    /// record or an on-chain send.
    async fn replay(&self, request: &ContributionRequest) -> Option<SubmissionResult> {
        match self
            .store
            .find_by_transaction_code(&request.donor, &request.transaction_code)
        {
            Ok(Some(record)) => {
                info!(
                    id = %record.id,
                    code = %request.transaction_code,
                    status = %record.status,
                    "Attempt already recorded"
                );
                return Some(self.replay_record(record).await);
            }
            Ok(None) => {}
            Err(e) => {
                error!(donor = %request.donor, error = %e, "Failed to look up attempt");
                return Some(failed(&e, None, None));
            }
        }

        let wallet = match (request.rail, request.donor.wallet()) {
            (PaymentRail::OnChain, Some(wallet)) => wallet,
            _ => return None,
        };
        match self.store.send_attempt(&request.donor, &request.transaction_code) {
            Ok(Some(attempt)) => Some(self.resume_send(request, wallet, attempt).await),
            Ok(None) => None,
            Err(e) => {
                error!(donor = %request.donor, error = %e, "Failed to look up send attempt");
                Some(failed(&e, None, None))
            }
        }
    }

    async fn replay_record(&self, record: ContributionRecord) -> SubmissionResult {
        // An audit row points at the record that holds the transaction
        let record = match (record.status, &record.chain_tx_hash) {
            (ContributionStatus::Duplicate, Some(hash)) => match self.store.find_active_by_tx_hash(hash) {
                Ok(Some(active)) => active,
                Ok(None) => record,
                Err(e) => return failed(&e, Some(hash.clone()), Some(record.id)),
            },
            _ => record,
        };

        match (record.status, record.chain_tx_hash.clone()) {
            (ContributionStatus::Pending, Some(hash)) => self.recheck_pending(record, hash).await,
            (ContributionStatus::Completed | ContributionStatus::Pending, _) => SubmissionResult::Completed {
                plan: self.plan_for(&record),
                record,
                receipt: None,
                duplicate: true,
            },
            (ContributionStatus::ReorgSuspect, tx_hash) => SubmissionResult::PendingUnknown {
                tx_hash,
                record: Some(record.id),
            },
            (
                ContributionStatus::Failed | ContributionStatus::RolledBack | ContributionStatus::Duplicate,
                tx_hash,
            ) => SubmissionResult::Failed {
                notice: DonorNotice::for_kind(ErrorKind::NotAdmissible),
                tx_hash,
                record: Some(record.id),
            },
        }
    }

    fn plan_for(&self, record: &ContributionRecord) -> Option<RecurringPlan> {
        let id = record.plan_id?;
        match self.store.get_plan(id) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(plan = %id, error = %e, "Failed to load recurring plan");
                None
            }
        }
    }

    /// Poll again for a pending transaction of a retried attempt.
    async fn recheck_pending(&self, record: ContributionRecord, hash: TxHash) -> SubmissionResult {
        let outcome = ledger::await_outcome(
            self.ledger.as_ref(),
            hash.clone(),
            self.receipt_poll,
            self.confirmation_timeout,
        )
        .await;

        let (next, receipt) = match outcome {
            ContributeOutcome::Confirmed(receipt) => (ContributionStatus::Completed, receipt),
            ContributeOutcome::Reverted(receipt) => (ContributionStatus::Failed, receipt),
            ContributeOutcome::Unknown { tx_hash } => {
                return SubmissionResult::PendingUnknown {
                    tx_hash: Some(tx_hash),
                    record: Some(record.id),
                }
            }
        };
        let update = StatusUpdate {
            block_number: Some(receipt.block_number),
            gas_used: Some(receipt.gas_used),
        };

        let settled = match self
            .store
            .transition(record.id, ContributionStatus::Pending, next, update)
        {
            Ok(settled) => settled,
            // The reconciler settled it first
            Err(EngineError::ConcurrentModification(_)) => match self.store.get_contribution(record.id) {
                Ok(Some(current)) => current,
                Ok(None) => record,
                Err(e) => return failed(&e, Some(hash), Some(record.id)),
            },
            Err(e) if next == ContributionStatus::Completed => {
                error!(tx_hash = %hash, error = %e, "Contribution confirmed on chain but could not be recorded");
                return SubmissionResult::RecordKeepingFailed { tx_hash: hash, receipt };
            }
            Err(e) => return failed(&e, Some(hash), Some(record.id)),
        };

        match settled.status {
            ContributionStatus::Completed => {
                info!(id = %settled.id, tx_hash = %hash, block = receipt.block_number, "Pending contribution confirmed");
                SubmissionResult::Completed {
                    record: settled,
                    receipt: Some(receipt),
                    plan: None,
                    duplicate: true,
                }
            }
            ContributionStatus::Pending | ContributionStatus::ReorgSuspect => SubmissionResult::PendingUnknown {
                tx_hash: Some(hash),
                record: Some(settled.id),
            },
            _ => SubmissionResult::Failed {
                notice: DonorNotice::for_kind(ErrorKind::NotAdmissible),
                tx_hash: Some(hash),
                record: Some(settled.id),
            },
        }
    }

    /// Continue an attempt whose transaction was already sent.
    async fn resume_send(
        &self,
        request: &ContributionRequest,
        wallet: &WalletAddress,
        attempt: SendAttempt,
    ) -> SubmissionResult {
        let Some(tx_hash) = attempt.tx_hash else {
            warn!(
                donor = %wallet,
                code = %request.transaction_code,
                "Earlier send for this attempt has no known outcome, not resending"
            );
            return SubmissionResult::PendingUnknown {
                tx_hash: None,
                record: None,
            };
        };
        info!(donor = %wallet, tx_hash = %tx_hash, "Resuming earlier send");
        let outcome = ledger::await_outcome(
            self.ledger.as_ref(),
            tx_hash,
            self.receipt_poll,
            self.confirmation_timeout,
        )
        .await;
        self.settle(request, wallet, attempt.amount_native, attempt.native_rate, outcome)
            .await
    }

    async fn submit_traditional(
        &self,
        request: &ContributionRequest,
        admission: AdmissionResult,
    ) -> SubmissionResult {
        let config = self.calculator.config();
        let plan = match (&request.recurring, &admission.projection) {
            (Some(details), Some(projection)) => {
                let now = Utc::now();
                let plan = RecurringPlan {
                    id: Uuid::new_v4(),
                    donor_key: request.donor.clone(),
                    campaign_id: config.campaign_id.clone(),
                    amount_per_payment: request.amount,
                    frequency: details.frequency,
                    start_date: details.start_date,
                    end_date: details.end_date,
                    payment_count: projection.payment_count,
                    total_projected_amount: projection.total_projected_amount,
                    auto_cancel_date: projection.auto_cancel_date,
                    payments_issued: 1,
                    status: if projection.payment_count > 1 {
                        PlanStatus::Active
                    } else {
                        PlanStatus::Completed
                    },
                    created_at: now,
                    updated_at: now,
                };
                if let Err(e) = self.store.insert_plan(&plan) {
                    error!(donor = %request.donor, error = %e, "Failed to store recurring plan");
                    return failed(&e, None, None);
                }
                Some(plan)
            }
            _ => None,
        };

        let status = match request.donation_type {
            DonationType::Scheduled => ContributionStatus::Pending,
            _ => ContributionStatus::Completed,
        };
        let new = NewContribution {
            donor_key: request.donor.clone(),
            campaign_id: config.campaign_id.clone(),
            amount_fiat: request.amount,
            amount_native: None,
            native_rate: None,
            payment_rail: PaymentRail::Traditional,
            chain_tx_hash: None,
            transaction_code: Some(request.transaction_code.clone()),
            donation_type: request.donation_type,
            status,
            block_number: None,
            gas_used: None,
            plan_id: plan.as_ref().map(|p| p.id),
            scheduled_for: request.scheduled_for,
        };

        let outcome = self.persist(new, CapacityGuard::Enforce(config.ceiling)).await;
        match outcome {
            Ok(InsertOutcome::Inserted(record)) => {
                info!(
                    id = %record.id,
                    donor = %record.donor_key,
                    amount = %record.amount_fiat,
                    code = %request.transaction_code,
                    "Contribution recorded"
                );
                SubmissionResult::Completed {
                    record,
                    receipt: None,
                    plan,
                    duplicate: false,
                }
            }
            Ok(InsertOutcome::Duplicate { existing, .. }) => {
                self.cancel_unused_plan(plan);
                SubmissionResult::Completed {
                    record: existing,
                    receipt: None,
                    plan: None,
                    duplicate: true,
                }
            }
            Ok(InsertOutcome::CapacityExceeded { remaining }) => {
                self.cancel_unused_plan(plan);
                warn!(donor = %request.donor, %remaining, "Capacity changed before commit");
                let mut admission = admission;
                admission.admissible = false;
                admission.reason = Some(RefusalReason::ExceedsRemainingCapacity);
                admission.message = RefusalReason::ExceedsRemainingCapacity.message().to_string();
                admission.remaining_capacity = remaining;
                SubmissionResult::Refused { admission }
            }
            Err(e) => {
                self.cancel_unused_plan(plan);
                error!(donor = %request.donor, error = %e, "Failed to record contribution");
                failed(&e, None, None)
            }
        }
    }

    fn cancel_unused_plan(&self, plan: Option<RecurringPlan>) {
        let Some(mut plan) = plan else { return };
        plan.status = PlanStatus::Cancelled;
        plan.payments_issued = 0;
        if let Err(e) = self.store.update_plan(&plan) {
            error!(plan = %plan.id, error = %e, "Failed to cancel unused plan");
        }
    }

    async fn submit_on_chain(
        &self,
        request: &ContributionRequest,
        wallet: &WalletAddress,
        admission: AdmissionResult,
    ) -> SubmissionResult {
        let rate = match admission.quote {
            Some(quote) => quote.rate,
            None => self.oracle.quote().await.rate,
        };
        let Some(native) = rate.to_native(request.amount) else {
            return SubmissionResult::Invalid {
                notice: DonorNotice::for_kind(ErrorKind::ValidationError),
            };
        };

        match self
            .store
            .claim_send(&request.donor, &request.transaction_code, native, rate)
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(donor = %wallet, code = %request.transaction_code, "Attempt already being sent");
                return SubmissionResult::PendingUnknown {
                    tx_hash: None,
                    record: None,
                };
            }
            Err(e) => {
                error!(donor = %wallet, error = %e, "Failed to claim send");
                return failed(&e, None, None);
            }
        }

        let tx_hash = match self.ledger.send_contribution(wallet, native).await {
            Ok(tx_hash) => tx_hash,
            Err(LedgerError::Rejected(reason)) => {
                self.release_send(request);
                let refusal = LedgerRefusal::from_reason(&reason);
                info!(donor = %wallet, ?refusal, "Ledger rejected contribution");
                let mut admission = admission;
                admission.admissible = false;
                admission.message = RefusalReason::LedgerRefused(refusal.clone()).message().to_string();
                admission.reason = Some(RefusalReason::LedgerRefused(refusal));
                return SubmissionResult::Refused { admission };
            }
            Err(e @ (LedgerError::NotInitialized | LedgerError::InvalidInput(_))) => {
                self.release_send(request);
                error!(donor = %wallet, error = %e, "Submission failed");
                return failed(&EngineError::from(e), None, None);
            }
            Err(e) => {
                // The node may have accepted the transaction before the error
                warn!(donor = %wallet, error = %e, "Submission outcome unknown");
                return SubmissionResult::PendingUnknown {
                    tx_hash: None,
                    record: None,
                };
            }
        };
        info!(donor = %wallet, tx_hash = %tx_hash, amount = %request.amount, "Contribution submitted");
        if let Err(e) = self
            .store
            .record_send_hash(&request.donor, &request.transaction_code, &tx_hash)
        {
            warn!(tx_hash = %tx_hash, error = %e, "Failed to note transaction hash for attempt");
        }

        let outcome = ledger::await_outcome(
            self.ledger.as_ref(),
            tx_hash,
            self.receipt_poll,
            self.confirmation_timeout,
        )
        .await;
        self.settle(request, wallet, native, rate, outcome).await
    }

    /// The node refused the send outright, so the attempt may be tried again.
    fn release_send(&self, request: &ContributionRequest) {
        if let Err(e) = self.store.release_send(&request.donor, &request.transaction_code) {
            warn!(code = %request.transaction_code, error = %e, "Failed to release send claim");
        }
    }

    /// Record what the chain says about a sent transaction.
    async fn settle(
        &self,
        request: &ContributionRequest,
        wallet: &WalletAddress,
        native: Wei,
        rate: NativeRate,
        outcome: ContributeOutcome,
    ) -> SubmissionResult {
        let base = |status: ContributionStatus, tx_hash: &TxHash| NewContribution {
            donor_key: request.donor.clone(),
            campaign_id: self.calculator.config().campaign_id.clone(),
            amount_fiat: request.amount,
            amount_native: Some(native),
            native_rate: Some(rate),
            payment_rail: PaymentRail::OnChain,
            chain_tx_hash: Some(tx_hash.clone()),
            transaction_code: Some(request.transaction_code.clone()),
            donation_type: DonationType::OneTime,
            status,
            block_number: None,
            gas_used: None,
            plan_id: None,
            scheduled_for: None,
        };

        match outcome {
            ContributeOutcome::Confirmed(receipt) => {
                let new = NewContribution {
                    block_number: Some(receipt.block_number),
                    gas_used: Some(receipt.gas_used),
                    ..base(ContributionStatus::Completed, &receipt.tx_hash)
                };
                match self.persist(new, CapacityGuard::Skip).await {
                    Ok(InsertOutcome::Inserted(record)) => {
                        info!(
                            id = %record.id,
                            donor = %wallet,
                            tx_hash = %receipt.tx_hash,
                            block = receipt.block_number,
                            "On-chain contribution recorded"
                        );
                        SubmissionResult::Completed {
                            record,
                            receipt: Some(receipt),
                            plan: None,
                            duplicate: false,
                        }
                    }
                    Ok(InsertOutcome::Duplicate { existing, .. }) => SubmissionResult::Completed {
                        record: existing,
                        receipt: Some(receipt),
                        plan: None,
                        duplicate: true,
                    },
                    Ok(InsertOutcome::CapacityExceeded { .. }) | Err(_) => {
                        error!(
                            donor = %wallet,
                            tx_hash = %receipt.tx_hash,
                            block = receipt.block_number,
                            "Contribution confirmed on chain but could not be recorded"
                        );
                        SubmissionResult::RecordKeepingFailed {
                            tx_hash: receipt.tx_hash.clone(),
                            receipt,
                        }
                    }
                }
            }
            ContributeOutcome::Reverted(receipt) => {
                warn!(donor = %wallet, tx_hash = %receipt.tx_hash, "Contribution reverted on chain");
                let new = NewContribution {
                    block_number: Some(receipt.block_number),
                    gas_used: Some(receipt.gas_used),
                    ..base(ContributionStatus::Failed, &receipt.tx_hash)
                };
                let record = self.persist_best_effort(new).await;
                SubmissionResult::Failed {
                    notice: DonorNotice::for_kind(ErrorKind::NotAdmissible),
                    tx_hash: Some(receipt.tx_hash),
                    record,
                }
            }
            ContributeOutcome::Unknown { tx_hash } => {
                warn!(donor = %wallet, tx_hash = %tx_hash, "No receipt before timeout, recording as pending");
                let record = self
                    .persist_best_effort(base(ContributionStatus::Pending, &tx_hash))
                    .await;
                SubmissionResult::PendingUnknown {
                    tx_hash: Some(tx_hash),
                    record,
                }
            }
        }
    }

    /// Insert with the shared retry policy for transient store failures.
    async fn persist(
        &self,
        new: NewContribution,
        guard: CapacityGuard,
    ) -> Result<InsertOutcome, EngineError> {
        self.retry
            .run("insert_contribution", || {
                let new = new.clone();
                async move { self.store.insert_contribution(new, guard) }
            })
            .await
    }

    async fn persist_best_effort(&self, new: NewContribution) -> Option<Uuid> {
        let tx_hash = new.chain_tx_hash.clone();
        match self.persist(new, CapacityGuard::Skip).await {
            Ok(InsertOutcome::Inserted(record)) => Some(record.id),
            Ok(InsertOutcome::Duplicate { existing, .. }) => Some(existing.id),
            Ok(InsertOutcome::CapacityExceeded { .. }) => None,
            Err(e) => {
                error!(tx_hash = ?tx_hash, error = %e, "Failed to record contribution outcome");
                None
            }
        }
    }

    /// Issue payment `index` of a recurring plan, dated `due`.
    ///
    /// The attempt code is derived from the plan and index so a repeated
    /// run records the payment once.
    pub async fn submit_plan_payment(
        &self,
        plan: &RecurringPlan,
        index: u32,
        due: NaiveDate,
    ) -> SubmissionResult {
        let request = ContributionRequest {
            donor: plan.donor_key.clone(),
            amount: plan.amount_per_payment,
            rail: PaymentRail::Traditional,
            donation_type: DonationType::OneTime,
            recurring: None,
            scheduled_for: None,
            transaction_code: TransactionCode::derive(plan.id.as_u128() ^ index as u128),
        };

        let admission = match self.calculator.evaluate(&request.admission()).await {
            Ok(admission) if admission.admissible => admission,
            Ok(admission) => return SubmissionResult::Refused { admission },
            Err(e) => return failed(&e, None, None),
        };

        let config = self.calculator.config();
        let new = NewContribution {
            donor_key: plan.donor_key.clone(),
            campaign_id: plan.campaign_id.clone(),
            amount_fiat: plan.amount_per_payment,
            amount_native: None,
            native_rate: None,
            payment_rail: PaymentRail::Traditional,
            chain_tx_hash: None,
            transaction_code: Some(request.transaction_code.clone()),
            donation_type: DonationType::Recurring,
            status: ContributionStatus::Completed,
            block_number: None,
            gas_used: None,
            plan_id: Some(plan.id),
            scheduled_for: Some(due),
        };
        match self.persist(new, CapacityGuard::Enforce(config.ceiling)).await {
            Ok(InsertOutcome::Inserted(record)) => SubmissionResult::Completed {
                record,
                receipt: None,
                plan: None,
                duplicate: false,
            },
            Ok(InsertOutcome::Duplicate { existing, .. }) => SubmissionResult::Completed {
                record: existing,
                receipt: None,
                plan: None,
                duplicate: true,
            },
            Ok(InsertOutcome::CapacityExceeded { remaining }) => {
                let mut admission = admission;
                admission.admissible = false;
                admission.reason = Some(RefusalReason::ExceedsRemainingCapacity);
                admission.message = RefusalReason::ExceedsRemainingCapacity.message().to_string();
                admission.remaining_capacity = remaining;
                SubmissionResult::Refused { admission }
            }
            Err(e) => failed(&e, None, None),
        }
    }
}

fn failed(e: &EngineError, tx_hash: Option<TxHash>, record: Option<Uuid>) -> SubmissionResult {
    match e {
        EngineError::Validation(_) => SubmissionResult::Invalid {
            notice: e.donor_notice(),
        },
        _ => SubmissionResult::Failed {
            notice: e.donor_notice(),
            tx_hash,
            record,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduled_request_needs_date() {
        let donor = DonorKey::parse("pat@example.org").unwrap();
        let mut request = ContributionRequest::scheduled(
            donor,
            Cents::from_dollars(10),
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        );
        assert!(request.validate().is_ok());
        request.scheduled_for = None;
        assert!(matches!(request.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_final_states() {
        let pending = SubmissionResult::PendingUnknown {
            tx_hash: None,
            record: None,
        };
        assert_eq!(pending.final_state(), FinalState::Unknown);
        assert_eq!(pending.notice().unwrap().kind, ErrorKind::NetworkTimeout);

        let invalid = failed(&EngineError::Validation("x".into()), None, None);
        assert_eq!(invalid.final_state(), FinalState::Failed);
        assert!(matches!(invalid, SubmissionResult::Invalid { .. }));
    }
}
