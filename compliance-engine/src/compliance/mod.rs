//! Contribution admissibility
//!
//! The calculator is a fast-path filter: it reads the donor's history, asks
//! the ledger for on-chain totals and KYC state, and decides. The store's
//! capacity re-check at commit time is the final authority.
//!
//! Ledger failures never admit a contribution. They come back as a
//! `LedgerUnreachable` refusal.

pub mod projection;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ComplianceConfig;
use crate::error::EngineError;
use crate::identity::{DonorKey, WalletAddress};
use crate::ledger::{LedgerClient, LedgerRefusal};
use crate::models::{ContributionLimitState, DonationType, Frequency, PaymentRail};
use crate::money::Cents;
use crate::oracle::{PriceOracle, RateQuote};
use crate::retry::RetryPolicy;
use crate::store::ContributionStore;

pub use projection::{payment_date, project_recurring, RecurringProjection, MAX_PROJECTED_PAYMENTS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringDetails {
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

/// A proposed contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub donor: DonorKey,
    pub amount: Cents,
    pub rail: PaymentRail,
    pub donation_type: DonationType,
    pub recurring: Option<RecurringDetails>,
}

impl AdmissionRequest {
    pub fn one_time(donor: DonorKey, amount: Cents, rail: PaymentRail) -> Self {
        Self {
            donor,
            amount,
            rail,
            donation_type: DonationType::OneTime,
            recurring: None,
        }
    }

    /// Shape checks that need no history. Fails with `Validation`.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.amount.is_zero() {
            return Err(EngineError::Validation("amount must be positive".into()));
        }
        if self.rail == PaymentRail::OnChain && self.donor.wallet().is_none() {
            return Err(EngineError::Validation(
                "on-chain contributions need a wallet address".into(),
            ));
        }
        match (self.donation_type, &self.recurring) {
            (DonationType::Recurring, None) => Err(EngineError::Validation(
                "recurring contributions need a frequency and start date".into(),
            )),
            (DonationType::Recurring, Some(_)) if self.rail == PaymentRail::OnChain => {
                Err(EngineError::Validation(
                    "recurring contributions are only supported on the traditional rail".into(),
                ))
            }
            (DonationType::Recurring, Some(details)) => match details.end_date {
                Some(end) if end < details.start_date => Err(EngineError::Validation(
                    "end date precedes start date".into(),
                )),
                _ => Ok(()),
            },
            (_, Some(_)) => Err(EngineError::Validation(
                "schedule details given for a non-recurring contribution".into(),
            )),
            (DonationType::Scheduled, None) if self.rail == PaymentRail::OnChain => {
                Err(EngineError::Validation(
                    "scheduled contributions are only supported on the traditional rail".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Why a contribution was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RefusalReason {
    BelowMinimum,
    AboveCeiling,
    ExceedsRemainingCapacity,
    KycRequired,
    IdentityUnverifiable,
    LedgerUnreachable,
    LedgerRefused(LedgerRefusal),
}

impl RefusalReason {
    /// Message safe to show a donor.
    pub fn message(&self) -> &'static str {
        match self {
            RefusalReason::BelowMinimum => "The amount is below the minimum contribution",
            RefusalReason::AboveCeiling => "The amount exceeds the per-election contribution limit",
            RefusalReason::ExceedsRemainingCapacity => "Contribution limit exceeded",
            RefusalReason::KycRequired => "Identity verification is required before contributing",
            RefusalReason::IdentityUnverifiable => {
                "We could not verify your identity; please register before contributing"
            }
            RefusalReason::LedgerUnreachable => {
                "Contributions are temporarily unavailable; please try again later"
            }
            RefusalReason::LedgerRefused(refusal) => match refusal {
                LedgerRefusal::KycNotVerified => {
                    "Identity verification is required before contributing"
                }
                LedgerRefusal::ExceedsLimit => "Contribution limit exceeded",
                LedgerRefusal::InvalidAmount => "The contribution amount is invalid",
                LedgerRefusal::CampaignInactive => "The campaign is not accepting contributions",
                LedgerRefusal::InsufficientFunds => "The wallet balance is insufficient",
                LedgerRefusal::Blacklisted | LedgerRefusal::Other(_) => {
                    "The contribution was declined"
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionResult {
    pub admissible: bool,
    pub reason: Option<RefusalReason>,
    pub message: String,
    /// Completed total the decision was based on
    pub current_total: Cents,
    /// Pending amounts counted against the ceiling
    pub reserved: Cents,
    /// Capacity left before this contribution
    pub remaining_capacity: Cents,
    pub projection: Option<RecurringProjection>,
    /// Rate used for on-chain conversion
    pub quote: Option<RateQuote>,
}

struct DonorStanding {
    current_total: Cents,
    reserved: Cents,
    kyc_verified: bool,
    quote: Option<RateQuote>,
}

pub struct ComplianceCalculator {
    store: Arc<dyn ContributionStore>,
    ledger: Arc<dyn LedgerClient>,
    oracle: Arc<PriceOracle>,
    config: ComplianceConfig,
    retry: RetryPolicy,
}

impl ComplianceCalculator {
    pub fn new(
        store: Arc<dyn ContributionStore>,
        ledger: Arc<dyn LedgerClient>,
        oracle: Arc<PriceOracle>,
        config: ComplianceConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            oracle,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &ComplianceConfig {
        &self.config
    }

    /// Decide whether `request` may proceed.
    ///
    /// Business refusals and ledger outages are `Ok` results with
    /// `admissible == false`. Malformed requests and store failures are
    /// errors.
    pub async fn evaluate(&self, request: &AdmissionRequest) -> Result<AdmissionResult, EngineError> {
        request.validate()?;
        let ceiling = self.config.ceiling;

        let standing = match self.standing(&request.donor).await? {
            Ok(standing) => standing,
            Err(reason) => return Ok(self.refuse(reason, Cents::ZERO, Cents::ZERO, None)),
        };
        let committed = standing.current_total + standing.reserved;
        let remaining = ceiling.saturating_sub(committed);
        let refuse = |reason: RefusalReason, projection: Option<RecurringProjection>| {
            let mut result = self.refuse(reason, standing.current_total, standing.reserved, projection);
            result.remaining_capacity = remaining;
            result.quote = standing.quote;
            Ok(result)
        };

        if request.amount < self.config.min_amount {
            return refuse(RefusalReason::BelowMinimum, None);
        }
        if request.amount > ceiling {
            return refuse(RefusalReason::AboveCeiling, None);
        }
        if request.rail == PaymentRail::OnChain && !standing.kyc_verified {
            return refuse(RefusalReason::KycRequired, None);
        }

        let projection = request.recurring.as_ref().map(|details| {
            project_recurring(
                request.amount,
                details.frequency,
                details.start_date,
                details.end_date,
                remaining,
            )
        });
        let first_payment_fits = match &projection {
            Some(p) => p.payment_count > 0,
            None => request.amount <= remaining,
        };
        if !first_payment_fits {
            return refuse(RefusalReason::ExceedsRemainingCapacity, projection);
        }

        if let (PaymentRail::OnChain, Some(wallet)) = (request.rail, request.donor.wallet()) {
            if let Err(reason) = self.preflight(wallet, request.amount, standing.quote).await {
                return refuse(reason, projection);
            }
        }

        debug!(
            donor = %request.donor,
            amount = %request.amount,
            current = %standing.current_total,
            reserved = %standing.reserved,
            %remaining,
            "Contribution admissible"
        );
        Ok(AdmissionResult {
            admissible: true,
            reason: None,
            message: "Eligible for contribution".to_string(),
            current_total: standing.current_total,
            reserved: standing.reserved,
            remaining_capacity: remaining,
            projection,
            quote: standing.quote,
        })
    }

    /// Current limit state for a donor, recomputed from records.
    pub fn limit_state(&self, donor: &DonorKey) -> Result<ContributionLimitState, EngineError> {
        self.store
            .limit_state(donor, &self.config.campaign_id, self.config.ceiling)
    }

    fn refuse(
        &self,
        reason: RefusalReason,
        current_total: Cents,
        reserved: Cents,
        projection: Option<RecurringProjection>,
    ) -> AdmissionResult {
        AdmissionResult {
            admissible: false,
            message: reason.message().to_string(),
            reason: Some(reason),
            current_total,
            reserved,
            remaining_capacity: Cents::ZERO,
            projection,
            quote: None,
        }
    }

    /// Resolve the donor's totals. The outer error is a store failure; the
    /// inner one a refusal.
    async fn standing(
        &self,
        donor: &DonorKey,
    ) -> Result<Result<DonorStanding, RefusalReason>, EngineError> {
        let local = self.store.donor_totals(donor, &self.config.campaign_id)?;

        let Some(wallet) = donor.wallet() else {
            if local.record_count == 0 && self.store.get_donor(donor)?.is_none() {
                debug!(donor = %donor, "Donor has no verifiable identity");
                return Ok(Err(RefusalReason::IdentityUnverifiable));
            }
            let kyc_verified = self
                .store
                .latest_kyc(donor)?
                .is_some_and(|attestation| attestation.verified);
            return Ok(Ok(DonorStanding {
                current_total: local.completed,
                reserved: local.pending,
                kyc_verified,
                quote: None,
            }));
        };

        let info = match self
            .retry
            .run("contributor_info", || self.ledger.contributor_info(wallet))
            .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!(donor = %donor, error = %e, "Ledger unavailable, refusing contribution");
                return Ok(Err(RefusalReason::LedgerUnreachable));
            }
        };

        let quote = self.oracle.quote().await;
        let Some(chain_total) = quote.rate.to_fiat_ceil(info.cumulative_amount) else {
            warn!(donor = %donor, cumulative = %info.cumulative_amount, "On-chain total out of range");
            return Ok(Err(RefusalReason::AboveCeiling));
        };

        Ok(Ok(DonorStanding {
            current_total: chain_total + local.completed_traditional,
            reserved: local.pending,
            kyc_verified: info.is_kyc_verified,
            quote: Some(quote),
        }))
    }

    /// Contract-side eligibility check for an on-chain amount.
    async fn preflight(
        &self,
        wallet: &WalletAddress,
        amount: Cents,
        quote: Option<RateQuote>,
    ) -> Result<(), RefusalReason> {
        let native = match quote {
            Some(quote) => quote.rate.to_native(amount),
            None => None,
        }
        .ok_or(RefusalReason::AboveCeiling)?;

        match self
            .retry
            .run("can_contribute", || self.ledger.can_contribute(wallet, native))
            .await
        {
            Ok(eligibility) if eligibility.can_contribute => Ok(()),
            Ok(eligibility) => {
                debug!(donor = %wallet, reason = %eligibility.reason, "Ledger refused contribution");
                Err(RefusalReason::LedgerRefused(LedgerRefusal::from_reason(
                    &eligibility.reason,
                )))
            }
            Err(e) => {
                warn!(donor = %wallet, error = %e, "Eligibility check failed, refusing contribution");
                Err(RefusalReason::LedgerUnreachable)
            }
        }
    }
}
