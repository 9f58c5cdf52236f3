//! Persisted domain records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::identity::{DonorKey, TransactionCode, TxHash};
use crate::money::{Cents, NativeRate, Wei};

/// Enums stored as TEXT columns round-trip through their snake_case names.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(
    /// How the contribution is settled.
    PaymentRail {
        Traditional => "traditional",
        OnChain => "on_chain",
    }
);

text_enum!(
    DonationType {
        OneTime => "one_time",
        Recurring => "recurring",
        Scheduled => "scheduled",
    }
);

text_enum!(
    /// Lifecycle of a contribution record.
    ///
    /// Only `completed` counts toward a donor's total; `pending` is reserved
    /// capacity; `reorg_suspect` is excluded until re-confirmed.
    ContributionStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Duplicate => "duplicate",
        ReorgSuspect => "reorg_suspect",
        RolledBack => "rolled_back",
    }
);

text_enum!(
    Frequency {
        Weekly => "weekly",
        Biweekly => "biweekly",
        Monthly => "monthly",
        Quarterly => "quarterly",
        Annually => "annually",
    }
);

text_enum!(
    PlanStatus {
        Active => "active",
        Completed => "completed",
        Cancelled => "cancelled",
        AutoCancelled => "auto_cancelled",
    }
);

impl ContributionStatus {
    /// Statuses that hold the chain transaction hash exclusively.
    pub const ACTIVE: [ContributionStatus; 3] = [
        ContributionStatus::Pending,
        ContributionStatus::Completed,
        ContributionStatus::ReorgSuspect,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

/// The durable record of one contribution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub id: Uuid,
    pub donor_key: DonorKey,
    pub campaign_id: String,
    pub amount_fiat: Cents,
    /// Present for on-chain contributions
    pub amount_native: Option<Wei>,
    /// Rate used to derive `amount_native`
    pub native_rate: Option<NativeRate>,
    pub payment_rail: PaymentRail,
    pub chain_tx_hash: Option<TxHash>,
    pub transaction_code: Option<TransactionCode>,
    pub donation_type: DonationType,
    pub status: ContributionStatus,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub plan_id: Option<Uuid>,
    pub scheduled_for: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewContribution {
    pub donor_key: DonorKey,
    pub campaign_id: String,
    pub amount_fiat: Cents,
    pub amount_native: Option<Wei>,
    pub native_rate: Option<NativeRate>,
    pub payment_rail: PaymentRail,
    pub chain_tx_hash: Option<TxHash>,
    pub transaction_code: Option<TransactionCode>,
    pub donation_type: DonationType,
    pub status: ContributionStatus,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub plan_id: Option<Uuid>,
    pub scheduled_for: Option<NaiveDate>,
}

impl NewContribution {
    /// Check the rail-dependent field invariants.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.amount_fiat.is_zero() {
            return Err(EngineError::Validation("amount must be positive".into()));
        }
        match self.payment_rail {
            PaymentRail::OnChain => {
                if self.chain_tx_hash.is_none() || self.amount_native.is_none() {
                    return Err(EngineError::Validation(
                        "on-chain contributions need a transaction hash and native amount".into(),
                    ));
                }
                if self.status == ContributionStatus::Completed && self.block_number.is_none() {
                    return Err(EngineError::Validation(
                        "completed on-chain contributions need a block number".into(),
                    ));
                }
            }
            PaymentRail::Traditional => {
                if self.chain_tx_hash.is_some() || self.block_number.is_some() {
                    return Err(EngineError::Validation(
                        "traditional contributions cannot carry chain data".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Per-donor, per-campaign aggregate. Derived from contribution records and
/// cached alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionLimitState {
    pub donor_key: DonorKey,
    pub campaign_id: String,
    pub ceiling: Cents,
    /// Sum of `completed` records
    pub total_contributed_fiat: Cents,
    /// Sum of `pending` records
    pub reserved_fiat: Cents,
    /// Sum of `reorg_suspect` records, excluded from the total
    pub suspect_fiat: Cents,
    /// `ceiling - total - reserved`, floored at zero
    pub remaining_capacity_fiat: Cents,
    pub projected_recurring_total_fiat: Option<Cents>,
    pub will_exceed_limit: bool,
    pub auto_cancel_at: Option<NaiveDate>,
    /// Set when the last ledger comparison disagreed
    pub sync_required: bool,
    /// Ledger total minus local total, in wei
    pub discrepancy_native: Option<i128>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A donor's recurring schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringPlan {
    pub id: Uuid,
    pub donor_key: DonorKey,
    pub campaign_id: String,
    pub amount_per_payment: Cents,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    /// Payments the projection allows
    pub payment_count: u32,
    pub total_projected_amount: Cents,
    /// Last date a payment may be issued; set when the projection hits the ceiling
    pub auto_cancel_date: Option<NaiveDate>,
    pub payments_issued: u32,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registered donor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorProfile {
    pub donor_key: DonorKey,
    pub display_name: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Off-chain identity verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KycAttestation {
    pub id: Uuid,
    pub donor_key: DonorKey,
    pub provider: String,
    pub verified: bool,
    pub attested_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            ContributionStatus::Pending,
            ContributionStatus::Completed,
            ContributionStatus::Failed,
            ContributionStatus::Duplicate,
            ContributionStatus::ReorgSuspect,
            ContributionStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<ContributionStatus>().unwrap(), status);
        }
        assert!("settled".parse::<ContributionStatus>().is_err());
    }

    #[test]
    fn test_active_statuses() {
        assert!(ContributionStatus::ReorgSuspect.is_active());
        assert!(!ContributionStatus::Duplicate.is_active());
        assert!(!ContributionStatus::Failed.is_active());
    }

    #[test]
    fn test_serde_uses_snake_case_names() {
        let json = serde_json::to_string(&PaymentRail::OnChain).unwrap();
        assert_eq!(json, "\"on_chain\"");
    }

    #[test]
    fn test_traditional_rejects_chain_fields() {
        let new = NewContribution {
            donor_key: DonorKey::parse("a@b.org").unwrap(),
            campaign_id: "c".into(),
            amount_fiat: Cents::from_dollars(10),
            amount_native: None,
            native_rate: None,
            payment_rail: PaymentRail::Traditional,
            chain_tx_hash: None,
            transaction_code: None,
            donation_type: DonationType::OneTime,
            status: ContributionStatus::Completed,
            block_number: Some(5),
            gas_used: None,
            plan_id: None,
            scheduled_for: None,
        };
        assert!(new.validate().is_err());
    }
}
