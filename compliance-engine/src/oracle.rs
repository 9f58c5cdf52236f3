//! Fiat to native price conversion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::ledger::LedgerClient;
use crate::models::ContributionRecord;
use crate::money::{Cents, NativeRate, Wei};
use crate::retry::RetryPolicy;

/// Where a rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Ledger,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateQuote {
    pub rate: NativeRate,
    pub source: RateSource,
}

/// Result of re-checking a stored record against its own stored rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyCheck {
    Consistent,
    /// Traditional record or no stored rate
    NotApplicable,
    Inconsistent { expected_fiat: Cents, stored_fiat: Cents },
}

pub struct PriceOracle {
    ledger: Arc<dyn LedgerClient>,
    fallback: NativeRate,
    retry: RetryPolicy,
}

impl PriceOracle {
    /// `fallback_price` is the fiat price of one whole native unit.
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        fallback_price: Cents,
        retry: RetryPolicy,
    ) -> Result<Self, EngineError> {
        let fallback = NativeRate::from_cents_per_native(fallback_price.as_u64() as u128)
            .ok_or_else(|| EngineError::Config("ledger.fallback_price must be positive".into()))?;
        Ok(Self {
            ledger,
            fallback,
            retry,
        })
    }

    /// Current spot rate, falling back to the configured constant when the
    /// ledger cannot answer.
    pub async fn quote(&self) -> RateQuote {
        match self.retry.run("native_price", || self.ledger.native_price()).await {
            Ok(rate) => RateQuote {
                rate,
                source: RateSource::Ledger,
            },
            Err(e) => {
                warn!(error = %e, fallback = %self.fallback, "Ledger price unavailable, using fallback");
                RateQuote {
                    rate: self.fallback,
                    source: RateSource::Fallback,
                }
            }
        }
    }

    /// Convert a fiat amount, returning the native amount and the rate used.
    pub async fn convert_to_native(&self, amount: Cents) -> Result<(Wei, RateQuote), EngineError> {
        let quote = self.quote().await;
        let native = quote
            .rate
            .to_native(amount)
            .ok_or_else(|| EngineError::Validation(format!("amount {} is too large to convert", amount)))?;
        Ok((native, quote))
    }

    /// Re-check a stored record's fiat and native amounts against the rate
    /// stored with it.
    pub fn check_record_consistency(record: &ContributionRecord) -> ConsistencyCheck {
        let (Some(native), Some(rate)) = (record.amount_native, record.native_rate) else {
            return ConsistencyCheck::NotApplicable;
        };
        if rate.is_consistent(record.amount_fiat, native) {
            return ConsistencyCheck::Consistent;
        }
        ConsistencyCheck::Inconsistent {
            expected_fiat: rate.to_fiat(native).unwrap_or(Cents::ZERO),
            stored_fiat: record.amount_fiat,
        }
    }
}
