//! Ledger client abstraction
//!
//! This module defines the `LedgerClient` trait, the seam between the engine
//! and the on-chain campaign contract. The JSON-RPC implementation lives in
//! [`rpc`]; [`mock`] provides a deterministic in-memory fake.

pub mod abi;
pub mod mock;
pub mod rpc;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Retryable;
use crate::identity::{TxHash, WalletAddress};
use crate::money::{NativeRate, Wei};

pub use mock::MockLedger;
pub use rpc::RpcLedgerClient;

/// Error types for ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Client used before `connect()`
    #[error("Ledger client not initialized")]
    NotInitialized,

    /// Connection-level failure
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Request timed out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Response could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Input rejected before calling out
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The node refused the transaction; funds did not move
    #[error("Rejected by ledger: {0}")]
    Rejected(String),
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transport(_) | LedgerError::Timeout(_))
    }
}

/// Contract view of a contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorInfo {
    pub cumulative_amount: Wei,
    pub remaining_capacity: Wei,
    pub is_kyc_verified: bool,
    pub has_contributed_before: bool,
}

/// Contract pre-flight answer for a proposed contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub can_contribute: bool,
    pub reason: String,
}

/// Mined transaction outcome. A reverted transaction is `success: false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub tx_hash: TxHash,
    pub success: bool,
    pub block_number: u64,
    pub gas_used: u64,
}

/// A `ContributionAccepted` log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionEvent {
    pub contributor: WalletAddress,
    pub amount: Wei,
    pub cumulative_amount: Wei,
    /// Block timestamp reported by the contract, unix seconds
    pub timestamp: u64,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub block_hash: String,
    pub log_index: u64,
}

/// Result of a submit-and-wait contribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContributeOutcome {
    /// Mined with status 1
    Confirmed(TransactionReceipt),
    /// Mined but reverted; funds did not move
    Reverted(TransactionReceipt),
    /// Submitted, but no receipt within the timeout
    Unknown { tx_hash: TxHash },
}

/// Reasons the contract gives for refusing a contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerRefusal {
    KycNotVerified,
    ExceedsLimit,
    InvalidAmount,
    CampaignInactive,
    InsufficientFunds,
    Blacklisted,
    Other(String),
}

impl LedgerRefusal {
    /// Map a contract revert or eligibility reason string.
    pub fn from_reason(reason: &str) -> Self {
        let upper = reason.to_ascii_uppercase();
        if upper.contains("KYC") {
            LedgerRefusal::KycNotVerified
        } else if upper.contains("EXCEED") {
            LedgerRefusal::ExceedsLimit
        } else if upper.contains("INVALID_AMOUNT") || upper.contains("INVALID AMOUNT") {
            LedgerRefusal::InvalidAmount
        } else if upper.contains("PAUSED") || upper.contains("INACTIVE") {
            LedgerRefusal::CampaignInactive
        } else if upper.contains("INSUFFICIENT") {
            LedgerRefusal::InsufficientFunds
        } else if upper.contains("BLACKLIST") {
            LedgerRefusal::Blacklisted
        } else {
            LedgerRefusal::Other(reason.to_string())
        }
    }
}

/// Core trait for the on-chain ledger.
///
/// Implementations are stateless per call; retries belong to the caller.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Cumulative amount, remaining capacity and KYC flag for a contributor.
    async fn contributor_info(&self, donor: &WalletAddress) -> Result<ContributorInfo, LedgerError>;

    /// Contract-side eligibility check for a proposed amount.
    async fn can_contribute(
        &self,
        donor: &WalletAddress,
        amount: Wei,
    ) -> Result<Eligibility, LedgerError>;

    /// Submit a value-bearing `contribute()` transaction. Never retried.
    async fn send_contribution(
        &self,
        from: &WalletAddress,
        amount: Wei,
    ) -> Result<TxHash, LedgerError>;

    /// Receipt for a mined transaction, `None` while pending or unknown.
    async fn transaction_receipt(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Option<TransactionReceipt>, LedgerError>;

    /// Contribution events in an inclusive block range.
    async fn query_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ContributionEvent>, LedgerError>;

    /// Current chain head.
    async fn block_number(&self) -> Result<u64, LedgerError>;

    /// Canonical hash of a block, `None` if it does not exist yet.
    async fn block_hash(&self, number: u64) -> Result<Option<String>, LedgerError>;

    /// Contract spot price of one native unit.
    async fn native_price(&self) -> Result<NativeRate, LedgerError>;
}

/// Poll for a receipt until one arrives or `timeout` elapses.
///
/// The hash format is validated before any call is made. Transient transport
/// failures keep polling; a timeout returns `Ok(None)` because the outcome is
/// unknown, not failed.
pub async fn wait_for_transaction(
    ledger: &dyn LedgerClient,
    tx_hash: &str,
    poll: Duration,
    timeout: Duration,
) -> Result<Option<TransactionReceipt>, LedgerError> {
    let hash = TxHash::parse(tx_hash).map_err(|e| LedgerError::InvalidInput(e.to_string()))?;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match ledger.transaction_receipt(&hash).await {
            Ok(Some(receipt)) => return Ok(Some(receipt)),
            Ok(None) => {}
            Err(e) if e.is_retryable() => {
                debug!(tx_hash = %hash, error = %e, "Receipt poll failed, will retry");
            }
            Err(e) => return Err(e),
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            warn!(tx_hash = %hash, "No receipt before confirmation timeout");
            return Ok(None);
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

/// Submit a contribution and wait for its receipt.
///
/// An `Err` means the submission itself failed; once a hash exists the result
/// is always an outcome, never an error.
pub async fn contribute(
    ledger: &dyn LedgerClient,
    from: &WalletAddress,
    amount: Wei,
    poll: Duration,
    timeout: Duration,
) -> Result<ContributeOutcome, LedgerError> {
    let tx_hash = ledger.send_contribution(from, amount).await?;
    debug!(tx_hash = %tx_hash, donor = %from, %amount, "Contribution submitted");
    Ok(await_outcome(ledger, tx_hash, poll, timeout).await)
}

/// Wait for an already submitted transaction and classify its receipt.
pub async fn await_outcome(
    ledger: &dyn LedgerClient,
    tx_hash: TxHash,
    poll: Duration,
    timeout: Duration,
) -> ContributeOutcome {
    match wait_for_transaction(ledger, tx_hash.as_str(), poll, timeout).await {
        Ok(Some(receipt)) if receipt.success => ContributeOutcome::Confirmed(receipt),
        Ok(Some(receipt)) => ContributeOutcome::Reverted(receipt),
        Ok(None) => ContributeOutcome::Unknown { tx_hash },
        Err(e) => {
            warn!(tx_hash = %tx_hash, error = %e, "Receipt lookup failed after submission");
            ContributeOutcome::Unknown { tx_hash }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> WalletAddress {
        WalletAddress::parse("0x1111111111111111111111111111111111111111").unwrap()
    }

    #[tokio::test]
    async fn test_wait_rejects_malformed_hash_before_calling() {
        let ledger = MockLedger::new();
        let result = wait_for_transaction(
            &ledger,
            "0x1234",
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .await;
        assert!(matches!(result, Err(LedgerError::InvalidInput(_))));
        assert_eq!(ledger.receipt_calls(), 0);
    }

    #[tokio::test]
    async fn test_reverted_transaction_is_not_an_error() {
        let ledger = MockLedger::new().with_revert_next_send();
        let outcome = contribute(
            &ledger,
            &wallet(),
            Wei::new(1_000),
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        match outcome {
            ContributeOutcome::Reverted(receipt) => assert!(!receipt.success),
            other => panic!("expected reverted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_unknown() {
        let ledger = MockLedger::new().with_withheld_receipts();
        let outcome = contribute(
            &ledger,
            &wallet(),
            Wei::new(1_000),
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, ContributeOutcome::Unknown { .. }));
    }

    #[test]
    fn test_refusal_mapping() {
        assert_eq!(LedgerRefusal::from_reason("KYC_REQUIRED"), LedgerRefusal::KycNotVerified);
        assert_eq!(LedgerRefusal::from_reason("CAMPAIGN_PAUSED"), LedgerRefusal::CampaignInactive);
        assert_eq!(
            LedgerRefusal::from_reason("INSUFFICIENT_BALANCE"),
            LedgerRefusal::InsufficientFunds
        );
        assert_eq!(
            LedgerRefusal::from_reason("Contribution limit exceeded"),
            LedgerRefusal::ExceedsLimit
        );
        assert_eq!(
            LedgerRefusal::from_reason("not today"),
            LedgerRefusal::Other("not today".into())
        );
    }
}
