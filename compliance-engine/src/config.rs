//! Engine configuration sections
//!
//! Each section deserializes from TOML with per-field defaults, so a config
//! file only needs to name what differs from the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::identity::WalletAddress;
use crate::money::Cents;

/// Statutory limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Campaign (election) the limits apply to
    #[serde(default = "default_campaign_id")]
    pub campaign_id: String,

    /// Per-donor cumulative ceiling, e.g. "3300.00"
    #[serde(default = "default_ceiling")]
    pub ceiling: Cents,

    /// Smallest accepted contribution
    #[serde(default = "default_min_amount")]
    pub min_amount: Cents,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            campaign_id: default_campaign_id(),
            ceiling: default_ceiling(),
            min_amount: default_min_amount(),
        }
    }
}

impl ComplianceConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.campaign_id.trim().is_empty() {
            return Err(EngineError::Config("compliance.campaign_id is empty".into()));
        }
        if self.min_amount.is_zero() {
            return Err(EngineError::Config("compliance.min_amount must be positive".into()));
        }
        if self.min_amount > self.ceiling {
            return Err(EngineError::Config(format!(
                "compliance.min_amount {} exceeds ceiling {}",
                self.min_amount, self.ceiling
            )));
        }
        Ok(())
    }
}

fn default_campaign_id() -> String { "general-2026".to_string() }
fn default_ceiling() -> Cents { Cents::from_dollars(3300) }
fn default_min_amount() -> Cents { Cents::from_dollars(1) }

/// Ledger endpoint and contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Deployed campaign contract
    #[serde(default)]
    pub contract_address: Option<WalletAddress>,

    /// Expected chain id; checked on connect when set
    #[serde(default)]
    pub chain_id: Option<u64>,

    /// Per-request HTTP timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long to wait for a receipt before reporting an unknown outcome
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// Receipt polling interval in milliseconds
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,

    /// Fiat price of one native unit used when the ledger price is unavailable
    #[serde(default = "default_fallback_price")]
    pub fallback_price: Cents,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            contract_address: None,
            chain_id: None,
            request_timeout_ms: default_request_timeout_ms(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            receipt_poll_ms: default_receipt_poll_ms(),
            fallback_price: default_fallback_price(),
        }
    }
}

impl LedgerConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn receipt_poll(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_rpc_url() -> String { "http://127.0.0.1:8545".to_string() }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_confirmation_timeout_secs() -> u64 { 120 }
fn default_receipt_poll_ms() -> u64 { 2_000 }
fn default_fallback_price() -> Cents { Cents::from_dollars(3000) }

/// Reconciliation loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// First block to scan when no cursor is stored (contract deployment block)
    #[serde(default)]
    pub start_block: u64,

    /// Blocks per event query
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Chain head polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Periodic ledger consistency check interval in seconds
    #[serde(default = "default_validation_interval_secs")]
    pub validation_interval_secs: u64,

    /// Suspect and pending re-verification interval in seconds
    #[serde(default = "default_reverify_interval_secs")]
    pub reverify_interval_secs: u64,

    /// Pending records younger than this are left for the write path
    #[serde(default = "default_pending_grace_secs")]
    pub pending_grace_secs: u64,

    /// Blocks behind head before an event is ingested
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,

    /// Recent block hashes kept for reorg detection
    #[serde(default = "default_reorg_window")]
    pub reorg_window: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            validation_interval_secs: default_validation_interval_secs(),
            reverify_interval_secs: default_reverify_interval_secs(),
            pending_grace_secs: default_pending_grace_secs(),
            confirmation_depth: default_confirmation_depth(),
            reorg_window: default_reorg_window(),
        }
    }
}

fn default_batch_size() -> u64 { 500 }
fn default_poll_interval_ms() -> u64 { 4_000 }
fn default_validation_interval_secs() -> u64 { 3_600 }
fn default_reverify_interval_secs() -> u64 { 60 }
fn default_pending_grace_secs() -> u64 { 300 }
fn default_confirmation_depth() -> u64 { 12 }
fn default_reorg_window() -> u64 { 64 }

/// Recurring and scheduled payment processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often due payments are processed, in seconds
    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_scheduler_interval_secs(),
        }
    }
}

fn default_true() -> bool { true }
fn default_scheduler_interval_secs() -> u64 { 3_600 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compliance_defaults() {
        let config = ComplianceConfig::default();
        assert_eq!(config.ceiling, Cents::from_dollars(3300));
        assert_eq!(config.min_amount, Cents::from_dollars(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_min_above_ceiling_rejected() {
        let config = ComplianceConfig {
            min_amount: Cents::from_dollars(5000),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ledger_section_from_toml() {
        let config: LedgerConfig = toml::from_str(
            r#"
            rpc_url = "http://node:8545"
            contract_address = "0x00000000000000000000000000000000000000aa"
            chain_id = 31337
            fallback_price = "2500.50"
            "#,
        )
        .unwrap();
        assert_eq!(config.chain_id, Some(31337));
        assert_eq!(config.fallback_price, Cents::new(250_050));
        assert_eq!(config.receipt_poll_ms, 2_000);
        assert!(config.contract_address.is_some());
    }
}
