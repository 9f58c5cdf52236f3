//! Example config parsing integration tests

use compliance_engine::{
    Cents, ComplianceConfig, LedgerConfig, ReconcilerConfig, RetryPolicy, SchedulerConfig,
};

const EXAMPLE: &str = include_str!("../compliance-node.example.toml");

fn section<T: serde::de::DeserializeOwned>(config: &toml::Value, name: &str) -> T {
    config
        .get(name)
        .unwrap_or_else(|| panic!("missing [{}] section", name))
        .clone()
        .try_into()
        .unwrap_or_else(|e| panic!("invalid [{}] section: {}", name, e))
}

/// The shipped example parses and matches the engine defaults.
#[test]
fn test_example_matches_defaults() {
    let config: toml::Value = toml::from_str(EXAMPLE).expect("valid TOML");

    let compliance: ComplianceConfig = section(&config, "compliance");
    let defaults = ComplianceConfig::default();
    assert_eq!(compliance.campaign_id, defaults.campaign_id);
    assert_eq!(compliance.ceiling, defaults.ceiling);
    assert_eq!(compliance.min_amount, defaults.min_amount);
    assert!(compliance.validate().is_ok());

    let reconciler: ReconcilerConfig = section(&config, "reconciler");
    let defaults = ReconcilerConfig::default();
    assert_eq!(reconciler.batch_size, defaults.batch_size);
    assert_eq!(reconciler.confirmation_depth, defaults.confirmation_depth);
    assert_eq!(reconciler.reorg_window, defaults.reorg_window);

    let retry: RetryPolicy = section(&config, "retry");
    assert_eq!(retry.max_attempts, RetryPolicy::default().max_attempts);

    let scheduler: SchedulerConfig = section(&config, "scheduler");
    assert!(scheduler.enabled);
}

#[test]
fn test_example_ledger_section() {
    let config: toml::Value = toml::from_str(EXAMPLE).expect("valid TOML");
    let ledger: LedgerConfig = section(&config, "ledger");

    assert_eq!(ledger.chain_id, Some(31337));
    assert_eq!(ledger.fallback_price, Cents::from_dollars(3000));
    assert_eq!(
        ledger.contract_address.as_ref().unwrap().as_str(),
        "0x5fbdb2315678afecb367f032d93f642f64180aa3"
    );
    assert_eq!(ledger.receipt_poll().as_millis(), 2000);
}

#[test]
fn test_partial_sections_fill_defaults() {
    let config: toml::Value = toml::from_str(
        r#"
[compliance]
ceiling = "5000.00"

[reconciler]
confirmation_depth = 3
"#,
    )
    .expect("valid TOML");

    let compliance: ComplianceConfig = section(&config, "compliance");
    assert_eq!(compliance.ceiling, Cents::from_dollars(5000));
    assert_eq!(compliance.min_amount, Cents::from_dollars(1));

    let reconciler: ReconcilerConfig = section(&config, "reconciler");
    assert_eq!(reconciler.confirmation_depth, 3);
    assert_eq!(reconciler.batch_size, 500);
}

/// Amounts are strings so no float ever carries money.
#[test]
fn test_float_amount_rejected() {
    let config: toml::Value = toml::from_str("[compliance]\nceiling = 3300.0\n").expect("valid TOML");
    let parsed: Result<ComplianceConfig, _> = config.get("compliance").unwrap().clone().try_into();
    assert!(parsed.is_err());
}
