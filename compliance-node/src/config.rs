//! Node configuration

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use compliance_engine::{ComplianceConfig, LedgerConfig, ReconcilerConfig, RetryPolicy, SchedulerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the contribution database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Capacity of the watcher to reconciler channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/compliance-node") }
fn default_event_buffer() -> usize { 256 }

impl Config {
    /// Read `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.compliance.validate()?;
        if config.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_engine::Cents;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/compliance-node"));
        assert_eq!(config.compliance.ceiling, Cents::from_dollars(3300));
        assert_eq!(config.reconciler.confirmation_depth, 12);
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let result = Config::parse(
            r#"
            [compliance]
            ceiling = "10.00"
            min_amount = "20.00"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }
}
