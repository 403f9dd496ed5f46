//! Orchestrator configuration

use crate::error::ConfigError;
use crate::persistence::RetryPolicy;
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Fixed recipients of every initial token distribution.
pub const DEFAULT_DISTRIBUTION_WALLETS: [&str; 4] = [
    "0x53146ebe37502a000f54c343cd5ec665d5f118d7cc306c62cf41fd27716341d9",
    "0x695fddb793accf3b65e5e5183d8f136b92fa8963ceeb3fe9a14cb486a668b034",
    "0xd89d2d8c8c3848dbeeaab302e005e16728363a463f63e7b45cc331c655e6991a",
    "0xad66e734548c14021b6ba8e2b03279c2d1f05ae1cba9c9ba28499ac85b8e258c",
];

pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;
pub const DEFAULT_LEDGER_TIMEOUT_SECS: u64 = 60;

/// Token orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Only this identity may create and distribute tokens
    pub required_creator: Address,

    /// Distribution recipients, in transfer order
    #[serde(default = "default_recipients")]
    pub recipients: Vec<Address>,

    #[serde(default = "default_decimals")]
    pub token_decimals: u8,

    /// Upper bound on any single ledger call
    #[serde(default = "default_ledger_timeout_secs")]
    pub ledger_timeout_secs: u64,

    /// Accept a ledger client that only simulates transactions
    #[serde(default)]
    pub allow_simulated: bool,

    /// Record store retries, see `GovernanceService::from_config`
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Store retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
        )
    }
}

fn default_recipients() -> Vec<Address> {
    DEFAULT_DISTRIBUTION_WALLETS
        .iter()
        .map(|wallet| Address::new(*wallet))
        .collect()
}

fn default_decimals() -> u8 {
    DEFAULT_TOKEN_DECIMALS
}

fn default_ledger_timeout_secs() -> u64 {
    DEFAULT_LEDGER_TIMEOUT_SECS
}

fn default_max_attempts() -> u32 {
    crate::persistence::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    crate::persistence::DEFAULT_INITIAL_BACKOFF.as_millis() as u64
}

impl OrchestratorConfig {
    /// Defaults for everything except the required creator.
    pub fn new(required_creator: impl Into<Address>) -> Self {
        Self {
            required_creator: required_creator.into(),
            recipients: default_recipients(),
            token_decimals: default_decimals(),
            ledger_timeout_secs: default_ledger_timeout_secs(),
            allow_simulated: false,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_recipients(mut self, recipients: Vec<Address>) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn allowing_simulated(mut self) -> Self {
        self.allow_simulated = true;
        self
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.required_creator.is_empty() {
            return Err(ConfigError::Invalid("required_creator must be set".into()));
        }
        if self.ledger_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "ledger_timeout_secs must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATOR: &str = "0x0000000000000000000000000000000000000000000000000000000000000abc";

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::new(CREATOR);
        assert_eq!(config.recipients.len(), 4);
        assert_eq!(config.token_decimals, 6);
        assert_eq!(config.ledger_timeout(), Duration::from_secs(60));
        assert!(!config.allow_simulated);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.policy().delay_after(1), Duration::from_millis(200));
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config =
            OrchestratorConfig::from_toml_str(&format!("required_creator = \"{CREATOR}\"")).unwrap();
        assert_eq!(config, OrchestratorConfig::new(CREATOR));
    }

    #[test]
    fn test_toml_overrides() {
        let toml = format!(
            r#"
            required_creator = "{CREATOR}"
            recipients = ["0x1", "0x2"]
            ledger_timeout_secs = 5
            allow_simulated = true

            [retry]
            max_attempts = 5
            "#
        );
        let config = OrchestratorConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.recipients, vec![Address::new("0x1"), Address::new("0x2")]);
        assert_eq!(config.ledger_timeout_secs, 5);
        assert!(config.allow_simulated);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 200);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            OrchestratorConfig::from_toml_str("required_creator = \"\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            OrchestratorConfig::from_toml_str("recipients = []"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_config() {
        assert!(matches!(
            OrchestratorConfig::load("/nonexistent/path/daoship.toml"),
            Err(ConfigError::NotFound(_))
        ));
    }
}
