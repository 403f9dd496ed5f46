use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally-held account address (hex, `0x`-prefixed on Aptos-style ledgers).
///
/// Addresses compare case-insensitively: wallets and explorers disagree on casing.
#[derive(Debug, Clone, Serialize, Deserialize, Eq)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased form, used as a key wherever identity matters.
    pub fn canonical(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn short(&self) -> String {
        self.0.chars().take(10).collect()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Address {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Whether a ledger reference came from a real network or a simulation.
///
/// Every ledger-originated reference carries its mode so simulated and live
/// outcomes can never be merged into one success path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Live,
    Simulated,
}

impl ExecutionMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Simulated => "simulated",
        }
    }
}

/// Token creation parameters passed to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenConfig {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: u64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_uri: Option<String>,
}

/// Ledger transaction reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TxReference {
    pub hash: String,
    pub mode: ExecutionMode,
}

impl fmt::Display for TxReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ExecutionMode::Live => write!(f, "{}", self.hash),
            ExecutionMode::Simulated => write!(f, "{} (simulated)", self.hash),
        }
    }
}

/// Result of a submitted token creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCreation {
    pub asset_reference: String,
    pub tx_reference: TxReference,
}

/// Confirmed token reference returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenReference {
    pub asset_reference: String,
    pub creation_tx: TxReference,
    pub symbol: String,
    pub total_supply: u64,
    pub decimals: u8,
}

impl TokenReference {
    pub fn mode(&self) -> ExecutionMode {
        self.creation_tx.mode
    }
}

/// Outcome of waiting for a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Confirmation {
    pub success: bool,
    pub detail: String,
}

/// Whether a funding request had to do anything.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FundingStatus {
    AlreadyFunded,
    Funded,
}
