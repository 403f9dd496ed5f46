//! Required-identity gate and per-call wallet sessions.

use crate::error::IdentityError;
use crate::types::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of comparing the connected wallet against the required identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCheck {
    pub required: Address,
    pub connected: Option<Address>,
    pub authorized: bool,
    #[serde(skip)]
    pub reason: Option<IdentityError>,
}

impl IdentityCheck {
    pub fn into_result(self) -> Result<Address, IdentityError> {
        match (self.reason, self.connected) {
            (Some(reason), _) => Err(reason),
            (None, Some(connected)) => Ok(connected),
            (None, None) => Err(IdentityError::NotConnected),
        }
    }
}

/// Gate that privileged operations must pass. Stateless: nothing is cached
/// between attempts, so a past success never vouches for the current wallet.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityGate;

impl IdentityGate {
    pub fn check(required: &Address, connected: Option<&Address>) -> IdentityCheck {
        let reason = match connected {
            None => Some(IdentityError::NotConnected),
            Some(address) if address.is_empty() => Some(IdentityError::NotConnected),
            Some(address) if required.matches(address.as_str()) => None,
            Some(address) => Some(IdentityError::WrongIdentity {
                required: required.to_string(),
                connected: address.to_string(),
            }),
        };

        IdentityCheck {
            required: required.clone(),
            connected: connected.cloned(),
            authorized: reason.is_none(),
            reason,
        }
    }

    /// Re-query the connector and require the connected address to match.
    pub async fn require(
        required: &Address,
        wallet: &dyn WalletConnector,
    ) -> Result<Address, IdentityError> {
        let connected = wallet.connected_address().await;
        let check = Self::check(required, connected.as_ref());
        if let Some(reason) = &check.reason {
            tracing::warn!(
                required = %required,
                connected = ?check.connected.as_ref().map(Address::short),
                %reason,
                "Identity gate rejected actor"
            );
        }
        check.into_result()
    }
}

/// Wallet capability consumed by the workflow layer.
#[async_trait]
pub trait WalletConnector: Send + Sync {
    /// Prompt or re-use a connection and return the active address.
    async fn connect(&self) -> Result<Address, WalletError>;

    async fn sign_message(&self, message: &str) -> Result<String, WalletError>;

    async fn connected_address(&self) -> Option<Address>;

    async fn disconnect(&self) -> Result<(), WalletError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("wallet connection refused: {0}")]
    Refused(String),

    #[error("wallet unavailable: {0}")]
    Unavailable(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Explicit `connect -> use -> close` scope over a wallet connector.
///
/// One session per orchestrator call; sessions are never shared between
/// callers, so concurrent invocations cannot observe each other's wallet.
pub struct WalletSession<'a> {
    wallet: &'a dyn WalletConnector,
    required: Address,
    address: Option<Address>,
}

impl<'a> WalletSession<'a> {
    pub fn new(wallet: &'a dyn WalletConnector, required: Address) -> Self {
        Self {
            wallet,
            required,
            address: None,
        }
    }

    /// Connect and pass the identity gate.
    pub async fn open(&mut self) -> Result<Address, IdentityError> {
        if let Err(err) = self.wallet.connect().await {
            tracing::warn!(error = %err, "Wallet connection failed");
            return Err(IdentityError::NotConnected);
        }
        let address = IdentityGate::require(&self.required, self.wallet).await?;
        self.address = Some(address.clone());
        Ok(address)
    }

    /// Re-check the gate before a privileged call.
    pub async fn reauthorize(&self) -> Result<Address, IdentityError> {
        IdentityGate::require(&self.required, self.wallet).await
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub async fn close(self) {
        if let Err(err) = self.wallet.disconnect().await {
            tracing::warn!(error = %err, "Wallet disconnect failed");
        }
    }
}
