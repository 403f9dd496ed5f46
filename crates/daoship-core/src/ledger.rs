use crate::error::{LedgerCallError, LedgerError};
use crate::types::{
    Address, Confirmation, ExecutionMode, FundingStatus, TokenConfig, TokenCreation, TxReference,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// External ledger capability.
///
/// Implementations submit and confirm transactions; execution and consensus
/// are the ledger's business. None of these calls are safe to retry blindly.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Whether references produced by this client are real or simulated.
    fn execution_mode(&self) -> ExecutionMode;

    /// Idempotent: reports `AlreadyFunded` without side effects when possible.
    async fn ensure_funded(&self, address: &Address) -> Result<FundingStatus, LedgerError>;

    async fn create_token(&self, config: &TokenConfig) -> Result<TokenCreation, LedgerError>;

    /// Make every address able to hold `asset_reference`.
    async fn register_recipients(
        &self,
        asset_reference: &str,
        addresses: &[Address],
    ) -> Result<(), LedgerError>;

    async fn transfer(
        &self,
        asset_reference: &str,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<TxReference, LedgerError>;

    async fn wait_for_confirmation(&self, tx: &TxReference) -> Result<Confirmation, LedgerError>;
}

#[async_trait]
impl<L: LedgerClient + ?Sized> LedgerClient for Arc<L> {
    fn execution_mode(&self) -> ExecutionMode {
        (**self).execution_mode()
    }

    async fn ensure_funded(&self, address: &Address) -> Result<FundingStatus, LedgerError> {
        (**self).ensure_funded(address).await
    }

    async fn create_token(&self, config: &TokenConfig) -> Result<TokenCreation, LedgerError> {
        (**self).create_token(config).await
    }

    async fn register_recipients(
        &self,
        asset_reference: &str,
        addresses: &[Address],
    ) -> Result<(), LedgerError> {
        (**self).register_recipients(asset_reference, addresses).await
    }

    async fn transfer(
        &self,
        asset_reference: &str,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<TxReference, LedgerError> {
        (**self).transfer(asset_reference, from, to, amount).await
    }

    async fn wait_for_confirmation(&self, tx: &TxReference) -> Result<Confirmation, LedgerError> {
        (**self).wait_for_confirmation(tx).await
    }
}

/// Ledger client wrapper that bounds every call with a timeout and
/// classifies failures as rejected, unconfirmed, or timed out.
pub struct BoundedLedger<'a> {
    client: &'a dyn LedgerClient,
    timeout: Duration,
}

impl<'a> BoundedLedger<'a> {
    pub fn new(client: &'a dyn LedgerClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.client.execution_mode()
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerCallError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(LedgerCallError::Rejected { operation, source }),
            Err(_) => {
                tracing::warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Ledger call timed out"
                );
                Err(LedgerCallError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }

    pub async fn ensure_funded(&self, address: &Address) -> Result<FundingStatus, LedgerCallError> {
        self.bounded("ensure_funded", self.client.ensure_funded(address))
            .await
    }

    pub async fn create_token(&self, config: &TokenConfig) -> Result<TokenCreation, LedgerCallError> {
        self.bounded("create_token", self.client.create_token(config))
            .await
    }

    pub async fn register_recipients(
        &self,
        asset_reference: &str,
        addresses: &[Address],
    ) -> Result<(), LedgerCallError> {
        self.bounded(
            "register_recipients",
            self.client.register_recipients(asset_reference, addresses),
        )
        .await
    }

    pub async fn transfer(
        &self,
        asset_reference: &str,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<TxReference, LedgerCallError> {
        self.bounded(
            "transfer",
            self.client.transfer(asset_reference, from, to, amount),
        )
        .await
    }

    /// Wait for `tx` and turn an unsuccessful confirmation into an error.
    pub async fn confirm(&self, tx: &TxReference) -> Result<Confirmation, LedgerCallError> {
        let confirmation = self
            .bounded("wait_for_confirmation", self.client.wait_for_confirmation(tx))
            .await?;
        if !confirmation.success {
            return Err(LedgerCallError::NotConfirmed {
                tx_reference: tx.hash.clone(),
                detail: confirmation.detail,
            });
        }
        Ok(confirmation)
    }
}
