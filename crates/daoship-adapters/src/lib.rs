//! Reference adapters for DAOShip.
//!
//! Deterministic, in-process implementations of the store, ledger and wallet
//! seams. Useful for local development and for exercising the workflows
//! end to end without a network.

#![deny(unsafe_code)]

use async_trait::async_trait;
use daoship_core::envelope::{ActionEnvelope, SignedEnvelope};
use daoship_core::error::{LedgerError, StoreError};
use daoship_core::identity::{WalletConnector, WalletError};
use daoship_core::ledger::LedgerClient;
use daoship_core::persistence::{MergeOptions, RecordStore};
use daoship_core::types::{
    Address, Confirmation, ExecutionMode, FundingStatus, TokenConfig, TokenCreation, TxReference,
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Record store ─────────────────────────────────────────────────────

/// Document store kept in memory, with injectable transient failures.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, Value>>,
    transient_failures: AtomicU32,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn record(&self, key: &str) -> Option<Value> {
        lock(&self.records).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected transient failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.take_failure()?;
        Ok(self.record(key))
    }

    async fn put(&self, key: &str, record: Value, options: MergeOptions) -> Result<(), StoreError> {
        self.take_failure()?;
        let mut records = lock(&self.records);
        if options.merge {
            if let Some(Value::Object(existing)) = records.get_mut(key) {
                if let Value::Object(incoming) = record {
                    existing.extend(incoming);
                    return Ok(());
                }
            }
        }
        records.insert(key.to_string(), record);
        Ok(())
    }
}

// ── Simulated ledger ─────────────────────────────────────────────────

/// A transfer the simulated ledger accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedTransfer {
    pub asset_reference: String,
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    pub tx: TxReference,
}

#[derive(Debug, Default)]
struct LedgerState {
    nonce: u64,
    funded: HashSet<String>,
    /// Asset reference to remaining undistributed supply.
    supply: HashMap<String, u64>,
    registered: HashMap<String, HashSet<String>>,
    transfers: Vec<SimulatedTransfer>,
    known_txs: HashSet<String>,
    unconfirmed_txs: HashSet<String>,
}

impl LedgerState {
    fn reference(&mut self, kind: &str, detail: &str) -> String {
        self.nonce += 1;
        let hash = blake3::hash(format!("{kind}:{}:{detail}", self.nonce).as_bytes());
        format!("0x{}", hash.to_hex())
    }

    fn tx(&mut self, kind: &str, detail: &str) -> TxReference {
        let hash = self.reference(kind, detail);
        self.known_txs.insert(hash.clone());
        TxReference {
            hash,
            mode: ExecutionMode::Simulated,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Faults {
    fail_creation: bool,
    hang_creation: bool,
    fail_registration: bool,
    fail_transfer_to: HashSet<String>,
    unconfirmed_transfer_to: HashSet<String>,
    latency: Option<Duration>,
}

/// Ledger that simulates every transaction locally.
///
/// All references are deterministic per call order and tagged
/// [`ExecutionMode::Simulated`].
#[derive(Debug, Default)]
pub struct SimulatedLedger {
    state: Mutex<LedgerState>,
    faults: Faults,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_token_creation(mut self) -> Self {
        self.faults.fail_creation = true;
        self
    }

    /// Token creation never returns; pair with a bounded ledger timeout.
    pub fn hanging_token_creation(mut self) -> Self {
        self.faults.hang_creation = true;
        self
    }

    pub fn failing_registration(mut self) -> Self {
        self.faults.fail_registration = true;
        self
    }

    pub fn failing_transfer_to(mut self, recipient: &Address) -> Self {
        self.faults.fail_transfer_to.insert(recipient.canonical());
        self
    }

    /// Transfers to `recipient` are submitted but never confirm successfully.
    pub fn unconfirmed_transfer_to(mut self, recipient: &Address) -> Self {
        self.faults
            .unconfirmed_transfer_to
            .insert(recipient.canonical());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.faults.latency = Some(latency);
        self
    }

    pub fn transfers(&self) -> Vec<SimulatedTransfer> {
        lock(&self.state).transfers.clone()
    }

    pub fn is_registered(&self, asset_reference: &str, address: &Address) -> bool {
        lock(&self.state)
            .registered
            .get(asset_reference)
            .is_some_and(|holders| holders.contains(&address.canonical()))
    }

    pub fn token_count(&self) -> usize {
        lock(&self.state).supply.len()
    }

    async fn delay(&self) {
        if let Some(latency) = self.faults.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Simulated
    }

    async fn ensure_funded(&self, address: &Address) -> Result<FundingStatus, LedgerError> {
        self.delay().await;
        let newly_funded = lock(&self.state).funded.insert(address.canonical());
        if newly_funded {
            tracing::debug!(address = %address.short(), "Simulated faucet funding");
            Ok(FundingStatus::Funded)
        } else {
            Ok(FundingStatus::AlreadyFunded)
        }
    }

    async fn create_token(&self, config: &TokenConfig) -> Result<TokenCreation, LedgerError> {
        self.delay().await;
        if self.faults.hang_creation {
            std::future::pending::<()>().await;
        }
        if self.faults.fail_creation {
            return Err(
                LedgerError::new("simulated token creation failure").with_code("E_CREATE"),
            );
        }

        let mut state = lock(&self.state);
        let asset_reference = state.reference("asset", &config.symbol);
        let tx_reference = state.tx("create", &asset_reference);
        state
            .supply
            .insert(asset_reference.clone(), config.total_supply);
        tracing::debug!(asset = %asset_reference, symbol = %config.symbol, "Simulated token created");

        Ok(TokenCreation {
            asset_reference,
            tx_reference,
        })
    }

    async fn register_recipients(
        &self,
        asset_reference: &str,
        addresses: &[Address],
    ) -> Result<(), LedgerError> {
        self.delay().await;
        if self.faults.fail_registration {
            return Err(
                LedgerError::new("simulated registration failure").with_code("E_REGISTER"),
            );
        }

        let mut state = lock(&self.state);
        if !state.supply.contains_key(asset_reference) {
            return Err(LedgerError::new(format!("unknown asset {asset_reference}")));
        }
        state
            .registered
            .entry(asset_reference.to_string())
            .or_default()
            .extend(addresses.iter().map(Address::canonical));
        Ok(())
    }

    async fn transfer(
        &self,
        asset_reference: &str,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<TxReference, LedgerError> {
        self.delay().await;
        if self.faults.fail_transfer_to.contains(&to.canonical()) {
            return Err(LedgerError::new(format!("simulated transfer failure to {to}"))
                .with_code("E_TRANSFER"));
        }

        let mut state = lock(&self.state);
        let registered = state
            .registered
            .get(asset_reference)
            .is_some_and(|holders| holders.contains(&to.canonical()));
        if !registered {
            return Err(LedgerError::new(format!("{to} is not registered for {asset_reference}"))
                .with_code("E_NOT_REGISTERED"));
        }
        let remaining = state
            .supply
            .get_mut(asset_reference)
            .ok_or_else(|| LedgerError::new(format!("unknown asset {asset_reference}")))?;
        *remaining = remaining
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::new("insufficient balance").with_code("E_BALANCE"))?;

        let tx = state.tx("transfer", &format!("{asset_reference}:{to}:{amount}"));
        if self.faults.unconfirmed_transfer_to.contains(&to.canonical()) {
            state.unconfirmed_txs.insert(tx.hash.clone());
        }
        state.transfers.push(SimulatedTransfer {
            asset_reference: asset_reference.to_string(),
            from: from.clone(),
            to: to.clone(),
            amount,
            tx: tx.clone(),
        });
        Ok(tx)
    }

    async fn wait_for_confirmation(&self, tx: &TxReference) -> Result<Confirmation, LedgerError> {
        self.delay().await;
        let state = lock(&self.state);
        if !state.known_txs.contains(&tx.hash) {
            return Err(LedgerError::new(format!("unknown transaction {}", tx.hash)));
        }
        if state.unconfirmed_txs.contains(&tx.hash) {
            return Ok(Confirmation {
                success: false,
                detail: "simulated: transaction aborted".into(),
            });
        }
        Ok(Confirmation {
            success: true,
            detail: "simulated: executed".into(),
        })
    }
}

// ── Wallet ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct WalletState {
    account: Address,
    connected: bool,
}

/// Wallet holding one Ed25519 key for a fixed account.
#[derive(Debug)]
pub struct StaticWallet {
    signing_key: SigningKey,
    state: Mutex<WalletState>,
    refuse: bool,
}

impl StaticWallet {
    pub fn new(account: Address, signing_key: SigningKey) -> Self {
        Self {
            signing_key,
            state: Mutex::new(WalletState {
                account,
                connected: false,
            }),
            refuse: false,
        }
    }

    pub fn from_seed(account: impl Into<Address>, seed: [u8; 32]) -> Self {
        Self::new(account.into(), SigningKey::from_bytes(&seed))
    }

    /// A wallet whose user declines every connection request.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn account(&self) -> Address {
        lock(&self.state).account.clone()
    }

    /// Simulate the user switching accounts in their wallet.
    pub fn switch_account(&self, account: Address) {
        lock(&self.state).account = account;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Sign the canonical message for `envelope`.
    pub async fn sign_envelope(
        &self,
        envelope: &ActionEnvelope,
    ) -> Result<SignedEnvelope, WalletError> {
        let message = envelope
            .to_message()
            .map_err(|e| WalletError::Signing(e.to_string()))?;
        let signature = self.sign_message(&message).await?;
        Ok(SignedEnvelope::new(message, signature))
    }
}

#[async_trait]
impl WalletConnector for StaticWallet {
    async fn connect(&self) -> Result<Address, WalletError> {
        if self.refuse {
            return Err(WalletError::Refused("user rejected the connection".into()));
        }
        let mut state = lock(&self.state);
        state.connected = true;
        Ok(state.account.clone())
    }

    async fn sign_message(&self, message: &str) -> Result<String, WalletError> {
        if !self.is_connected() {
            return Err(WalletError::Unavailable("wallet is not connected".into()));
        }
        let signature = self.signing_key.sign(message.as_bytes());
        Ok(hex::encode(signature.to_bytes()))
    }

    async fn connected_address(&self) -> Option<Address> {
        let state = lock(&self.state);
        state.connected.then(|| state.account.clone())
    }

    async fn disconnect(&self) -> Result<(), WalletError> {
        lock(&self.state).connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token(symbol: &str, supply: u64) -> TokenConfig {
        TokenConfig {
            name: format!("{symbol} token"),
            symbol: symbol.to_string(),
            decimals: 6,
            total_supply: supply,
            description: String::new(),
            icon_uri: None,
            project_uri: None,
        }
    }

    #[tokio::test]
    async fn store_merges_top_level_fields() {
        let store = InMemoryRecordStore::new();
        store
            .put("daos/1", json!({"name": "a", "quorum": 1}), MergeOptions::replace())
            .await
            .unwrap();
        store
            .put("daos/1", json!({"quorum": 2}), MergeOptions::merge())
            .await
            .unwrap();
        assert_eq!(
            store.get("daos/1").await.unwrap(),
            Some(json!({"name": "a", "quorum": 2}))
        );

        store
            .put("daos/1", json!({"quorum": 3}), MergeOptions::replace())
            .await
            .unwrap();
        assert_eq!(store.record("daos/1"), Some(json!({"quorum": 3})));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = InMemoryRecordStore::new();
        store.fail_next(1);
        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn funding_is_idempotent() {
        let ledger = SimulatedLedger::new();
        let who = Address::new("0xabc");
        assert_eq!(ledger.ensure_funded(&who).await.unwrap(), FundingStatus::Funded);
        assert_eq!(
            ledger.ensure_funded(&Address::new("0xABC")).await.unwrap(),
            FundingStatus::AlreadyFunded
        );
    }

    #[tokio::test]
    async fn transfers_require_registration_and_supply() {
        let ledger = SimulatedLedger::new();
        let from = Address::new("0xf00");
        let to = Address::new("0xb0b");
        let created = ledger.create_token(&token("BLD", 100)).await.unwrap();
        assert_eq!(created.tx_reference.mode, ExecutionMode::Simulated);

        let err = ledger
            .transfer(&created.asset_reference, &from, &to, 10)
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("E_NOT_REGISTERED"));

        ledger
            .register_recipients(&created.asset_reference, &[to.clone()])
            .await
            .unwrap();
        let tx = ledger
            .transfer(&created.asset_reference, &from, &to, 60)
            .await
            .unwrap();
        assert!(ledger.wait_for_confirmation(&tx).await.unwrap().success);

        let err = ledger
            .transfer(&created.asset_reference, &from, &to, 60)
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("E_BALANCE"));
    }

    #[tokio::test]
    async fn references_are_distinct_per_call() {
        let ledger = SimulatedLedger::new();
        let a = ledger.create_token(&token("AAA", 1)).await.unwrap();
        let b = ledger.create_token(&token("AAA", 1)).await.unwrap();
        assert_ne!(a.asset_reference, b.asset_reference);
        assert_ne!(a.tx_reference, b.tx_reference);
        assert_eq!(ledger.token_count(), 2);
    }

    #[tokio::test]
    async fn wallet_signs_only_while_connected() {
        let wallet = StaticWallet::from_seed("0xabc", [3; 32]);
        assert!(wallet.sign_message("hi").await.is_err());
        assert_eq!(wallet.connected_address().await, None);

        wallet.connect().await.unwrap();
        let signature = wallet.sign_message("hi").await.unwrap();
        assert_eq!(signature.len(), 128);

        wallet.disconnect().await.unwrap();
        assert!(!wallet.is_connected());
    }
}
