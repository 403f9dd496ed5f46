//! Document store access with bounded local retries.
//!
//! Only idempotent operations (reads and merge-writes) go through the retry
//! combinator. Ledger mutations never do: without an idempotency key a
//! retried transfer is a second transfer.

use crate::error::{PersistenceError, StoreError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Write semantics for [`RecordStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Merge top-level fields into an existing record instead of replacing it.
    pub merge: bool,
}

impl MergeOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }

    pub fn replace() -> Self {
        Self { merge: false }
    }
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::merge()
    }
}

/// Backing document store, accessed by key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, key: &str, record: Value, options: MergeOptions) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, record: Value, options: MergeOptions) -> Result<(), StoreError> {
        (**self).put(key, record, options).await
    }
}

/// The operations the retry combinator accepts. There is deliberately no
/// variant for ledger calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotentOp {
    Read,
    MergeWrite,
}

impl IdempotentOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::MergeWrite => "merge_write",
        }
    }
}

type BackoffFn = dyn Fn(u32) -> Duration + Send + Sync;

/// Maximum attempts plus the delay before each retry.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Arc<BackoffFn>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("first_backoff", &(self.backoff)(1))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_ATTEMPTS, DEFAULT_INITIAL_BACKOFF)
    }
}

impl RetryPolicy {
    /// `backoff(n)` is the delay after the n-th failed attempt (1-based).
    pub fn new(
        max_attempts: u32,
        backoff: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
        }
    }

    /// Doubling backoff starting at `initial`.
    pub fn exponential(max_attempts: u32, initial: Duration) -> Self {
        Self::new(max_attempts, move |failed| {
            initial.saturating_mul(1u32 << failed.saturating_sub(1).min(16))
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        (self.backoff)(failed_attempt)
    }
}

/// Run an idempotent store operation, retrying transient failures.
pub async fn retry_idempotent<T, F, Fut>(
    policy: &RetryPolicy,
    kind: IdempotentOp,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => {
                return Err(PersistenceError::Permanent {
                    operation: operation.to_string(),
                    source: err,
                });
            }
            Err(err) if attempt >= policy.max_attempts() => {
                tracing::warn!(
                    operation,
                    kind = kind.name(),
                    attempts = attempt,
                    error = %err,
                    "Store operation exhausted retries"
                );
                return Err(PersistenceError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: err,
                });
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(
                    operation,
                    kind = kind.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying store operation"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Store wrapper that applies [`retry_idempotent`] to every access.
#[derive(Debug, Clone)]
pub struct ResilientStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: RecordStore> ResilientStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        retry_idempotent(&self.policy, IdempotentOp::Read, &format!("get {key}"), || {
            self.inner.get(key)
        })
        .await
    }

    pub async fn put(
        &self,
        key: &str,
        record: Value,
        options: MergeOptions,
    ) -> Result<(), PersistenceError> {
        retry_idempotent(
            &self.policy,
            IdempotentOp::MergeWrite,
            &format!("put {key}"),
            || self.inner.put(key, record.clone(), options),
        )
        .await
    }

    pub async fn get_record<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, PersistenceError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| PersistenceError::Permanent {
                    operation: format!("decode {key}"),
                    source: StoreError::Serialization(e.to_string()),
                }),
        }
    }

    pub async fn put_record<T: Serialize>(
        &self,
        key: &str,
        record: &T,
        options: MergeOptions,
    ) -> Result<(), PersistenceError> {
        let value = serde_json::to_value(record).map_err(|e| PersistenceError::Permanent {
            operation: format!("encode {key}"),
            source: StoreError::Serialization(e.to_string()),
        })?;
        self.put(key, value, options).await
    }
}
