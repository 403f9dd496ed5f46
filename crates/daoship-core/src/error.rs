use std::time::Duration;
use thiserror::Error;

use crate::workflow::WorkflowState;

/// Content or freshness problems with a client-supplied signed envelope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("action mismatch: expected '{expected}', got '{actual}'")]
    ActionMismatch { expected: String, actual: String },

    #[error("payload field '{field}' does not match the requested mutation")]
    PayloadMismatch { field: String },

    #[error("envelope expired: issued {age_secs}s ago, limit {limit_secs}s")]
    Expired { age_secs: i64, limit_secs: i64 },

    #[error("envelope issued {ahead_secs}s in the future, limit {limit_secs}s")]
    NotYetValid { ahead_secs: i64, limit_secs: i64 },
}

/// Signature authenticity failures, checked separately from envelope content.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no verifying key registered for signer '{0}'")]
    UnknownSigner(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature does not verify for signer '{0}'")]
    InvalidSignature(String),
}

/// Required-identity gate failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no wallet connected")]
    NotConnected,

    #[error("connected wallet '{connected}' is not the required identity '{required}'")]
    WrongIdentity { required: String, connected: String },
}

/// Distribution plan validation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("recipient set is empty")]
    EmptyRecipientSet,

    #[error("total amount must be positive")]
    NonPositiveAmount,

    #[error("recipient '{0}' appears more than once")]
    DuplicateRecipient(String),

    #[error("remainder holder '{0}' is not a recipient")]
    UnknownRemainderHolder(String),
}

/// Workflow engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("step '{step_id}' failed: {cause}")]
    StepFailed { step_id: String, cause: String },

    #[error("step '{step_id}' timed out after {after:?}")]
    Timeout { step_id: String, after: Duration },

    #[error("workflow aborted: {reason}")]
    Aborted { reason: String },

    #[error("generation {stale} was superseded by generation {current}")]
    Superseded { stale: u64, current: u64 },

    #[error("step '{requested}' is not next; expected {expected:?}")]
    OutOfOrder {
        requested: String,
        expected: Option<String>,
    },

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("workflow is not in progress (state: {0:?})")]
    NotInProgress(WorkflowState),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
}

/// Opaque error reported by the external ledger client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("ledger error: {message}")]
pub struct LedgerError {
    pub message: String,
    pub code: Option<String>,
}

impl LedgerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A ledger call as observed by the workflow: rejected, unconfirmed, or timed out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerCallError {
    #[error("ledger rejected {operation}: {source}")]
    Rejected {
        operation: &'static str,
        #[source]
        source: LedgerError,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("transaction {tx_reference} was not confirmed: {detail}")]
    NotConfirmed { tx_reference: String, detail: String },
}

impl LedgerCallError {
    /// Whether the ledger may have applied the operation despite the error.
    pub fn may_have_applied(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected write: {0}")]
    Rejected(String),

    #[error("record serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Transient errors are the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Store operation failure after local retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: StoreError,
    },

    #[error("{operation} failed permanently: {source}")]
    Permanent {
        operation: String,
        #[source]
        source: StoreError,
    },
}

/// Governance record service errors.
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("proposal '{0}' is not active")]
    ProposalInactive(String),

    #[error("'{voter}' has already voted on proposal '{proposal_id}'")]
    AlreadyVoted { proposal_id: String, voter: String },

    #[error("'{member}' is already a member of DAO '{dao_id}'")]
    AlreadyMember { dao_id: String, member: String },

    #[error("only passed proposals can be executed; '{0}' has not passed")]
    ProposalNotPassed(String),

    #[error("'{actor}' may not manage the token of DAO '{dao_id}'")]
    Unauthorized { actor: String, dao_id: String },

    #[error("DAO '{dao_id}' already has a governance token")]
    TokenAlreadyRecorded {
        dao_id: String,
        asset_reference: Option<String>,
    },

    /// The ledger work happened but the DAO record could not be updated.
    #[error("token {asset_reference:?} for DAO '{dao_id}' was not recorded: {source}")]
    TokenNotRecorded {
        dao_id: String,
        asset_reference: Option<String>,
        #[source]
        source: Box<GovernanceError>,
    },

    #[error("stored record is corrupt: {0}")]
    CorruptRecord(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file '{0}' not found")]
    NotFound(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a token orchestration did not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("invalid token parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("ledger client only simulates transactions and allow_simulated is not set")]
    SimulatedLedgerRefused,

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}
