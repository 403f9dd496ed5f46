//! DAOShip workflow core.
//!
//! Guards and sequences the privileged operations of a DAO platform:
//! signed-intent validation for governance records, a required-identity gate
//! for token operations, a deterministic distribution calculator, a
//! sequential step engine with observable progress, and the token creation
//! and distribution orchestrator built on top of them.
//!
//! Ledger, wallet and document store access are consumed through async
//! traits ([`LedgerClient`], [`WalletConnector`], [`RecordStore`]); this
//! crate never talks to a network itself.

#![deny(unsafe_code)]

pub mod config;
pub mod distribution;
pub mod envelope;
pub mod error;
pub mod governance;
pub mod identity;
pub mod ledger;
pub mod orchestrator;
pub mod persistence;
pub mod types;
pub mod workflow;

pub use config::{OrchestratorConfig, RetryConfig, DEFAULT_DISTRIBUTION_WALLETS};
pub use distribution::{DistributionEntry, DistributionPlan, DistributionResult, RemainderHolder};
pub use envelope::{
    ActionEnvelope, ActionKind, ActionPayload, Ed25519SignatureVerifier, EnvelopeCheckError,
    EnvelopeValidator, SignatureVerifier, SignedEnvelope, VoteChoice, DEFAULT_MAX_AGE_SECS,
};
pub use error::{
    ConfigError, EnvelopeError, GovernanceError, IdentityError, LedgerCallError, LedgerError,
    OrchestrationError, PersistenceError, PlanError, SignatureError, StoreError, WorkflowError,
};
pub use governance::{
    CastVoteRequest, CreateDaoRequest, CreateProposalRequest, DaoRecord, DaoTokenRecord,
    ExecuteProposalRequest, GovernanceService, ProposalRecord, ProposalStatus,
    TokenDistributionStatus, VoteRecord,
};
pub use identity::{IdentityCheck, IdentityGate, WalletConnector, WalletError, WalletSession};
pub use ledger::{BoundedLedger, LedgerClient};
pub use orchestrator::{
    token_workflow_steps, RecoveryClass, TokenCreationOutcome, TokenCreationParams,
    TokenDistributionOrchestrator,
};
pub use persistence::{
    retry_idempotent, IdempotentOp, MergeOptions, RecordStore, ResilientStore, RetryPolicy,
};
pub use types::{
    Address, Confirmation, ExecutionMode, FundingStatus, TokenConfig, TokenCreation,
    TokenReference, TxReference,
};
pub use workflow::{
    RunToken, SnapshotStream, StepCause, StepDefinition, StepEngine, StepReport, StepRunError,
    StepStatus, WorkflowId, WorkflowSnapshot, WorkflowState, WorkflowStep, ABANDONED_DETAIL,
};
