//! Token creation and initial distribution.
//!
//! One invocation drives a fixed five-step workflow:
//!
//! 1. `connect-wallet`: open a wallet session and pass the identity gate.
//! 2. `check-funding`: make sure the creator can pay fees (idempotent).
//! 3. `create-token`: create the asset and wait for its confirmation.
//! 4. `register-assets`: let every recipient hold the asset. Fails closed:
//!    no transfer is attempted unless every recipient is registered.
//! 5. `distribute-tokens`: transfer the per-recipient amount to each
//!    recipient, best effort, recording one entry per recipient.
//!
//! Nothing is persisted across restarts, so a re-invocation after the token
//! was created creates a second token. [`RecoveryClass`] on the outcome tells
//! callers whether a retry is safe, and
//! [`GovernanceService::create_dao_token`](crate::governance::GovernanceService::create_dao_token)
//! records the outcome on the DAO so a second token is refused.

use crate::config::OrchestratorConfig;
use crate::distribution::{DistributionPlan, DistributionResult};
use crate::error::{ConfigError, IdentityError, LedgerCallError, OrchestrationError};
use crate::identity::{WalletConnector, WalletSession};
use crate::ledger::{BoundedLedger, LedgerClient};
use crate::types::{
    Address, ExecutionMode, FundingStatus, TokenConfig, TokenCreation, TokenReference,
};
use crate::workflow::{
    RunToken, SnapshotStream, StepCause, StepDefinition, StepEngine, StepReport, StepRunError,
    WorkflowSnapshot, WorkflowState,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const STEP_CONNECT_WALLET: &str = "connect-wallet";
pub const STEP_CHECK_FUNDING: &str = "check-funding";
pub const STEP_CREATE_TOKEN: &str = "create-token";
pub const STEP_REGISTER_ASSETS: &str = "register-assets";
pub const STEP_DISTRIBUTE_TOKENS: &str = "distribute-tokens";

/// The five steps of a token workflow, in execution order.
pub fn token_workflow_steps() -> Vec<StepDefinition> {
    vec![
        StepDefinition::new(STEP_CONNECT_WALLET, "Connect wallet")
            .with_description("Connect the creator wallet and verify its identity"),
        StepDefinition::new(STEP_CHECK_FUNDING, "Check funding")
            .with_description("Make sure the creator account can pay ledger fees"),
        StepDefinition::new(STEP_CREATE_TOKEN, "Create token")
            .with_description("Create the governance token on the ledger"),
        StepDefinition::new(STEP_REGISTER_ASSETS, "Register assets")
            .with_description("Allow every distribution recipient to hold the token"),
        StepDefinition::new(STEP_DISTRIBUTE_TOKENS, "Distribute tokens")
            .with_description("Transfer an equal share to each recipient"),
    ]
}

/// Caller-supplied token parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenCreationParams {
    pub dao_name: String,
    pub token_name: String,
    pub token_symbol: String,
    #[serde(default)]
    pub token_description: String,
    /// Supply in base units.
    pub initial_supply: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
}

impl TokenCreationParams {
    fn validate(&self) -> Result<(), OrchestrationError> {
        if self.token_name.trim().is_empty() {
            return Err(OrchestrationError::InvalidParams(
                "token name is required".into(),
            ));
        }
        if self.token_symbol.trim().is_empty() {
            return Err(OrchestrationError::InvalidParams(
                "token symbol is required".into(),
            ));
        }
        Ok(())
    }

    fn token_config(&self, decimals: u8) -> TokenConfig {
        let description = if self.token_description.trim().is_empty() {
            format!("Governance token for {}", self.dao_name)
        } else {
            self.token_description.clone()
        };
        TokenConfig {
            name: self.token_name.trim().to_string(),
            symbol: self.token_symbol.trim().to_uppercase(),
            decimals,
            total_supply: self.initial_supply,
            description,
            icon_uri: self.icon_url.clone(),
            project_uri: self.project_url.clone(),
        }
    }
}

/// What a caller may safely do after an invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryClass {
    /// No ledger state changed; retrying is safe.
    NothingHappened,
    /// A ledger mutation may have been applied; retrying may duplicate it.
    LedgerActionPossiblyOccurred,
    /// The token exists and some recipients did not receive their share.
    PartiallyDistributed,
    /// The token exists and every recipient received their share.
    FullyDistributed,
}

impl RecoveryClass {
    pub fn is_safe_to_retry(self) -> bool {
        matches!(self, Self::NothingHappened)
    }
}

/// Result of one `create_and_distribute_token` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCreationOutcome {
    /// The workflow reached `completed`. Check `distribution` for per-recipient results.
    pub success: bool,
    pub token: Option<TokenReference>,
    /// Set as soon as the ledger accepted the creation, confirmed or not.
    /// Reconcile against it when `token` is missing.
    pub submitted_token: Option<TokenCreation>,
    pub distribution: Option<DistributionResult>,
    #[serde(skip)]
    pub error: Option<OrchestrationError>,
    pub recovery: RecoveryClass,
    pub execution_mode: ExecutionMode,
    pub final_snapshot: WorkflowSnapshot,
}

/// Step failures, before the engine folds them into a workflow error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
enum StepFailure {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Ledger(#[from] LedgerCallError),

    #[error("token creation {tx} submitted but not confirmed: {source}")]
    CreationUnconfirmed {
        tx: String,
        #[source]
        source: LedgerCallError,
    },
}

impl StepCause for StepFailure {
    fn timed_out(&self) -> Option<Duration> {
        match self {
            Self::Ledger(LedgerCallError::Timeout { after, .. })
            | Self::CreationUnconfirmed {
                source: LedgerCallError::Timeout { after, .. },
                ..
            } => Some(*after),
            _ => None,
        }
    }
}

impl StepReport for Address {
    fn result_ref(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl StepReport for FundingStatus {
    fn result_ref(&self) -> Option<String> {
        Some(
            match self {
                Self::AlreadyFunded => "already funded",
                Self::Funded => "funded",
            }
            .to_string(),
        )
    }
}

impl StepReport for TokenReference {
    fn result_ref(&self) -> Option<String> {
        Some(self.asset_reference.clone())
    }
}

impl StepReport for DistributionResult {
    fn result_ref(&self) -> Option<String> {
        Some(self.summary())
    }
}

/// Per-invocation facts gathered while the steps run.
#[derive(Debug, Default)]
struct RunProgress {
    submitted: Option<TokenCreation>,
    token: Option<TokenReference>,
    distribution: Option<DistributionResult>,
}

pub struct TokenDistributionOrchestrator {
    config: OrchestratorConfig,
    ledger: Arc<dyn LedgerClient>,
}

impl TokenDistributionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, ledger })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create the token and distribute it, returning once the workflow ends.
    pub async fn create_and_distribute_token(
        &self,
        params: TokenCreationParams,
        wallet: &dyn WalletConnector,
    ) -> TokenCreationOutcome {
        let engine = StepEngine::default();
        let plan = match self.prepare(&params) {
            Ok(plan) => plan,
            Err(err) => return self.refused(err, &engine),
        };
        let (token, _stream) = match engine.start(token_workflow_steps()) {
            Ok(started) => started,
            Err(err) => return self.refused(err.into(), &engine),
        };
        self.execute(engine, token, params, plan, wallet).await
    }

    /// Like [`Self::create_and_distribute_token`], but also returns the
    /// progress stream. The stream only advances while the future is polled.
    ///
    /// Parameters are validated before anything starts; invalid ones are
    /// returned as an error and no workflow is created.
    pub fn create_and_distribute_token_with_progress<'a>(
        &'a self,
        params: TokenCreationParams,
        wallet: &'a dyn WalletConnector,
    ) -> Result<
        (
            SnapshotStream,
            impl Future<Output = TokenCreationOutcome> + 'a,
        ),
        OrchestrationError,
    > {
        let plan = self.prepare(&params)?;
        let engine = StepEngine::default();
        let (token, stream) = engine.start(token_workflow_steps())?;
        let run = async move { self.execute(engine, token, params, plan, wallet).await };
        Ok((stream, run))
    }

    /// Validation-time checks: nothing here touches the wallet or ledger.
    fn prepare(&self, params: &TokenCreationParams) -> Result<DistributionPlan, OrchestrationError> {
        if self.ledger.execution_mode() == ExecutionMode::Simulated && !self.config.allow_simulated
        {
            return Err(OrchestrationError::SimulatedLedgerRefused);
        }
        params.validate()?;

        let plan = DistributionPlan::compute(params.initial_supply, &self.config.recipients)?;
        if plan.per_recipient_amount == 0 {
            return Err(OrchestrationError::InvalidParams(format!(
                "initial supply {} is smaller than the {} recipients",
                params.initial_supply,
                plan.recipient_count()
            )));
        }
        Ok(plan)
    }

    fn refused(&self, err: OrchestrationError, engine: &StepEngine) -> TokenCreationOutcome {
        tracing::warn!(error = %err, "Token workflow refused before start");
        TokenCreationOutcome {
            success: false,
            token: None,
            submitted_token: None,
            distribution: None,
            error: Some(err),
            recovery: RecoveryClass::NothingHappened,
            execution_mode: self.ledger.execution_mode(),
            final_snapshot: engine.snapshot(),
        }
    }

    async fn execute(
        &self,
        engine: StepEngine,
        token: RunToken,
        params: TokenCreationParams,
        plan: DistributionPlan,
        wallet: &dyn WalletConnector,
    ) -> TokenCreationOutcome {
        let workflow_id = engine.workflow_id();
        tracing::info!(
            workflow_id = %workflow_id,
            dao = %params.dao_name,
            symbol = %params.token_symbol,
            supply = params.initial_supply,
            recipients = plan.recipient_count(),
            "Token workflow launched"
        );

        let ledger = BoundedLedger::new(self.ledger.as_ref(), self.config.ledger_timeout());
        let mut session = WalletSession::new(wallet, self.config.required_creator.clone());
        let mut progress = RunProgress::default();

        let result = self
            .run_steps(
                &engine,
                token,
                &ledger,
                &mut session,
                &params,
                &plan,
                &mut progress,
            )
            .await;
        session.close().await;

        let final_snapshot = engine.snapshot();
        let (error, failed_step) = match &result {
            Ok(()) => (None, None),
            Err(err) => (
                Some(OrchestrationError::Workflow(err.to_workflow_error())),
                final_snapshot.failed_step().map(|step| step.id.clone()),
            ),
        };
        let recovery = classify(&progress, failed_step.as_deref(), result.as_ref().err());

        tracing::info!(
            workflow_id = %workflow_id,
            state = ?final_snapshot.state,
            recovery = ?recovery,
            mode = ledger.mode().name(),
            "Token workflow finished"
        );

        TokenCreationOutcome {
            success: final_snapshot.state == WorkflowState::Completed,
            token: progress.token,
            submitted_token: progress.submitted,
            distribution: progress.distribution,
            error,
            recovery,
            execution_mode: ledger.mode(),
            final_snapshot,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        engine: &StepEngine,
        token: RunToken,
        ledger: &BoundedLedger<'_>,
        session: &mut WalletSession<'_>,
        params: &TokenCreationParams,
        plan: &DistributionPlan,
        progress: &mut RunProgress,
    ) -> Result<(), StepRunError<StepFailure>> {
        let creator: Address = engine
            .run_step(token, STEP_CONNECT_WALLET, async {
                session.open().await.map_err(StepFailure::from)
            })
            .await?;

        let session = &*session;
        engine
            .run_step(token, STEP_CHECK_FUNDING, async {
                ledger
                    .ensure_funded(&creator)
                    .await
                    .map_err(StepFailure::from)
            })
            .await?;

        let token_config = params.token_config(self.config.token_decimals);
        let submitted = &mut progress.submitted;
        let created = engine
            .run_step(token, STEP_CREATE_TOKEN, async {
                session.reauthorize().await?;
                let creation: TokenCreation = ledger.create_token(&token_config).await?;
                *submitted = Some(creation.clone());
                if let Err(source) = ledger.confirm(&creation.tx_reference).await {
                    return Err(StepFailure::CreationUnconfirmed {
                        tx: creation.tx_reference.hash,
                        source,
                    });
                }
                Ok::<_, StepFailure>(TokenReference {
                    asset_reference: creation.asset_reference,
                    creation_tx: creation.tx_reference,
                    symbol: token_config.symbol.clone(),
                    total_supply: token_config.total_supply,
                    decimals: token_config.decimals,
                })
            })
            .await?;
        let asset = created.asset_reference.clone();
        progress.token = Some(created);

        engine
            .run_step(token, STEP_REGISTER_ASSETS, async {
                ledger
                    .register_recipients(&asset, &plan.recipients)
                    .await
                    .map(|()| format!("{} recipients registered", plan.recipient_count()))
                    .map_err(StepFailure::from)
            })
            .await?;

        let distribution = engine
            .run_step(token, STEP_DISTRIBUTE_TOKENS, async {
                session.reauthorize().await?;
                Ok::<_, StepFailure>(distribute(ledger, &asset, &creator, plan).await)
            })
            .await?;
        progress.distribution = Some(distribution);

        Ok(())
    }
}

/// Best-effort transfers, one entry per recipient in plan order.
async fn distribute(
    ledger: &BoundedLedger<'_>,
    asset: &str,
    from: &Address,
    plan: &DistributionPlan,
) -> DistributionResult {
    let mut result = DistributionResult::new();
    for (recipient, amount) in plan.allocations() {
        match ledger.transfer(asset, from, &recipient, amount).await {
            Ok(tx) => match ledger.confirm(&tx).await {
                Ok(_) => {
                    tracing::info!(
                        recipient = %recipient.short(),
                        amount,
                        tx = %tx,
                        "Transfer confirmed"
                    );
                    result.record_success(recipient, amount, tx.hash);
                }
                Err(err) => {
                    tracing::warn!(
                        recipient = %recipient.short(),
                        amount,
                        tx = %tx,
                        error = %err,
                        "Transfer not confirmed"
                    );
                    result.record_failure(recipient, amount, Some(tx.hash), err.to_string());
                }
            },
            Err(err) => {
                tracing::warn!(
                    recipient = %recipient.short(),
                    amount,
                    error = %err,
                    "Transfer failed"
                );
                result.record_failure(recipient, amount, None, err.to_string());
            }
        }
    }
    result
}

fn classify(
    progress: &RunProgress,
    failed_step: Option<&str>,
    error: Option<&StepRunError<StepFailure>>,
) -> RecoveryClass {
    if let Some(distribution) = &progress.distribution {
        return if distribution.is_complete_success() {
            RecoveryClass::FullyDistributed
        } else {
            RecoveryClass::PartiallyDistributed
        };
    }
    if progress.token.is_some() || progress.submitted.is_some() {
        return RecoveryClass::LedgerActionPossiblyOccurred;
    }
    match (failed_step, error) {
        (
            Some(STEP_CREATE_TOKEN),
            Some(StepRunError::Failed {
                cause: StepFailure::Ledger(err),
                ..
            }),
        ) if err.may_have_applied() => RecoveryClass::LedgerActionPossiblyOccurred,
        _ => RecoveryClass::NothingHappened,
    }
}
