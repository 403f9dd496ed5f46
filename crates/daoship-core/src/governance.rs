//! DAO, proposal and vote records.
//!
//! Every mutation carries a signed envelope. The envelope content is checked
//! against the mutation and the signature is verified for the envelope's
//! actor before anything is written.
//!
//! The DAO record is also where a governance token is recorded once. A token
//! workflow started through [`GovernanceService::create_dao_token`] is
//! refused while the DAO already has one, including a token whose creation
//! may have reached the ledger without being confirmed.

use crate::config::RetryConfig;
use crate::envelope::{
    ActionEnvelope, ActionPayload, EnvelopeCheckError, EnvelopeValidator, SignatureVerifier,
    SignedEnvelope, VoteChoice,
};
use crate::error::GovernanceError;
use crate::identity::WalletConnector;
use crate::orchestrator::{
    RecoveryClass, TokenCreationOutcome, TokenCreationParams, TokenDistributionOrchestrator,
};
use crate::persistence::{MergeOptions, RecordStore, ResilientStore, RetryPolicy};
use crate::types::{Address, ExecutionMode};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const DEFAULT_VOTING_PERIOD_DAYS: u32 = 7;

fn dao_key(id: &str) -> String {
    format!("daos/{id}")
}

fn proposal_key(id: &str) -> String {
    format!("proposals/{id}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Active,
    Passed,
    Failed,
    Executed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateDaoRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub creator: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub token_name: String,
    pub token_symbol: String,
    pub token_supply: u64,
    #[serde(default = "default_voting_period_days")]
    pub voting_period_days: u32,
    /// Minimum total voting power before a proposal can be decided.
    pub quorum: u64,
}

fn default_voting_period_days() -> u32 {
    DEFAULT_VOTING_PERIOD_DAYS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaoRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub creator: Address,
    pub manager: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub token_name: String,
    pub token_symbol: String,
    pub token_supply: u64,
    pub voting_period_days: u32,
    pub quorum: u64,
    pub members: Vec<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance_token: Option<DaoTokenRecord>,
    pub signature: String,
    pub signed_message: String,
    pub created_at: DateTime<Utc>,
}

impl DaoRecord {
    pub fn is_member(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    fn may_manage_token(&self, actor: &Address) -> bool {
        actor == &self.creator || actor == &self.manager
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenDistributionStatus {
    /// Every recipient received their share.
    Completed,
    /// The token exists; some transfers failed.
    Partial,
    /// Creation may have reached the ledger but was never confirmed.
    Unconfirmed,
}

/// Governance token recorded on a DAO after a token workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaoTokenRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_tx: Option<String>,
    #[serde(default)]
    pub distribution_txs: Vec<String>,
    pub status: TokenDistributionStatus,
    pub execution_mode: ExecutionMode,
    pub recorded_at: DateTime<Utc>,
}

impl DaoTokenRecord {
    /// `None` when the workflow left no trace on the ledger.
    pub fn from_outcome(outcome: &TokenCreationOutcome, now: DateTime<Utc>) -> Option<Self> {
        let status = match outcome.recovery {
            RecoveryClass::NothingHappened => return None,
            RecoveryClass::LedgerActionPossiblyOccurred => TokenDistributionStatus::Unconfirmed,
            RecoveryClass::PartiallyDistributed => TokenDistributionStatus::Partial,
            RecoveryClass::FullyDistributed => TokenDistributionStatus::Completed,
        };
        let (asset_reference, creation_tx) = match (&outcome.token, &outcome.submitted_token) {
            (Some(token), _) => (
                Some(token.asset_reference.clone()),
                Some(token.creation_tx.hash.clone()),
            ),
            (None, Some(submitted)) => (
                Some(submitted.asset_reference.clone()),
                Some(submitted.tx_reference.hash.clone()),
            ),
            (None, None) => (None, None),
        };
        let distribution_txs = outcome
            .distribution
            .iter()
            .flat_map(|result| result.entries.iter())
            .filter_map(|entry| entry.external_reference.clone())
            .collect();

        Some(Self {
            asset_reference,
            creation_tx,
            distribution_txs,
            status,
            execution_mode: outcome.execution_mode,
            recorded_at: now,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateProposalRequest {
    pub dao_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub creator: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub voter: Address,
    pub vote: VoteChoice,
    pub voting_power: u64,
    pub signature: String,
    pub signed_message: String,
    pub cast_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    pub id: String,
    pub dao_id: String,
    pub title: String,
    pub description: String,
    pub creator: Address,
    pub status: ProposalStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub votes: Vec<VoteRecord>,
    #[serde(default)]
    pub yes_votes: u64,
    #[serde(default)]
    pub no_votes: u64,
    #[serde(default)]
    pub abstain_votes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_tx: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    pub signature: String,
    pub signed_message: String,
    pub created_at: DateTime<Utc>,
}

impl ProposalRecord {
    pub fn vote_of(&self, voter: &Address) -> Option<&VoteRecord> {
        self.votes.iter().find(|vote| &vote.voter == voter)
    }

    pub fn total_votes(&self) -> u64 {
        self.yes_votes
            .saturating_add(self.no_votes)
            .saturating_add(self.abstain_votes)
    }

    fn tally(&mut self, choice: VoteChoice, power: u64) {
        let counter = match choice {
            VoteChoice::Yes => &mut self.yes_votes,
            VoteChoice::No => &mut self.no_votes,
            VoteChoice::Abstain => &mut self.abstain_votes,
        };
        *counter = counter.saturating_add(power);
    }

    /// Decide the proposal once voting has ended and quorum is met.
    fn settle(&mut self, quorum: u64, now: DateTime<Utc>) {
        let decided = now > self.end_time && self.total_votes() >= quorum;
        if self.status == ProposalStatus::Active && decided {
            self.status = if self.yes_votes > self.no_votes {
                ProposalStatus::Passed
            } else {
                ProposalStatus::Failed
            };
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CastVoteRequest {
    pub voter: Address,
    pub vote: VoteChoice,
    /// Must match the signed `votingPower` and stay within the DAO token supply.
    pub voting_power: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteProposalRequest {
    pub executor: Address,
    /// Ledger transaction that carried out the proposal.
    pub transaction_hash: String,
}

/// Signed-intent gated governance records over a [`RecordStore`].
pub struct GovernanceService<S, V> {
    store: ResilientStore<S>,
    verifier: V,
    validator: EnvelopeValidator,
    /// Serializes read-modify-write of DAO and proposal documents.
    write_lock: Mutex<()>,
    /// Held for a whole token workflow so the once-only check and the
    /// record write cannot interleave with another creation.
    token_lock: Mutex<()>,
}

impl<S: RecordStore, V: SignatureVerifier> GovernanceService<S, V> {
    pub fn new(store: S, verifier: V, policy: RetryPolicy) -> Self {
        Self {
            store: ResilientStore::new(store, policy),
            verifier,
            validator: EnvelopeValidator::default(),
            write_lock: Mutex::new(()),
            token_lock: Mutex::new(()),
        }
    }

    /// Store retries follow the `[retry]` section of the loaded configuration.
    pub fn from_config(store: S, verifier: V, retry: &RetryConfig) -> Self {
        Self::new(store, verifier, retry.policy())
    }

    pub fn with_validator(mut self, validator: EnvelopeValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn store(&self) -> &S {
        self.store.inner()
    }

    fn authorize(
        &self,
        signed: &SignedEnvelope,
        expected: &ActionPayload,
        now: DateTime<Utc>,
    ) -> Result<ActionEnvelope, GovernanceError> {
        self.validator
            .validate_signed(signed, expected, now, &self.verifier)
            .map_err(|err| {
                tracing::warn!(
                    action = expected.action().name(),
                    actor = %expected.actor().short(),
                    error = %err,
                    "Signed envelope rejected"
                );
                match err {
                    EnvelopeCheckError::Content(e) => GovernanceError::Envelope(e),
                    EnvelopeCheckError::Signature(e) => GovernanceError::Signature(e),
                }
            })
    }

    pub async fn create_dao(
        &self,
        request: CreateDaoRequest,
        signed: &SignedEnvelope,
    ) -> Result<DaoRecord, GovernanceError> {
        self.create_dao_at(request, signed, Utc::now()).await
    }

    pub async fn create_dao_at(
        &self,
        request: CreateDaoRequest,
        signed: &SignedEnvelope,
        now: DateTime<Utc>,
    ) -> Result<DaoRecord, GovernanceError> {
        if request.name.trim().is_empty() {
            return Err(GovernanceError::InvalidRequest("DAO name is required".into()));
        }
        if request.token_supply == 0 {
            return Err(GovernanceError::InvalidRequest(
                "token supply must be positive".into(),
            ));
        }

        let expected = ActionPayload::CreateDao {
            dao_name: request.name.clone(),
            creator: request.creator.to_string(),
            chain_id: request.chain_id.clone(),
        };
        self.authorize(signed, &expected, now)?;

        let record = DaoRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            description: request.description,
            manager: request.manager.unwrap_or_else(|| request.creator.clone()),
            members: vec![request.creator.clone()],
            governance_token: None,
            creator: request.creator,
            chain_id: request.chain_id,
            token_name: request.token_name,
            token_symbol: request.token_symbol.to_uppercase(),
            token_supply: request.token_supply,
            voting_period_days: request.voting_period_days.max(1),
            quorum: request.quorum,
            signature: signed.signature.clone(),
            signed_message: signed.signed_message.clone(),
            created_at: now,
        };
        self.store
            .put_record(&dao_key(&record.id), &record, MergeOptions::replace())
            .await?;

        tracing::info!(
            dao_id = %record.id,
            name = %record.name,
            creator = %record.creator.short(),
            "DAO created"
        );
        Ok(record)
    }

    pub async fn get_dao(&self, dao_id: &str) -> Result<DaoRecord, GovernanceError> {
        self.store
            .get_record(&dao_key(dao_id))
            .await?
            .ok_or_else(|| GovernanceError::NotFound {
                kind: "dao",
                id: dao_id.to_string(),
            })
    }

    pub async fn create_proposal(
        &self,
        request: CreateProposalRequest,
        signed: &SignedEnvelope,
    ) -> Result<ProposalRecord, GovernanceError> {
        self.create_proposal_at(request, signed, Utc::now()).await
    }

    pub async fn create_proposal_at(
        &self,
        request: CreateProposalRequest,
        signed: &SignedEnvelope,
        now: DateTime<Utc>,
    ) -> Result<ProposalRecord, GovernanceError> {
        if request.title.trim().is_empty() {
            return Err(GovernanceError::InvalidRequest(
                "proposal title is required".into(),
            ));
        }
        if !request.creator.as_str().starts_with("0x") {
            return Err(GovernanceError::InvalidRequest(format!(
                "invalid creator address '{}'",
                request.creator
            )));
        }

        let expected = ActionPayload::CreateProposal {
            proposal_title: request.title.clone(),
            dao_id: request.dao_id.clone(),
            creator: request.creator.to_string(),
        };
        self.authorize(signed, &expected, now)?;

        let dao = self.get_dao(&request.dao_id).await?;
        let start_time = request.start_time.unwrap_or(now);
        let end_time = request
            .end_time
            .unwrap_or_else(|| start_time + Duration::days(i64::from(dao.voting_period_days)));
        if end_time <= start_time {
            return Err(GovernanceError::InvalidRequest(
                "proposal must end after it starts".into(),
            ));
        }

        let record = ProposalRecord {
            id: uuid::Uuid::new_v4().to_string(),
            dao_id: dao.id,
            title: request.title,
            description: request.description,
            creator: request.creator,
            status: ProposalStatus::Active,
            start_time,
            end_time,
            votes: Vec::new(),
            yes_votes: 0,
            no_votes: 0,
            abstain_votes: 0,
            executor: None,
            execution_tx: None,
            executed_at: None,
            signature: signed.signature.clone(),
            signed_message: signed.signed_message.clone(),
            created_at: now,
        };
        self.store
            .put_record(&proposal_key(&record.id), &record, MergeOptions::replace())
            .await?;

        tracing::info!(proposal_id = %record.id, dao_id = %record.dao_id, "Proposal created");
        Ok(record)
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> Result<ProposalRecord, GovernanceError> {
        self.store
            .get_record(&proposal_key(proposal_id))
            .await?
            .ok_or_else(|| GovernanceError::NotFound {
                kind: "proposal",
                id: proposal_id.to_string(),
            })
    }

    /// The vote `voter` cast on a proposal, if any.
    pub async fn vote_of(
        &self,
        proposal_id: &str,
        voter: &Address,
    ) -> Result<Option<VoteRecord>, GovernanceError> {
        Ok(self.get_proposal(proposal_id).await?.vote_of(voter).cloned())
    }

    pub async fn cast_vote(
        &self,
        proposal_id: &str,
        request: CastVoteRequest,
        signed: &SignedEnvelope,
    ) -> Result<ProposalRecord, GovernanceError> {
        self.cast_vote_at(proposal_id, request, signed, Utc::now())
            .await
    }

    pub async fn cast_vote_at(
        &self,
        proposal_id: &str,
        request: CastVoteRequest,
        signed: &SignedEnvelope,
        now: DateTime<Utc>,
    ) -> Result<ProposalRecord, GovernanceError> {
        if request.voting_power == 0 {
            return Err(GovernanceError::InvalidRequest(
                "voting power must be positive".into(),
            ));
        }

        let expected = ActionPayload::VoteOnProposal {
            proposal_id: proposal_id.to_string(),
            voter: request.voter.to_string(),
            vote: request.vote,
            voting_power: request.voting_power,
        };
        self.authorize(signed, &expected, now)?;

        // Read-modify-write of one proposal document.
        let _guard = self.write_lock.lock().await;
        let mut proposal = self.get_proposal(proposal_id).await?;
        if proposal.status != ProposalStatus::Active {
            return Err(GovernanceError::ProposalInactive(proposal_id.to_string()));
        }
        if proposal.vote_of(&request.voter).is_some() {
            return Err(GovernanceError::AlreadyVoted {
                proposal_id: proposal_id.to_string(),
                voter: request.voter.to_string(),
            });
        }
        let dao = match self.get_dao(&proposal.dao_id).await {
            Ok(dao) => dao,
            Err(GovernanceError::NotFound { .. }) => {
                return Err(GovernanceError::CorruptRecord(format!(
                    "proposal '{proposal_id}' references missing DAO '{}'",
                    proposal.dao_id
                )))
            }
            Err(err) => return Err(err),
        };
        if request.voting_power > dao.token_supply {
            return Err(GovernanceError::InvalidRequest(format!(
                "voting power {} exceeds the DAO token supply {}",
                request.voting_power, dao.token_supply
            )));
        }

        proposal.votes.push(VoteRecord {
            voter: request.voter.clone(),
            vote: request.vote,
            voting_power: request.voting_power,
            signature: signed.signature.clone(),
            signed_message: signed.signed_message.clone(),
            cast_at: now,
        });
        proposal.tally(request.vote, request.voting_power);
        proposal.settle(dao.quorum, now);

        self.store
            .put_record(&proposal_key(proposal_id), &proposal, MergeOptions::merge())
            .await?;

        tracing::info!(
            proposal_id,
            voter = %request.voter.short(),
            vote = ?request.vote,
            power = request.voting_power,
            status = ?proposal.status,
            "Vote recorded"
        );
        Ok(proposal)
    }

    pub async fn join_dao(
        &self,
        dao_id: &str,
        member: Address,
        signed: &SignedEnvelope,
    ) -> Result<DaoRecord, GovernanceError> {
        self.join_dao_at(dao_id, member, signed, Utc::now()).await
    }

    pub async fn join_dao_at(
        &self,
        dao_id: &str,
        member: Address,
        signed: &SignedEnvelope,
        now: DateTime<Utc>,
    ) -> Result<DaoRecord, GovernanceError> {
        if member.is_empty() {
            return Err(GovernanceError::InvalidRequest(
                "member address is required".into(),
            ));
        }
        let expected = ActionPayload::JoinDao {
            dao_id: dao_id.to_string(),
            member: member.to_string(),
        };
        self.authorize(signed, &expected, now)?;

        let _guard = self.write_lock.lock().await;
        let mut dao = self.get_dao(dao_id).await?;
        if dao.is_member(&member) {
            return Err(GovernanceError::AlreadyMember {
                dao_id: dao_id.to_string(),
                member: member.to_string(),
            });
        }
        dao.members.push(member.clone());
        self.store
            .put_record(&dao_key(dao_id), &dao, MergeOptions::merge())
            .await?;

        tracing::info!(
            dao_id,
            member = %member.short(),
            members = dao.members.len(),
            "Member joined DAO"
        );
        Ok(dao)
    }

    pub async fn execute_proposal(
        &self,
        proposal_id: &str,
        request: ExecuteProposalRequest,
        signed: &SignedEnvelope,
    ) -> Result<ProposalRecord, GovernanceError> {
        self.execute_proposal_at(proposal_id, request, signed, Utc::now())
            .await
    }

    /// Mark a passed proposal executed by `request.transaction_hash`.
    pub async fn execute_proposal_at(
        &self,
        proposal_id: &str,
        request: ExecuteProposalRequest,
        signed: &SignedEnvelope,
        now: DateTime<Utc>,
    ) -> Result<ProposalRecord, GovernanceError> {
        if request.transaction_hash.trim().is_empty() {
            return Err(GovernanceError::InvalidRequest(
                "execution transaction hash is required".into(),
            ));
        }
        let expected = ActionPayload::ExecuteProposal {
            proposal_id: proposal_id.to_string(),
            executor: request.executor.to_string(),
            transaction_hash: request.transaction_hash.clone(),
        };
        self.authorize(signed, &expected, now)?;

        let _guard = self.write_lock.lock().await;
        let mut proposal = self.get_proposal(proposal_id).await?;
        if proposal.status != ProposalStatus::Passed {
            return Err(GovernanceError::ProposalNotPassed(proposal_id.to_string()));
        }
        proposal.status = ProposalStatus::Executed;
        proposal.executor = Some(request.executor);
        proposal.execution_tx = Some(request.transaction_hash);
        proposal.executed_at = Some(now);
        self.store
            .put_record(&proposal_key(proposal_id), &proposal, MergeOptions::merge())
            .await?;

        tracing::info!(
            proposal_id,
            tx = proposal.execution_tx.as_deref().unwrap_or_default(),
            "Proposal executed"
        );
        Ok(proposal)
    }

    /// Record the result of a token workflow on the DAO, at most once.
    ///
    /// Returns `None` without writing when the workflow left nothing on the
    /// ledger, so the DAO stays eligible for another attempt.
    pub async fn record_token_distribution(
        &self,
        dao_id: &str,
        outcome: &TokenCreationOutcome,
    ) -> Result<Option<DaoTokenRecord>, GovernanceError> {
        self.record_token_distribution_at(dao_id, outcome, Utc::now())
            .await
    }

    pub async fn record_token_distribution_at(
        &self,
        dao_id: &str,
        outcome: &TokenCreationOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<DaoTokenRecord>, GovernanceError> {
        let Some(token) = DaoTokenRecord::from_outcome(outcome, now) else {
            return Ok(None);
        };

        let _guard = self.write_lock.lock().await;
        let mut dao = self.get_dao(dao_id).await?;
        if let Some(existing) = &dao.governance_token {
            return Err(GovernanceError::TokenAlreadyRecorded {
                dao_id: dao_id.to_string(),
                asset_reference: existing.asset_reference.clone(),
            });
        }
        dao.governance_token = Some(token.clone());
        self.store
            .put_record(&dao_key(dao_id), &dao, MergeOptions::merge())
            .await?;

        tracing::info!(
            dao_id,
            asset = token.asset_reference.as_deref().unwrap_or("unknown"),
            status = ?token.status,
            transfers = token.distribution_txs.len(),
            "Governance token recorded"
        );
        Ok(Some(token))
    }

    /// Create and distribute the DAO's governance token, once.
    ///
    /// `signed` must be a `createToken` envelope from the DAO creator or
    /// manager covering the DAO's token name, symbol and supply. The outcome
    /// is recorded on the DAO whenever the ledger may have been touched.
    pub async fn create_dao_token(
        &self,
        dao_id: &str,
        actor: &Address,
        signed: &SignedEnvelope,
        orchestrator: &TokenDistributionOrchestrator,
        wallet: &dyn WalletConnector,
    ) -> Result<TokenCreationOutcome, GovernanceError> {
        let _token_guard = self.token_lock.lock().await;
        let dao = self.get_dao(dao_id).await?;

        let expected = ActionPayload::CreateToken {
            token_name: dao.token_name.clone(),
            token_symbol: dao.token_symbol.clone(),
            initial_supply: dao.token_supply,
            creator: actor.to_string(),
        };
        self.authorize(signed, &expected, Utc::now())?;
        if !dao.may_manage_token(actor) {
            return Err(GovernanceError::Unauthorized {
                actor: actor.to_string(),
                dao_id: dao_id.to_string(),
            });
        }
        if let Some(existing) = &dao.governance_token {
            return Err(GovernanceError::TokenAlreadyRecorded {
                dao_id: dao_id.to_string(),
                asset_reference: existing.asset_reference.clone(),
            });
        }

        let params = TokenCreationParams {
            dao_name: dao.name.clone(),
            token_name: dao.token_name.clone(),
            token_symbol: dao.token_symbol.clone(),
            token_description: String::new(),
            initial_supply: dao.token_supply,
            icon_url: None,
            project_url: None,
        };
        let outcome = orchestrator.create_and_distribute_token(params, wallet).await;

        if let Err(err) = self.record_token_distribution(dao_id, &outcome).await {
            let asset_reference = outcome
                .token
                .as_ref()
                .map(|token| token.asset_reference.clone())
                .or_else(|| {
                    outcome
                        .submitted_token
                        .as_ref()
                        .map(|submitted| submitted.asset_reference.clone())
                });
            tracing::error!(
                dao_id,
                asset = asset_reference.as_deref().unwrap_or("unknown"),
                recovery = ?outcome.recovery,
                error = %err,
                "Token workflow finished but the DAO record was not updated"
            );
            return Err(GovernanceError::TokenNotRecorded {
                dao_id: dao_id.to_string(),
                asset_reference,
                source: Box::new(err),
            });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Ed25519SignatureVerifier;
    use crate::error::{EnvelopeError, SignatureError, StoreError};
    use crate::types::{TokenCreation, TokenReference, TxReference};
    use crate::workflow::StepEngine;
    use async_trait::async_trait;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    const ALICE: &str = "0x00000000000000000000000000000000000000000000000000000000000a11ce";
    const BOB: &str = "0x0000000000000000000000000000000000000000000000000000000000000b0b";

    #[derive(Default)]
    struct MapStore {
        records: StdMutex<HashMap<String, Value>>,
    }

    #[async_trait]
    impl RecordStore for MapStore {
        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            Ok(self.records.lock().unwrap().get(key).cloned())
        }

        async fn put(&self, key: &str, record: Value, _: MergeOptions) -> Result<(), StoreError> {
            self.records.lock().unwrap().insert(key.to_string(), record);
            Ok(())
        }
    }

    struct Signers {
        keys: HashMap<&'static str, SigningKey>,
    }

    impl Signers {
        fn new() -> (Self, Ed25519SignatureVerifier) {
            let mut verifier = Ed25519SignatureVerifier::new();
            let mut keys = HashMap::new();
            for (seed, who) in [(7u8, ALICE), (9u8, BOB)] {
                let key = SigningKey::from_bytes(&[seed; 32]);
                verifier.register_key(&Address::new(who), key.verifying_key());
                keys.insert(who, key);
            }
            (Self { keys }, verifier)
        }

        fn sign(&self, who: &str, payload: ActionPayload, at: DateTime<Utc>) -> SignedEnvelope {
            let message = ActionEnvelope::new(payload, at).to_message().unwrap();
            let signature = self.keys[who].sign(message.as_bytes());
            SignedEnvelope::new(message, hex::encode(signature.to_bytes()))
        }
    }

    fn dao_request(name: &str) -> CreateDaoRequest {
        CreateDaoRequest {
            name: name.into(),
            description: "builders collective".into(),
            creator: Address::new(ALICE),
            manager: None,
            chain_id: None,
            token_name: "Builders".into(),
            token_symbol: "bld".into(),
            token_supply: 1_000_000,
            voting_period_days: 7,
            quorum: 10,
        }
    }

    fn service() -> (GovernanceService<MapStore, Ed25519SignatureVerifier>, Signers) {
        let (signers, verifier) = Signers::new();
        (
            GovernanceService::new(MapStore::default(), verifier, RetryPolicy::default()),
            signers,
        )
    }

    async fn seeded() -> (
        GovernanceService<MapStore, Ed25519SignatureVerifier>,
        Signers,
        ProposalRecord,
    ) {
        let (service, signers) = service();
        let now = Utc::now();
        let dao_signed = signers.sign(
            ALICE,
            ActionPayload::CreateDao {
                dao_name: "Builders".into(),
                creator: ALICE.into(),
                chain_id: None,
            },
            now,
        );
        let dao = service
            .create_dao_at(dao_request("Builders"), &dao_signed, now)
            .await
            .unwrap();

        let proposal_signed = signers.sign(
            ALICE,
            ActionPayload::CreateProposal {
                proposal_title: "Fund tooling".into(),
                dao_id: dao.id.clone(),
                creator: ALICE.into(),
            },
            now,
        );
        let proposal = service
            .create_proposal_at(
                CreateProposalRequest {
                    dao_id: dao.id,
                    title: "Fund tooling".into(),
                    description: String::new(),
                    creator: Address::new(ALICE),
                    start_time: None,
                    end_time: None,
                },
                &proposal_signed,
                now,
            )
            .await
            .unwrap();
        (service, signers, proposal)
    }

    fn vote(proposal_id: &str, voter: &str, choice: VoteChoice, power: u64) -> ActionPayload {
        ActionPayload::VoteOnProposal {
            proposal_id: proposal_id.into(),
            voter: voter.into(),
            vote: choice,
            voting_power: power,
        }
    }

    fn workflow_outcome(
        recovery: RecoveryClass,
        token: Option<TokenReference>,
        submitted_token: Option<TokenCreation>,
    ) -> TokenCreationOutcome {
        TokenCreationOutcome {
            success: matches!(
                recovery,
                RecoveryClass::FullyDistributed | RecoveryClass::PartiallyDistributed
            ),
            token,
            submitted_token,
            distribution: None,
            error: None,
            recovery,
            execution_mode: ExecutionMode::Simulated,
            final_snapshot: StepEngine::default().snapshot(),
        }
    }

    fn tx(hash: &str) -> TxReference {
        TxReference {
            hash: hash.into(),
            mode: ExecutionMode::Simulated,
        }
    }

    #[tokio::test]
    async fn creates_dao_with_creator_as_member() {
        let (service, signers) = service();
        let now = Utc::now();
        let signed = signers.sign(
            ALICE,
            ActionPayload::CreateDao {
                dao_name: "Builders".into(),
                creator: ALICE.into(),
                chain_id: None,
            },
            now,
        );

        let dao = service
            .create_dao_at(dao_request("Builders"), &signed, now)
            .await
            .unwrap();
        assert_eq!(dao.members, vec![Address::new(ALICE)]);
        assert_eq!(dao.manager, Address::new(ALICE));
        assert_eq!(dao.token_symbol, "BLD");
        assert_eq!(service.get_dao(&dao.id).await.unwrap(), dao);
    }

    #[tokio::test]
    async fn rejects_dao_name_not_covered_by_signature() {
        let (service, signers) = service();
        let now = Utc::now();
        let signed = signers.sign(
            ALICE,
            ActionPayload::CreateDao {
                dao_name: "Builders".into(),
                creator: ALICE.into(),
                chain_id: None,
            },
            now,
        );

        let err = service
            .create_dao_at(dao_request("Breakers"), &signed, now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::Envelope(EnvelopeError::PayloadMismatch { ref field }) if field == "daoName"
        ));
        assert!(service.store().records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_envelope_signed_by_someone_else() {
        let (service, signers) = service();
        let now = Utc::now();
        // Bob signs a payload that claims Alice as creator.
        let forged = signers.sign(
            BOB,
            ActionPayload::CreateDao {
                dao_name: "Builders".into(),
                creator: ALICE.into(),
                chain_id: None,
            },
            now,
        );

        let err = service
            .create_dao_at(dao_request("Builders"), &forged, now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::Signature(SignatureError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn proposal_requires_existing_dao() {
        let (service, signers) = service();
        let now = Utc::now();
        let signed = signers.sign(
            ALICE,
            ActionPayload::CreateProposal {
                proposal_title: "Fund tooling".into(),
                dao_id: "missing".into(),
                creator: ALICE.into(),
            },
            now,
        );

        let err = service
            .create_proposal_at(
                CreateProposalRequest {
                    dao_id: "missing".into(),
                    title: "Fund tooling".into(),
                    description: String::new(),
                    creator: Address::new(ALICE),
                    start_time: None,
                    end_time: None,
                },
                &signed,
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::NotFound { kind: "dao", .. }));
    }

    #[tokio::test]
    async fn tallies_weighted_votes_once_per_voter() {
        let (service, signers, proposal) = seeded().await;
        let now = Utc::now();

        let signed = signers.sign(BOB, vote(&proposal.id, BOB, VoteChoice::Yes, 25), now);
        let updated = service
            .cast_vote_at(
                &proposal.id,
                CastVoteRequest {
                    voter: Address::new(BOB),
                    vote: VoteChoice::Yes,
                    voting_power: 25,
                },
                &signed,
                now,
            )
            .await
            .unwrap();
        assert_eq!(updated.yes_votes, 25);
        assert_eq!(updated.votes.len(), 1);

        // Same voter, different casing, fresh signature: still a duplicate.
        let upper = BOB.to_uppercase().replacen("0X", "0x", 1);
        let again = signers.sign(BOB, vote(&proposal.id, &upper, VoteChoice::No, 25), now);
        let err = service
            .cast_vote_at(
                &proposal.id,
                CastVoteRequest {
                    voter: Address::new(upper.as_str()),
                    vote: VoteChoice::No,
                    voting_power: 25,
                },
                &again,
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::AlreadyVoted { .. }));

        let stored = service.get_proposal(&proposal.id).await.unwrap();
        assert_eq!((stored.yes_votes, stored.no_votes), (25, 0));
        assert!(service
            .vote_of(&proposal.id, &Address::new(BOB))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn vote_after_end_settles_proposal() {
        let (service, signers, proposal) = seeded().await;
        let later = proposal.end_time + Duration::hours(1);

        let signed = signers.sign(BOB, vote(&proposal.id, BOB, VoteChoice::No, 10), later);
        let updated = service
            .cast_vote_at(
                &proposal.id,
                CastVoteRequest {
                    voter: Address::new(BOB),
                    vote: VoteChoice::No,
                    voting_power: 10,
                },
                &signed,
                later,
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ProposalStatus::Failed);

        let late = signers.sign(ALICE, vote(&proposal.id, ALICE, VoteChoice::Yes, 10), later);
        let err = service
            .cast_vote_at(
                &proposal.id,
                CastVoteRequest {
                    voter: Address::new(ALICE),
                    vote: VoteChoice::Yes,
                    voting_power: 10,
                },
                &late,
                later,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::ProposalInactive(_)));
    }

    #[tokio::test]
    async fn dao_name_is_stored_exactly_as_signed() {
        let (service, signers) = service();
        let now = Utc::now();
        let signed = signers.sign(
            ALICE,
            ActionPayload::CreateDao {
                dao_name: " Builders ".into(),
                creator: ALICE.into(),
                chain_id: None,
            },
            now,
        );

        let dao = service
            .create_dao_at(dao_request(" Builders "), &signed, now)
            .await
            .unwrap();
        assert_eq!(dao.name, " Builders ");
        let stored = service.get_dao(&dao.id).await.unwrap();
        assert!(stored.signed_message.contains(&format!("\"daoName\":\"{}\"", stored.name)));
    }

    #[tokio::test]
    async fn voting_power_must_be_signed() {
        let (service, signers, proposal) = seeded().await;
        let now = Utc::now();

        let signed = signers.sign(BOB, vote(&proposal.id, BOB, VoteChoice::Yes, 25), now);
        let err = service
            .cast_vote_at(
                &proposal.id,
                CastVoteRequest {
                    voter: Address::new(BOB),
                    vote: VoteChoice::Yes,
                    voting_power: 1_000,
                },
                &signed,
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::Envelope(EnvelopeError::PayloadMismatch { ref field }) if field == "votingPower"
        ));
        assert_eq!(service.get_proposal(&proposal.id).await.unwrap().yes_votes, 0);
    }

    #[tokio::test]
    async fn voting_power_is_capped_by_token_supply() {
        let (service, signers, proposal) = seeded().await;
        let now = Utc::now();

        let signed = signers.sign(BOB, vote(&proposal.id, BOB, VoteChoice::Yes, u64::MAX), now);
        let err = service
            .cast_vote_at(
                &proposal.id,
                CastVoteRequest {
                    voter: Address::new(BOB),
                    vote: VoteChoice::Yes,
                    voting_power: u64::MAX,
                },
                &signed,
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::InvalidRequest(_)));

        let stored = service.get_proposal(&proposal.id).await.unwrap();
        assert_eq!(stored.yes_votes, 0);
        assert!(stored.votes.is_empty());
    }

    #[tokio::test]
    async fn join_adds_member_once() {
        let (service, signers, proposal) = seeded().await;
        let now = Utc::now();
        let dao_id = proposal.dao_id.clone();
        let join = |who: &str| ActionPayload::JoinDao {
            dao_id: dao_id.clone(),
            member: who.into(),
        };

        let signed = signers.sign(BOB, join(BOB), now);
        let dao = service
            .join_dao_at(&dao_id, Address::new(BOB), &signed, now)
            .await
            .unwrap();
        assert_eq!(dao.members, vec![Address::new(ALICE), Address::new(BOB)]);
        assert!(service.get_dao(&dao_id).await.unwrap().is_member(&Address::new(BOB)));

        let upper = BOB.to_uppercase().replacen("0X", "0x", 1);
        let again = signers.sign(BOB, join(&upper), now);
        let err = service
            .join_dao_at(&dao_id, Address::new(upper.as_str()), &again, now)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::AlreadyMember { .. }));

        let founder = signers.sign(ALICE, join(ALICE), now);
        assert!(matches!(
            service
                .join_dao_at(&dao_id, Address::new(ALICE), &founder, now)
                .await,
            Err(GovernanceError::AlreadyMember { .. })
        ));
    }

    #[tokio::test]
    async fn only_passed_proposals_execute() {
        let (service, signers, proposal) = seeded().await;
        let later = proposal.end_time + Duration::hours(1);
        let execute = ActionPayload::ExecuteProposal {
            proposal_id: proposal.id.clone(),
            executor: ALICE.into(),
            transaction_hash: "0xexec".into(),
        };
        let request = || ExecuteProposalRequest {
            executor: Address::new(ALICE),
            transaction_hash: "0xexec".into(),
        };

        let early = signers.sign(ALICE, execute.clone(), later);
        let err = service
            .execute_proposal_at(&proposal.id, request(), &early, later)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::ProposalNotPassed(_)));

        let yes = signers.sign(BOB, vote(&proposal.id, BOB, VoteChoice::Yes, 10), later);
        let passed = service
            .cast_vote_at(
                &proposal.id,
                CastVoteRequest {
                    voter: Address::new(BOB),
                    vote: VoteChoice::Yes,
                    voting_power: 10,
                },
                &yes,
                later,
            )
            .await
            .unwrap();
        assert_eq!(passed.status, ProposalStatus::Passed);

        let signed = signers.sign(ALICE, execute, later);
        let executed = service
            .execute_proposal_at(&proposal.id, request(), &signed, later)
            .await
            .unwrap();
        assert_eq!(executed.status, ProposalStatus::Executed);
        assert_eq!(executed.executor, Some(Address::new(ALICE)));
        assert_eq!(executed.execution_tx.as_deref(), Some("0xexec"));
        assert_eq!(executed.executed_at, Some(later));

        let err = service
            .execute_proposal_at(&proposal.id, request(), &signed, later)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::ProposalNotPassed(_)));
    }

    #[tokio::test]
    async fn token_is_recorded_at_most_once() {
        let (service, _signers, proposal) = seeded().await;
        let dao_id = proposal.dao_id;
        let token = TokenReference {
            asset_reference: "0xasset".into(),
            creation_tx: tx("0xcreate"),
            symbol: "BLD".into(),
            total_supply: 1_000_000,
            decimals: 6,
        };

        let nothing = workflow_outcome(RecoveryClass::NothingHappened, None, None);
        assert_eq!(
            service
                .record_token_distribution(&dao_id, &nothing)
                .await
                .unwrap(),
            None
        );
        assert!(service
            .get_dao(&dao_id)
            .await
            .unwrap()
            .governance_token
            .is_none());

        let done = workflow_outcome(RecoveryClass::FullyDistributed, Some(token), None);
        let recorded = service
            .record_token_distribution(&dao_id, &done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.status, TokenDistributionStatus::Completed);
        assert_eq!(recorded.asset_reference.as_deref(), Some("0xasset"));
        assert_eq!(recorded.creation_tx.as_deref(), Some("0xcreate"));
        assert_eq!(
            service.get_dao(&dao_id).await.unwrap().governance_token,
            Some(recorded)
        );

        let err = service
            .record_token_distribution(&dao_id, &done)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::TokenAlreadyRecorded { asset_reference: Some(ref asset), .. } if asset == "0xasset"
        ));
    }

    #[test]
    fn unconfirmed_creation_is_recorded_from_the_submission() {
        let submitted = TokenCreation {
            asset_reference: "0xpending".into(),
            tx_reference: tx("0xcreate"),
        };
        let outcome = workflow_outcome(
            RecoveryClass::LedgerActionPossiblyOccurred,
            None,
            Some(submitted),
        );

        let record = DaoTokenRecord::from_outcome(&outcome, Utc::now()).unwrap();
        assert_eq!(record.status, TokenDistributionStatus::Unconfirmed);
        assert_eq!(record.asset_reference.as_deref(), Some("0xpending"));
        assert_eq!(record.creation_tx.as_deref(), Some("0xcreate"));
        assert!(record.distribution_txs.is_empty());
    }
}
