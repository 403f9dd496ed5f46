//! Signed action envelopes.
//!
//! Clients sign a JSON message describing the privileged mutation they want
//! (`{"action":"createDAO","daoName":...,"creator":...,"timestamp":...}`) and
//! submit it alongside the mutation itself. Before anything is persisted the
//! server checks that:
//!
//! - the message parses into a known envelope shape,
//! - the action is the one being performed,
//! - every field of the requested mutation matches the signed payload exactly,
//! - the envelope is fresh (issued within [`DEFAULT_MAX_AGE_SECS`]).
//!
//! Content checks are pure and live in [`EnvelopeValidator::validate`].
//! Signature authenticity is a separate seam ([`SignatureVerifier`]) so the
//! two can never be confused: a well-formed signature over the wrong payload
//! is still rejected, and a matching payload with a forged signature is too.

use crate::error::{EnvelopeError, SignatureError};
use crate::types::Address;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Maximum envelope age accepted by default (10 minutes).
pub const DEFAULT_MAX_AGE_SECS: i64 = 10 * 60;

/// Privileged actions a client may authorize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionKind {
    #[serde(rename = "createDAO")]
    CreateDao,
    #[serde(rename = "createProposal")]
    CreateProposal,
    #[serde(rename = "voteOnProposal")]
    VoteOnProposal,
    #[serde(rename = "createToken")]
    CreateToken,
    #[serde(rename = "joinDAO")]
    JoinDao,
    #[serde(rename = "executeProposal")]
    ExecuteProposal,
}

impl ActionKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateDao => "createDAO",
            Self::CreateProposal => "createProposal",
            Self::VoteOnProposal => "voteOnProposal",
            Self::CreateToken => "createToken",
            Self::JoinDao => "joinDAO",
            Self::ExecuteProposal => "executeProposal",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

/// Action-specific payload fields, tagged by `action` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action")]
pub enum ActionPayload {
    #[serde(rename = "createDAO", rename_all = "camelCase")]
    CreateDao {
        dao_name: String,
        creator: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chain_id: Option<String>,
    },
    #[serde(rename = "createProposal", rename_all = "camelCase")]
    CreateProposal {
        proposal_title: String,
        dao_id: String,
        creator: String,
    },
    #[serde(rename = "voteOnProposal", rename_all = "camelCase")]
    VoteOnProposal {
        proposal_id: String,
        voter: String,
        vote: VoteChoice,
        voting_power: u64,
    },
    #[serde(rename = "createToken", rename_all = "camelCase")]
    CreateToken {
        token_name: String,
        token_symbol: String,
        initial_supply: u64,
        creator: String,
    },
    #[serde(rename = "joinDAO", rename_all = "camelCase")]
    JoinDao { dao_id: String, member: String },
    #[serde(rename = "executeProposal", rename_all = "camelCase")]
    ExecuteProposal {
        proposal_id: String,
        executor: String,
        transaction_hash: String,
    },
}

impl ActionPayload {
    pub fn action(&self) -> ActionKind {
        match self {
            Self::CreateDao { .. } => ActionKind::CreateDao,
            Self::CreateProposal { .. } => ActionKind::CreateProposal,
            Self::VoteOnProposal { .. } => ActionKind::VoteOnProposal,
            Self::CreateToken { .. } => ActionKind::CreateToken,
            Self::JoinDao { .. } => ActionKind::JoinDao,
            Self::ExecuteProposal { .. } => ActionKind::ExecuteProposal,
        }
    }

    /// The identity the action is performed as.
    pub fn actor(&self) -> Address {
        match self {
            Self::CreateDao { creator, .. }
            | Self::CreateProposal { creator, .. }
            | Self::CreateToken { creator, .. } => Address::new(creator.as_str()),
            Self::VoteOnProposal { voter, .. } => Address::new(voter.as_str()),
            Self::JoinDao { member, .. } => Address::new(member.as_str()),
            Self::ExecuteProposal { executor, .. } => Address::new(executor.as_str()),
        }
    }
}

/// Parsed envelope content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionEnvelope {
    #[serde(flatten)]
    pub payload: ActionPayload,
    /// Unix milliseconds at signing time.
    #[serde(rename = "timestamp")]
    pub issued_at_ms: i64,
}

impl ActionEnvelope {
    pub fn new(payload: ActionPayload, issued_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            issued_at_ms: issued_at.timestamp_millis(),
        }
    }

    pub fn action(&self) -> ActionKind {
        self.payload.action()
    }

    pub fn actor_identity(&self) -> Address {
        self.payload.actor()
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.issued_at_ms)
    }

    /// Canonical message a wallet signs.
    pub fn to_message(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

/// A signed message exactly as submitted by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    pub signed_message: String,
    pub signature: String,
}

impl SignedEnvelope {
    pub fn new(signed_message: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            signed_message: signed_message.into(),
            signature: signature.into(),
        }
    }

    pub fn parse(&self) -> Result<ActionEnvelope, EnvelopeError> {
        serde_json::from_str(&self.signed_message)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

/// Checks envelope content and freshness. Pure: time is passed in.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeValidator {
    max_age_ms: i64,
}

impl Default for EnvelopeValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE_SECS)
    }
}

impl EnvelopeValidator {
    pub fn new(max_age_secs: i64) -> Self {
        Self {
            max_age_ms: max_age_secs.max(0).saturating_mul(1_000),
        }
    }

    pub fn max_age_secs(&self) -> i64 {
        self.max_age_ms / 1_000
    }

    /// Validate that `signed` authorizes exactly `expected` at time `now`.
    ///
    /// The expected action is the variant of `expected`. Every field present
    /// in `expected` must be equal to the signed field; optional fields left
    /// unset in `expected` are not part of the mutation and are not compared.
    pub fn validate(
        &self,
        signed: &SignedEnvelope,
        expected: &ActionPayload,
        now: DateTime<Utc>,
    ) -> Result<ActionEnvelope, EnvelopeError> {
        let raw: Value = serde_json::from_str(&signed.signed_message)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let fields = raw
            .as_object()
            .ok_or_else(|| EnvelopeError::Malformed("signed message is not an object".into()))?;

        let actual_action = fields
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| EnvelopeError::Malformed("missing 'action'".into()))?;
        if fields.get("timestamp").and_then(Value::as_i64).is_none() {
            return Err(EnvelopeError::Malformed("missing 'timestamp'".into()));
        }

        let expected_action = expected.action();
        if actual_action != expected_action.name() {
            return Err(EnvelopeError::ActionMismatch {
                expected: expected_action.name().to_string(),
                actual: actual_action.to_string(),
            });
        }

        let envelope: ActionEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        check_payload_fields(expected, fields)?;
        self.check_freshness(envelope.issued_at_ms, now)?;

        Ok(envelope)
    }

    fn check_freshness(&self, issued_at_ms: i64, now: DateTime<Utc>) -> Result<(), EnvelopeError> {
        let age_ms = now.timestamp_millis().saturating_sub(issued_at_ms);
        if age_ms > self.max_age_ms {
            return Err(EnvelopeError::Expired {
                age_secs: age_ms / 1_000,
                limit_secs: self.max_age_secs(),
            });
        }
        let ahead_ms = age_ms.saturating_neg();
        if ahead_ms > self.max_age_ms {
            return Err(EnvelopeError::NotYetValid {
                ahead_secs: ahead_ms / 1_000,
                limit_secs: self.max_age_secs(),
            });
        }
        Ok(())
    }

    /// Content validation followed by signature authenticity for the envelope's actor.
    pub fn validate_signed(
        &self,
        signed: &SignedEnvelope,
        expected: &ActionPayload,
        now: DateTime<Utc>,
        verifier: &dyn SignatureVerifier,
    ) -> Result<ActionEnvelope, EnvelopeCheckError> {
        let envelope = self.validate(signed, expected, now)?;
        verifier.verify(
            &envelope.actor_identity(),
            signed.signed_message.as_bytes(),
            &signed.signature,
        )?;
        Ok(envelope)
    }
}

/// Either half of a full envelope check.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeCheckError {
    #[error(transparent)]
    Content(#[from] EnvelopeError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

fn check_payload_fields(
    expected: &ActionPayload,
    signed_fields: &Map<String, Value>,
) -> Result<(), EnvelopeError> {
    let expected_value =
        serde_json::to_value(expected).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    let Value::Object(expected_fields) = expected_value else {
        return Err(EnvelopeError::Malformed("expected payload is not an object".into()));
    };

    for (field, expected_field) in expected_fields.iter().filter(|(k, _)| *k != "action") {
        if signed_fields.get(field) != Some(expected_field) {
            return Err(EnvelopeError::PayloadMismatch {
                field: field.clone(),
            });
        }
    }
    Ok(())
}

/// Verifies that `signature` over `message` was produced by `signer`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signer: &Address, message: &[u8], signature: &str)
        -> Result<(), SignatureError>;
}

/// Ed25519 verification against keys registered per address.
#[derive(Debug, Clone, Default)]
pub struct Ed25519SignatureVerifier {
    keys: HashMap<String, VerifyingKey>,
}

impl Ed25519SignatureVerifier {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    pub fn register_key(&mut self, signer: &Address, key: VerifyingKey) {
        self.keys.insert(signer.canonical(), key);
    }

    pub fn register_key_hex(
        &mut self,
        signer: &Address,
        public_key_hex: &str,
    ) -> Result<(), SignatureError> {
        let bytes = decode_fixed::<32>(public_key_hex)?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::MalformedSignature(format!("public key: {e}")))?;
        self.register_key(signer, key);
        Ok(())
    }

    pub fn has_key(&self, signer: &Address) -> bool {
        self.keys.contains_key(&signer.canonical())
    }
}

impl SignatureVerifier for Ed25519SignatureVerifier {
    fn verify(
        &self,
        signer: &Address,
        message: &[u8],
        signature: &str,
    ) -> Result<(), SignatureError> {
        let key = self
            .keys
            .get(&signer.canonical())
            .ok_or_else(|| SignatureError::UnknownSigner(signer.to_string()))?;
        let bytes = decode_fixed::<64>(signature)?;
        key.verify(message, &Signature::from_bytes(&bytes))
            .map_err(|_| SignatureError::InvalidSignature(signer.to_string()))
    }
}

fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], SignatureError> {
    let trimmed = value.trim().trim_start_matches("0x");
    let bytes = hex::decode(trimmed)
        .map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;
    bytes.try_into().map_err(|raw: Vec<u8>| {
        SignatureError::MalformedSignature(format!("expected {N} bytes, got {}", raw.len()))
    })
}
