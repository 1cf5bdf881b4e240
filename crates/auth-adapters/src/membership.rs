//! # Dev membership prover
//!
//! HMAC-SHA256 stand-in for the rate-limiting nullifier circuit.
//!
//! A member is identified by a commitment, `sha256("commitment|" + secret)`.
//! Joining registers the commitment together with a member key derived from
//! the secret; the [`MembershipGroup`] plays the part of the membership
//! registry and is the only place verifiers learn keys from.
//!
//! - Nullifiers are `sha256("nullifier|" + commitment + "|" + epoch_tag)`.
//!   Verifiers recompute them, so a member cannot pick fresh ones to dodge
//!   a quota. They are stable per identity and window.
//! - The proof is an HMAC over group, signal and nullifiers, keyed by the
//!   member key. Seeing a member's proofs is not enough to mint new ones.
//!
//! Proofs reveal the commitment and anyone who can read the group can forge
//! proofs, so this gives rate limiting without anonymity between processes
//! that share one group. Use it for tests and local swarms only.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use domains::{
    sha256_hex, DomainError, NullifierInput, Proof, ProofSystem, PublicNullifier, Result,
    VerificationResult,
};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Identity commitments allowed to publish in a group, with the key each
/// member's proofs are checked against.
#[derive(Debug)]
pub struct MembershipGroup {
    id: String,
    members: DashMap<String, Arc<SecretString>>,
}

impl MembershipGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_member(&self, commitment: impl Into<String>, member_key: Arc<SecretString>) {
        self.members.insert(commitment.into(), member_key);
    }

    pub fn is_member(&self, commitment: &str) -> bool {
        self.members.contains_key(commitment)
    }

    fn member_key(&self, commitment: &str) -> Option<Arc<SecretString>> {
        self.members.get(commitment).map(|key| Arc::clone(key.value()))
    }

    /// Commitment published for the identity holding `secret`.
    pub fn commitment_for(secret: &str) -> String {
        sha256_hex(format!("commitment|{secret}").as_bytes())
    }

    fn member_key_for(secret: &str) -> String {
        sha256_hex(format!("member-key|{secret}").as_bytes())
    }

    /// The only nullifier `commitment` can use in the window of `epoch_tag`.
    pub fn nullifier_for(commitment: &str, epoch_tag: &str) -> String {
        sha256_hex(format!("nullifier|{commitment}|{epoch_tag}").as_bytes())
    }
}

pub struct DevMembershipProver {
    member_key: Arc<SecretString>,
    commitment: String,
    group: Arc<MembershipGroup>,
}

impl std::fmt::Debug for DevMembershipProver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevMembershipProver")
            .field("commitment", &self.commitment)
            .field("group", &self.group.id)
            .finish_non_exhaustive()
    }
}

impl DevMembershipProver {
    pub fn new(secret: SecretString, group: Arc<MembershipGroup>) -> Self {
        let commitment = MembershipGroup::commitment_for(secret.expose_secret());
        let member_key = MembershipGroup::member_key_for(secret.expose_secret());
        Self {
            member_key: Arc::new(SecretString::from(member_key)),
            commitment,
            group,
        }
    }

    /// Builds a prover and registers its identity in `group`.
    pub fn join(secret: SecretString, group: Arc<MembershipGroup>) -> Self {
        let prover = Self::new(secret, group);
        prover
            .group
            .add_member(prover.commitment.clone(), Arc::clone(&prover.member_key));
        prover
    }

    pub fn commitment(&self) -> &str {
        &self.commitment
    }
}

fn new_mac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| DomainError::Proof(e.to_string()))
}

fn hmac_hex(key: &[u8], data: &[u8]) -> Result<String> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Bytes the proof MAC is computed over.
fn proof_material(group_id: &str, signal: &str, nullifiers: &[PublicNullifier]) -> Result<Vec<u8>> {
    let mut material = format!("{group_id}|{signal}|").into_bytes();
    material.extend(serde_json::to_vec(nullifiers)?);
    Ok(material)
}

#[async_trait]
impl ProofSystem for DevMembershipProver {
    async fn create_proof(
        &self,
        signal: &str,
        inputs: &[NullifierInput],
        group_id: &str,
    ) -> Result<Proof> {
        if group_id != self.group.id() {
            return Err(DomainError::Proof(format!("not a member of group {group_id}")));
        }
        if !self.group.is_member(&self.commitment) {
            return Err(DomainError::Proof("identity is not registered".into()));
        }
        let mut nullifiers = Vec::with_capacity(inputs.len());
        for input in inputs {
            if input.message_id == 0 || input.message_id > input.message_limit {
                return Err(DomainError::Proof(format!(
                    "message id {} outside 1..={} for {}",
                    input.message_id, input.message_limit, input.epoch_tag
                )));
            }
            nullifiers.push(PublicNullifier {
                epoch_tag: input.epoch_tag.clone(),
                message_limit: input.message_limit,
                nullifier: MembershipGroup::nullifier_for(&self.commitment, &input.epoch_tag),
            });
        }
        let material = proof_material(group_id, signal, &nullifiers)?;
        let mac = hmac_hex(self.member_key.expose_secret().as_bytes(), &material)?;
        Ok(Proof {
            group_id: group_id.to_string(),
            signal: signal.to_string(),
            nullifiers,
            proof: format!("{}:{}", self.commitment, mac),
        })
    }

    async fn verify_proof(&self, proof: &Proof, group_id: &str) -> Result<VerificationResult> {
        if proof.group_id != group_id || group_id != self.group.id() {
            return Ok(VerificationResult::Invalid);
        }
        let Some((commitment, mac_hex)) = proof.proof.split_once(':') else {
            return Ok(VerificationResult::Invalid);
        };
        let Some(member_key) = self.group.member_key(commitment) else {
            debug!(%commitment, "proof from unknown member");
            return Ok(VerificationResult::Invalid);
        };
        if proof
            .nullifiers
            .iter()
            .any(|n| n.nullifier != MembershipGroup::nullifier_for(commitment, &n.epoch_tag))
        {
            debug!(%commitment, "nullifier not derived from the member's commitment");
            return Ok(VerificationResult::Invalid);
        }
        let Ok(expected) = hex::decode(mac_hex) else {
            return Ok(VerificationResult::Invalid);
        };
        let mut mac = new_mac(member_key.expose_secret().as_bytes())?;
        mac.update(&proof_material(&proof.group_id, &proof.signal, &proof.nullifiers)?);
        Ok(match mac.verify_slice(&expected) {
            Ok(()) => VerificationResult::Valid,
            Err(_) => VerificationResult::Invalid,
        })
    }
}
