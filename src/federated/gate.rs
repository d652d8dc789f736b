//! Optional proof-verification gate in front of `submit_update`.
//!
//! An external verifier (e.g. a zero-knowledge proof service) vouches for a
//! participant's contribution before it reaches the coordinator. Without a
//! verifier the gate passes every submission through.

use crate::core::{Error, Hash256, ParticipantId, Result, RoundId};
use crate::federated::coordinator::{Coordinator, SubmitOutcome};
use crate::federated::weights::WeightSet;
use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Contribution metadata presented to a verifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContributionClaim {
    pub round_id: RoundId,
    pub participant_id: ParticipantId,
    /// Commitment to the raw (pre-noise) update
    pub digest: Hash256,
    pub layer_count: usize,
    pub parameter_count: usize,
    /// Opaque proof bytes supplied by the participant
    pub proof: Vec<u8>,
}

impl ContributionClaim {
    /// Describe an update together with its proof.
    pub fn for_update(update: &WeightSet, proof: Vec<u8>) -> Self {
        Self {
            round_id: update.round_id(),
            participant_id: update.owner_id().to_string(),
            digest: update.digest(),
            layer_count: update.layers().len(),
            parameter_count: update.parameter_count(),
            proof,
        }
    }
}

/// External verdict on a contribution claim.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    /// Return `Ok(false)` for an invalid proof; errors are for verifier faults.
    async fn verify(&self, claim: &ContributionClaim) -> Result<bool>;
}

/// Wraps a coordinator with an optional verifier.
pub struct ProofGate {
    coordinator: Arc<Coordinator>,
    verifier: Option<Arc<dyn ProofVerifier>>,
}

impl ProofGate {
    /// Create a pass-through gate.
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            verifier: None,
        }
    }

    /// Require proofs checked by `verifier`.
    pub fn with_verifier(mut self, verifier: Arc<dyn ProofVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn is_enforcing(&self) -> bool {
        self.verifier.is_some()
    }

    /// Verify the proof, then hand the update to the coordinator.
    ///
    /// A rejected proof leaves the round untouched.
    pub async fn submit_update(
        &self,
        round_id: RoundId,
        update: WeightSet,
        privacy_budget: f64,
        proof: Vec<u8>,
    ) -> Result<SubmitOutcome> {
        if let Some(verifier) = &self.verifier {
            let claim = ContributionClaim::for_update(&update, proof);
            if !verifier.verify(&claim).await? {
                tracing::warn!(
                    %round_id,
                    participant_id = %claim.participant_id,
                    digest = %claim.digest,
                    "contribution proof rejected"
                );
                return Err(Error::ProofRejected {
                    round_id,
                    participant_id: claim.participant_id,
                });
            }
        }

        // aggregation is CPU-bound and runs under a blocking mutex
        let coordinator = self.coordinator.clone();
        tokio::task::spawn_blocking(move || {
            coordinator.submit_update(&round_id, update, privacy_budget)
        })
        .await
        .map_err(|e| Error::Internal(format!("submission task failed: {e}")))?
    }
}

/// Verifier accepting ed25519 signatures over the claim digest.
#[derive(Default)]
pub struct SignatureVerifier {
    keys: RwLock<HashMap<ParticipantId, VerifyingKey>>,
}

impl SignatureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant's public key.
    pub fn register(&self, participant_id: &str, public_key: &[u8; 32]) -> Result<()> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| Error::InvalidKeyFormat(e.to_string()))?;
        self.keys
            .write()
            .map_err(|_| Error::Internal("key registry lock poisoned".to_string()))?
            .insert(participant_id.to_string(), key);
        Ok(())
    }

    pub fn is_registered(&self, participant_id: &str) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(participant_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ProofVerifier for SignatureVerifier {
    async fn verify(&self, claim: &ContributionClaim) -> Result<bool> {
        let key = {
            let keys = self
                .keys
                .read()
                .map_err(|_| Error::Internal("key registry lock poisoned".to_string()))?;
            match keys.get(&claim.participant_id) {
                Some(key) => *key,
                None => return Ok(false),
            }
        };
        let sig_bytes: [u8; 64] = match claim.proof.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        let signature = Signature::from_bytes(&sig_bytes);
        Ok(key.verify(claim.digest.as_bytes(), &signature).is_ok())
    }
}

/// Participant-side helper: sign an update's digest.
pub fn sign_update(signing_key: &SigningKey, update: &WeightSet) -> Vec<u8> {
    signing_key
        .sign(update.digest().as_bytes())
        .to_bytes()
        .to_vec()
}
