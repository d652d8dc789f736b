//! Training round state machine.
//!
//! `waiting -> training -> aggregating -> completed`, with `failed`
//! reachable from `aggregating` (bad shapes) or from any non-terminal
//! state when the caller expires the round.

use crate::core::{now, Error, LateJoinPolicy, ParticipantId, Result, RoundId, Timestamp};
use crate::federated::weights::WeightSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Lifecycle status of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundState {
    /// Roster below the minimum
    Waiting,
    /// Roster complete, collecting updates
    Training,
    /// Every update in, averaging underway
    Aggregating,
    /// Global model available
    Completed,
    /// Aggregation error or expiry
    Failed,
}

impl RoundState {
    /// No further joins or submissions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundState::Completed | RoundState::Failed)
    }

    /// Closed for new updates.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            RoundState::Aggregating | RoundState::Completed | RoundState::Failed
        )
    }
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoundState::Waiting => write!(f, "waiting"),
            RoundState::Training => write!(f, "training"),
            RoundState::Aggregating => write!(f, "aggregating"),
            RoundState::Completed => write!(f, "completed"),
            RoundState::Failed => write!(f, "failed"),
        }
    }
}

/// What happened to an accepted update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Stored; more updates are still expected
    Pending { received: usize, expected: usize },
    /// Stored as the last expected update; the round is now aggregating
    ReadyToAggregate,
}

/// Read-only projection of a round, used for polling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundStatus {
    pub round_id: RoundId,
    pub study_type: String,
    pub status: RoundState,
    pub min_participants: usize,
    pub participant_count: usize,
    pub update_count: usize,
    pub has_global_model: bool,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

/// Listing entry for a round that can be joined.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_id: RoundId,
    pub study_type: String,
    pub status: RoundState,
    pub current_participants: usize,
    pub min_participants: usize,
    pub created_at: Timestamp,
}

/// One training round of one study.
#[derive(Debug)]
pub struct Round {
    round_id: RoundId,
    study_type: String,
    min_participants: usize,
    late_join: LateJoinPolicy,
    status: RoundState,
    participants: BTreeSet<ParticipantId>,
    updates: BTreeMap<ParticipantId, WeightSet>,
    global_model: Option<Arc<WeightSet>>,
    created_at: Timestamp,
    completed_at: Option<Timestamp>,
}

impl Round {
    /// Create a waiting round. A minimum of zero is raised to one.
    pub fn new(study_type: impl Into<String>, min_participants: usize) -> Self {
        Self::with_id(RoundId::new(), study_type, min_participants)
    }

    /// Create a waiting round with a caller-chosen id.
    pub fn with_id(round_id: RoundId, study_type: impl Into<String>, min_participants: usize) -> Self {
        Self {
            round_id,
            study_type: study_type.into(),
            min_participants: min_participants.max(1),
            late_join: LateJoinPolicy::default(),
            status: RoundState::Waiting,
            participants: BTreeSet::new(),
            updates: BTreeMap::new(),
            global_model: None,
            created_at: now(),
            completed_at: None,
        }
    }

    /// Set late joiner handling.
    pub fn with_late_join(mut self, policy: LateJoinPolicy) -> Self {
        self.late_join = policy;
        self
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn study_type(&self) -> &str {
        &self.study_type
    }

    pub fn min_participants(&self) -> usize {
        self.min_participants
    }

    pub fn status(&self) -> RoundState {
        self.status
    }

    pub fn participants(&self) -> &BTreeSet<ParticipantId> {
        &self.participants
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    pub fn global_model(&self) -> Option<Arc<WeightSet>> {
        self.global_model.clone()
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<Timestamp> {
        self.completed_at
    }

    /// Time since creation.
    pub fn age(&self) -> chrono::Duration {
        now() - self.created_at
    }

    /// Submitted updates in participant order.
    pub fn updates(&self) -> impl Iterator<Item = &WeightSet> {
        self.updates.values()
    }

    /// Whether a new participant would be admitted right now.
    pub fn is_joinable(&self) -> bool {
        match self.status {
            RoundState::Waiting => true,
            RoundState::Training => self.late_join == LateJoinPolicy::Allow,
            _ => false,
        }
    }

    /// Compare-and-set on the status. Returns false if `from` no longer holds.
    fn transition(&mut self, from: RoundState, to: RoundState) -> bool {
        if self.status != from {
            return false;
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(now());
        }
        true
    }

    fn closed(&self) -> Error {
        Error::RoundClosed {
            round_id: self.round_id,
            status: self.status,
        }
    }

    /// Admit a participant. Re-joining returns `Ok(false)`.
    pub fn add_participant(&mut self, participant_id: &str) -> Result<bool> {
        if self.status.is_closed() {
            return Err(self.closed());
        }
        if self.participants.contains(participant_id) {
            return Ok(false);
        }
        if !self.is_joinable() {
            return Err(self.closed());
        }

        self.participants.insert(participant_id.to_string());
        tracing::info!(
            round_id = %self.round_id,
            participant_id,
            participants = self.participants.len(),
            "participant joined round"
        );

        if self.participants.len() >= self.min_participants
            && self.transition(RoundState::Waiting, RoundState::Training)
        {
            tracing::info!(
                round_id = %self.round_id,
                participants = self.participants.len(),
                "round started training"
            );
        }
        Ok(true)
    }

    /// All joined participants have submitted and the roster is full.
    pub fn is_complete(&self) -> bool {
        self.updates.len() == self.participants.len()
            && self.participants.len() >= self.min_participants
    }

    /// Store an update. The last expected one flips the round to
    /// `aggregating` and is reported as [`UpdateOutcome::ReadyToAggregate`]
    /// exactly once.
    pub fn add_update(&mut self, weight_set: WeightSet) -> Result<UpdateOutcome> {
        if self.status.is_closed() {
            return Err(self.closed());
        }
        if weight_set.round_id() != self.round_id {
            return Err(Error::RoundMismatch {
                expected: self.round_id,
                found: weight_set.round_id(),
            });
        }
        let participant_id = weight_set.owner_id().to_string();
        if !self.participants.contains(&participant_id) {
            return Err(Error::UnknownParticipant {
                round_id: self.round_id,
                participant_id,
            });
        }
        if self.updates.contains_key(&participant_id) {
            return Err(Error::DuplicateUpdate {
                round_id: self.round_id,
                participant_id,
            });
        }

        self.updates.insert(participant_id.clone(), weight_set);
        tracing::debug!(
            round_id = %self.round_id,
            participant_id = %participant_id,
            received = self.updates.len(),
            expected = self.participants.len(),
            "update accepted"
        );

        if self.is_complete() && self.transition(RoundState::Training, RoundState::Aggregating) {
            return Ok(UpdateOutcome::ReadyToAggregate);
        }
        Ok(UpdateOutcome::Pending {
            received: self.updates.len(),
            expected: self.participants.len().max(self.min_participants),
        })
    }

    /// Record the aggregated model and finish the round.
    pub fn complete(&mut self, global_model: WeightSet) -> Result<Arc<WeightSet>> {
        if !self.transition(RoundState::Aggregating, RoundState::Completed) {
            return Err(self.closed());
        }
        let global_model = Arc::new(global_model);
        self.global_model = Some(global_model.clone());
        Ok(global_model)
    }

    /// Mark a failed aggregation.
    pub fn fail(&mut self) -> bool {
        self.transition(RoundState::Aggregating, RoundState::Failed)
    }

    /// Abandon a round that never finished. Terminal rounds are left alone.
    pub fn expire(&mut self) -> bool {
        let from = self.status;
        if from.is_terminal() {
            return false;
        }
        self.transition(from, RoundState::Failed)
    }

    /// Polling snapshot.
    pub fn snapshot(&self) -> RoundStatus {
        RoundStatus {
            round_id: self.round_id,
            study_type: self.study_type.clone(),
            status: self.status,
            min_participants: self.min_participants,
            participant_count: self.participants.len(),
            update_count: self.updates.len(),
            has_global_model: self.global_model.is_some(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }

    /// Listing entry.
    pub fn summary(&self) -> RoundSummary {
        RoundSummary {
            round_id: self.round_id,
            study_type: self.study_type.clone(),
            status: self.status,
            current_participants: self.participants.len(),
            min_participants: self.min_participants,
            created_at: self.created_at,
        }
    }
}
