//! Round coordinator.
//!
//! Entry point for the outer service layer: creates rounds, routes joins
//! and submissions, runs aggregation once per round and keeps the
//! active/completed registry current.

use crate::core::{CoordinatorConfig, Error, ParticipantId, Result, RoundId};
use crate::federated::aggregator::AggregationEngine;
use crate::federated::privacy::PrivacyFilter;
use crate::federated::round::{Round, RoundState, RoundStatus, RoundSummary, UpdateOutcome};
use crate::federated::store::{lock_round, Located, RoundStore};
use crate::federated::weights::WeightSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of a join request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinResult {
    /// False when the participant was already on the roster
    pub accepted: bool,
    pub status: RoundState,
    pub participant_count: usize,
}

/// Result of an accepted submission.
#[derive(Clone, Debug)]
pub enum SubmitOutcome {
    /// Counted toward the round; more updates are expected
    Accepted { received: usize, expected: usize },
    /// This submission completed the round
    Completed { global_model: Arc<WeightSet> },
}

impl SubmitOutcome {
    pub fn global_model(&self) -> Option<&Arc<WeightSet>> {
        match self {
            SubmitOutcome::Completed { global_model } => Some(global_model),
            SubmitOutcome::Accepted { .. } => None,
        }
    }
}

/// What to do with a study after one of its rounds finished.
#[derive(Clone, Debug, PartialEq)]
pub enum StudyProgress {
    /// Successive global models are within the threshold
    Converged { distance: f64 },
    /// Another round is open for the study
    Continue { next_round: RoundId },
    /// The study used up its round allowance without converging
    RoundLimitReached,
    /// The evaluated round failed and produced no model
    Failed,
}

/// Coordinates federated rounds over a [`RoundStore`].
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<RoundStore>,
    privacy: PrivacyFilter,
    engine: AggregationEngine,
}

impl Coordinator {
    /// Create a coordinator with its own empty store.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(RoundStore::new()))
    }

    /// Create a coordinator over an existing store.
    pub fn with_store(config: CoordinatorConfig, store: Arc<RoundStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            privacy: PrivacyFilter::new(config.privacy.clone()),
            engine: AggregationEngine::new(),
            config,
            store,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RoundStore> {
        &self.store
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Open a new round in `waiting`.
    pub fn create_round(&self, study_type: &str, min_participants: usize) -> Result<RoundId> {
        let round = Round::new(study_type, min_participants).with_late_join(self.config.late_join);
        let round_id = round.round_id();
        let min_participants = round.min_participants();
        self.store.insert(round)?;

        tracing::info!(%round_id, study_type, min_participants, "created round");
        Ok(round_id)
    }

    /// Open a new round with the configured default roster size.
    pub fn create_round_default(&self, study_type: &str) -> Result<RoundId> {
        self.create_round(study_type, self.config.default_min_participants)
    }

    fn closed(round_id: RoundId, located: &Located) -> Result<Error> {
        let status = lock_round(located.round())?.status();
        Ok(Error::RoundClosed { round_id, status })
    }

    /// Add a participant to an active round.
    pub fn join_round(&self, round_id: &RoundId, participant_id: &str) -> Result<JoinResult> {
        let located = self.store.locate(round_id)?;
        if !located.is_active() {
            return Err(Self::closed(*round_id, &located)?);
        }

        let mut round = lock_round(located.round())?;
        let accepted = round.add_participant(participant_id)?;
        Ok(JoinResult {
            accepted,
            status: round.status(),
            participant_count: round.participant_count(),
        })
    }

    /// Noise an update, store it, and aggregate if it was the last one.
    ///
    /// Completion is decided inside the round's critical section, so racing
    /// submissions aggregate exactly once.
    pub fn submit_update(
        &self,
        round_id: &RoundId,
        update: WeightSet,
        privacy_budget: f64,
    ) -> Result<SubmitOutcome> {
        let located = self.store.locate(round_id)?;
        if !located.is_active() {
            return Err(Self::closed(*round_id, &located)?);
        }
        if update.round_id() != *round_id {
            return Err(Error::RoundMismatch {
                expected: *round_id,
                found: update.round_id(),
            });
        }

        let noised = self.privacy.apply(&update, privacy_budget)?;

        let mut round = lock_round(located.round())?;
        match round.add_update(noised)? {
            UpdateOutcome::Pending { received, expected } => {
                Ok(SubmitOutcome::Accepted { received, expected })
            }
            UpdateOutcome::ReadyToAggregate => {
                tracing::info!(
                    %round_id,
                    updates = round.update_count(),
                    "aggregating round"
                );
                let aggregated = self.engine.aggregate(round.updates()).map(|global| {
                    let study_type = round.study_type().to_string();
                    global.with_metadata("study_type", study_type)
                });

                let outcome = match aggregated {
                    Ok(global) => round.complete(global).map(|global_model| {
                        tracing::info!(%round_id, "completed round");
                        SubmitOutcome::Completed { global_model }
                    }),
                    Err(err) => {
                        round.fail();
                        tracing::error!(%round_id, error = %err, "aggregation failed, round marked failed");
                        Err(err)
                    }
                };
                drop(round);

                self.store.retire(round_id)?;
                outcome
            }
        }
    }

    /// Polling snapshot of any known round.
    pub fn get_round_status(&self, round_id: &RoundId) -> Result<RoundStatus> {
        let located = self.store.locate(round_id)?;
        let round = lock_round(located.round())?;
        Ok(round.snapshot())
    }

    /// Rounds that accept joins right now, oldest first.
    pub fn list_open_rounds(&self, study_type: Option<&str>) -> Result<Vec<RoundSummary>> {
        let mut open = Vec::new();
        for shared in self.store.active_rounds()? {
            let round = lock_round(&shared)?;
            if !round.is_joinable() {
                continue;
            }
            if study_type.map_or(true, |s| s == round.study_type()) {
                open.push(round.summary());
            }
        }
        open.sort_by_key(|s| s.created_at);
        Ok(open)
    }

    /// Global model of a completed round; `None` while unfinished or failed.
    pub fn global_model(&self, round_id: &RoundId) -> Result<Option<Arc<WeightSet>>> {
        let located = self.store.locate(round_id)?;
        let round = lock_round(located.round())?;
        Ok(round.global_model())
    }

    /// Caller-driven timeout: fail an unfinished round and retire it.
    pub fn expire_round(&self, round_id: &RoundId) -> Result<RoundStatus> {
        let located = self.store.locate(round_id)?;
        if !located.is_active() {
            return Err(Self::closed(*round_id, &located)?);
        }

        let snapshot = {
            let mut round = lock_round(located.round())?;
            if !round.expire() {
                return Err(Error::RoundClosed {
                    round_id: *round_id,
                    status: round.status(),
                });
            }
            round.snapshot()
        };
        self.store.retire(round_id)?;

        tracing::info!(
            %round_id,
            participants = snapshot.participant_count,
            updates = snapshot.update_count,
            "expired round"
        );
        Ok(snapshot)
    }

    /// Active rounds still waiting after `max_age`.
    pub fn stale_rounds(&self, max_age: chrono::Duration) -> Result<Vec<RoundSummary>> {
        let mut stale = Vec::new();
        for shared in self.store.active_rounds()? {
            let round = lock_round(&shared)?;
            if round.status() == RoundState::Waiting && round.age() > max_age {
                stale.push(round.summary());
            }
        }
        stale.sort_by_key(|s| s.created_at);
        Ok(stale)
    }

    /// Drop a finished round from the registry, returning its final status.
    pub fn archive_round(&self, round_id: &RoundId) -> Result<RoundStatus> {
        if self.store.locate(round_id)?.is_active() {
            return Err(Error::RoundActive(*round_id));
        }
        let shared = self
            .store
            .remove_completed(round_id)?
            .ok_or(Error::RoundNotFound(*round_id))?;
        let snapshot = lock_round(&shared)?.snapshot();

        tracing::info!(%round_id, status = %snapshot.status, "archived round");
        Ok(snapshot)
    }

    /// Decide whether a study needs another round after `round_id` finished.
    ///
    /// Compares this round's global model with the latest earlier completed
    /// round of the same study. Evaluating the same round twice returns the
    /// round opened the first time. Rounds created directly through
    /// [`Coordinator::create_round`] never count as a scheduled next round,
    /// though they do count toward the study's round limit.
    pub fn evaluate_study(&self, round_id: &RoundId) -> Result<StudyProgress> {
        let located = self.store.locate(round_id)?;
        if located.is_active() {
            return Err(Error::RoundActive(*round_id));
        }
        let (study_type, min_participants, status, current) = {
            let round = lock_round(located.round())?;
            (
                round.study_type().to_string(),
                round.min_participants(),
                round.status(),
                round.global_model(),
            )
        };
        let current = match (status, current) {
            (RoundState::Completed, Some(model)) => model,
            _ => return Ok(StudyProgress::Failed),
        };

        if let Some(next_round) = self.store.successor(round_id)? {
            return Ok(StudyProgress::Continue { next_round });
        }

        let history = self.store.study_history(&study_type)?;
        let position = history
            .iter()
            .position(|id| id == round_id)
            .ok_or(Error::RoundNotFound(*round_id))?;

        if let Some(previous) = self.previous_global(&history[..position])? {
            let distance = self.engine.distance(&previous, &current)?;
            if distance <= self.config.convergence_threshold {
                tracing::info!(%round_id, study_type = %study_type, distance, "study converged");
                return Ok(StudyProgress::Converged { distance });
            }
        }

        let rounds = self.store.study_round_count(&study_type)?;
        if rounds >= self.config.max_rounds_per_study {
            tracing::warn!(
                %round_id,
                study_type = %study_type,
                rounds,
                "study hit round limit"
            );
            return Ok(StudyProgress::RoundLimitReached);
        }

        let next_round = self
            .store
            .schedule_successor(round_id, || self.create_round(&study_type, min_participants))?;
        Ok(StudyProgress::Continue { next_round })
    }

    fn previous_global(&self, earlier: &[RoundId]) -> Result<Option<Arc<WeightSet>>> {
        for id in earlier.iter().rev() {
            let located = match self.store.locate(id) {
                Ok(located) => located,
                Err(Error::RoundNotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let model = lock_round(located.round())?.global_model();
            if let Some(model) = model {
                return Ok(Some(model));
            }
        }
        Ok(None)
    }

    /// Participants on a round's roster.
    pub fn participants(&self, round_id: &RoundId) -> Result<Vec<ParticipantId>> {
        let located = self.store.locate(round_id)?;
        let round = lock_round(located.round())?;
        Ok(round.participants().iter().cloned().collect())
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        let config = CoordinatorConfig::default();
        Self {
            privacy: PrivacyFilter::new(config.privacy.clone()),
            engine: AggregationEngine::new(),
            config,
            store: Arc::new(RoundStore::new()),
        }
    }
}
