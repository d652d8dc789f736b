//! Round registry.
//!
//! Holds the disjoint `active` and `completed` maps plus the per-study
//! round history. Each round sits behind its own mutex so unrelated
//! studies never contend on a shared lock.

use crate::core::{Error, Result, RoundId};
use crate::federated::round::Round;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A round shared between request handlers.
pub type SharedRound = Arc<Mutex<Round>>;

/// Where a round was found.
#[derive(Clone, Debug)]
pub enum Located {
    Active(SharedRound),
    Completed(SharedRound),
}

impl Located {
    pub fn round(&self) -> &SharedRound {
        match self {
            Located::Active(r) | Located::Completed(r) => r,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Located::Active(_))
    }
}

/// Rounds of one study still held by the store.
#[derive(Debug, Default)]
struct StudyHistory {
    rounds: Vec<RoundId>,
    /// Rounds ever opened, archived ones included
    opened: usize,
}

/// Registry of rounds. Create one per coordinator (or share one via `Arc`).
#[derive(Debug, Default)]
pub struct RoundStore {
    active: RwLock<HashMap<RoundId, SharedRound>>,
    completed: RwLock<HashMap<RoundId, SharedRound>>,
    studies: RwLock<HashMap<String, StudyHistory>>,
    /// Finished round -> round scheduled after it
    successors: RwLock<HashMap<RoundId, RoundId>>,
}

fn poisoned(what: &str) -> Error {
    Error::Internal(format!("{what} lock poisoned"))
}

/// Lock a round, mapping poisoning to an error.
pub fn lock_round(round: &SharedRound) -> Result<MutexGuard<'_, Round>> {
    round.lock().map_err(|_| poisoned("round"))
}

impl RoundStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> Result<RwLockReadGuard<'a, T>> {
        lock.read().map_err(|_| poisoned(what))
    }

    fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> Result<RwLockWriteGuard<'a, T>> {
        lock.write().map_err(|_| poisoned(what))
    }

    /// Register a new active round and append it to its study history.
    pub fn insert(&self, round: Round) -> Result<SharedRound> {
        let round_id = round.round_id();
        let study_type = round.study_type().to_string();
        let shared = Arc::new(Mutex::new(round));

        Self::write(&self.active, "active")?.insert(round_id, shared.clone());
        let mut studies = Self::write(&self.studies, "studies")?;
        let history = studies.entry(study_type).or_default();
        history.rounds.push(round_id);
        history.opened += 1;
        Ok(shared)
    }

    /// Find a round in either map.
    pub fn locate(&self, round_id: &RoundId) -> Result<Located> {
        if let Some(round) = Self::read(&self.active, "active")?.get(round_id) {
            return Ok(Located::Active(round.clone()));
        }
        if let Some(round) = Self::read(&self.completed, "completed")?.get(round_id) {
            return Ok(Located::Completed(round.clone()));
        }
        Err(Error::RoundNotFound(*round_id))
    }

    /// Move a round from active to completed. Returns false if it was not active.
    pub fn retire(&self, round_id: &RoundId) -> Result<bool> {
        // active before completed, everywhere both are held
        let mut active = Self::write(&self.active, "active")?;
        let mut completed = Self::write(&self.completed, "completed")?;
        match active.remove(round_id) {
            Some(round) => {
                completed.insert(*round_id, round);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Evict a finished round along with its history and successor links.
    pub fn remove_completed(&self, round_id: &RoundId) -> Result<Option<SharedRound>> {
        let removed = Self::write(&self.completed, "completed")?.remove(round_id);
        if removed.is_some() {
            for history in Self::write(&self.studies, "studies")?.values_mut() {
                history.rounds.retain(|id| id != round_id);
            }
            Self::write(&self.successors, "successors")?
                .retain(|prev, next| prev != round_id && next != round_id);
        }
        Ok(removed)
    }

    /// Round scheduled after `round_id`, if any.
    pub fn successor(&self, round_id: &RoundId) -> Result<Option<RoundId>> {
        Ok(Self::read(&self.successors, "successors")?.get(round_id).copied())
    }

    /// Return the round scheduled after `round_id`, calling `open` to create
    /// it if there is none yet. `open` runs at most once per round.
    pub fn schedule_successor<F>(&self, round_id: &RoundId, open: F) -> Result<RoundId>
    where
        F: FnOnce() -> Result<RoundId>,
    {
        // successors before active and studies
        let mut successors = Self::write(&self.successors, "successors")?;
        if let Some(next) = successors.get(round_id) {
            return Ok(*next);
        }
        let next = open()?;
        successors.insert(*round_id, next);
        Ok(next)
    }

    /// Handles to every active round.
    pub fn active_rounds(&self) -> Result<Vec<SharedRound>> {
        Ok(Self::read(&self.active, "active")?.values().cloned().collect())
    }

    /// Ids of a study's unarchived rounds in creation order.
    pub fn study_history(&self, study_type: &str) -> Result<Vec<RoundId>> {
        Ok(Self::read(&self.studies, "studies")?
            .get(study_type)
            .map(|h| h.rounds.clone())
            .unwrap_or_default())
    }

    /// Rounds ever opened for a study.
    pub fn study_round_count(&self, study_type: &str) -> Result<usize> {
        Ok(Self::read(&self.studies, "studies")?
            .get(study_type)
            .map_or(0, |h| h.opened))
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(Self::read(&self.active, "active")?.len())
    }

    pub fn completed_count(&self) -> Result<usize> {
        Ok(Self::read(&self.completed, "completed")?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_locate() {
        let store = RoundStore::new();
        let round = Round::new("oncology", 2);
        let id = round.round_id();
        store.insert(round).unwrap();

        assert!(store.locate(&id).unwrap().is_active());
        assert_eq!(store.active_count().unwrap(), 1);
        assert_eq!(store.study_history("oncology").unwrap(), vec![id]);
    }

    #[test]
    fn test_locate_missing() {
        let store = RoundStore::new();
        let id = RoundId::new();
        assert!(matches!(store.locate(&id), Err(Error::RoundNotFound(missing)) if missing == id));
    }

    #[test]
    fn test_retire_moves_once() {
        let store = RoundStore::new();
        let round = Round::new("oncology", 1);
        let id = round.round_id();
        store.insert(round).unwrap();

        assert!(store.retire(&id).unwrap());
        assert!(!store.retire(&id).unwrap());
        assert!(!store.locate(&id).unwrap().is_active());
        assert_eq!(store.active_count().unwrap(), 0);
        assert_eq!(store.completed_count().unwrap(), 1);
    }

    #[test]
    fn test_remove_completed() {
        let store = RoundStore::new();
        let round = Round::new("oncology", 1);
        let id = round.round_id();
        store.insert(round).unwrap();

        assert!(store.remove_completed(&id).unwrap().is_none());
        store.retire(&id).unwrap();
        assert!(store.remove_completed(&id).unwrap().is_some());
        assert!(store.locate(&id).is_err());
        assert!(store.study_history("oncology").unwrap().is_empty());
        assert_eq!(store.study_round_count("oncology").unwrap(), 1);
    }

    #[test]
    fn test_schedule_successor_opens_once() {
        let store = RoundStore::new();
        let round = Round::new("oncology", 1);
        let id = round.round_id();
        store.insert(round).unwrap();

        let next = store
            .schedule_successor(&id, || {
                let round = Round::new("oncology", 1);
                let next = round.round_id();
                store.insert(round)?;
                Ok(next)
            })
            .unwrap();
        let again = store
            .schedule_successor(&id, || panic!("successor opened twice"))
            .unwrap();

        assert_eq!(next, again);
        assert_eq!(store.successor(&id).unwrap(), Some(next));
        assert_eq!(store.study_round_count("oncology").unwrap(), 2);

        store.retire(&id).unwrap();
        store.remove_completed(&id).unwrap();
        assert_eq!(store.successor(&id).unwrap(), None);
    }
}
