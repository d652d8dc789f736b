//! Error types for the round coordinator.

use crate::core::types::{ParticipantId, RoundId};
use crate::federated::round::RoundState;
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating federated rounds.
#[derive(Error, Debug)]
pub enum Error {
    // Registry errors
    #[error("Round not found: {0}")]
    RoundNotFound(RoundId),

    #[error("Round {round_id} is closed (status: {status})")]
    RoundClosed { round_id: RoundId, status: RoundState },

    #[error("Round {0} is still active")]
    RoundActive(RoundId),

    #[error("Update stamped for round {found}, submitted to round {expected}")]
    RoundMismatch { expected: RoundId, found: RoundId },

    // Participant errors
    #[error("Participant {participant_id} has not joined round {round_id}")]
    UnknownParticipant {
        round_id: RoundId,
        participant_id: ParticipantId,
    },

    #[error("Participant {participant_id} already submitted an update for round {round_id}")]
    DuplicateUpdate {
        round_id: RoundId,
        participant_id: ParticipantId,
    },

    #[error("Contribution proof rejected for {participant_id} in round {round_id}")]
    ProofRejected {
        round_id: RoundId,
        participant_id: ParticipantId,
    },

    // Privacy errors
    #[error("Invalid privacy budget: {0} (must be finite and > 0)")]
    InvalidPrivacyBudget(f64),

    // Aggregation errors
    #[error("Cannot aggregate an empty set of updates")]
    EmptyAggregation,

    #[error("Incompatible shape for layer '{layer}': expected {expected:?}, found {found:?}")]
    IncompatibleShape {
        layer: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Invalid layer: {0}")]
    InvalidLayer(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_closed_message() {
        let round_id = RoundId::new();
        let err = Error::RoundClosed {
            round_id,
            status: RoundState::Completed,
        };
        let msg = err.to_string();
        assert!(msg.contains(&round_id.to_string()));
        assert!(msg.contains("completed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
