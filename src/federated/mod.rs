//! Federated Learning Module
//!
//! Round orchestration for privacy-preserving multi-site training:
//! - Immutable weight sets exchanged between sites and the coordinator
//! - Differential privacy noise on every incoming update
//! - Per-round state machine with exactly-once aggregation
//! - FedAvg aggregation and convergence tracking
//! - Optional proof-verification gate in front of submissions

pub mod aggregator;
pub mod coordinator;
pub mod gate;
pub mod privacy;
pub mod round;
pub mod store;
pub mod weights;

pub use aggregator::AggregationEngine;
pub use coordinator::{Coordinator, JoinResult, StudyProgress, SubmitOutcome};
pub use gate::{ContributionClaim, ProofGate, ProofVerifier, SignatureVerifier};
pub use privacy::PrivacyFilter;
pub use round::{Round, RoundState, RoundStatus, RoundSummary, UpdateOutcome};
pub use store::RoundStore;
pub use weights::{Layer, Layers, WeightSet};
