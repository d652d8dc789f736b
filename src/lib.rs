//! # fedround - Federated Learning Round Coordinator
//!
//! Coordinates privacy-preserving model training across data holders that
//! never share raw records:
//! - **Rounds**: roster admission, one update per participant, lifecycle
//! - **Privacy**: differential privacy noise on every submitted update
//! - **Aggregation**: federated averaging and convergence tracking
//! - **Gate**: optional proof verification in front of submissions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fedround::core::CoordinatorConfig;
//! use fedround::federated::{Coordinator, WeightSet};
//!
//! fn main() -> fedround::Result<()> {
//!     let coordinator = Coordinator::new(CoordinatorConfig::default())?;
//!     let round_id = coordinator.create_round("oncology", 2)?;
//!     coordinator.join_round(&round_id, "hospital-a")?;
//!     coordinator.join_round(&round_id, "hospital-b")?;
//!
//!     let update = WeightSet::from_vectors("hospital-a", round_id, [("w", vec![0.1, 0.2])]);
//!     coordinator.submit_update(&round_id, update, 1.0)?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod federated;
pub mod monitoring;

pub use crate::core::error::{Error, Result};
