//! Core utilities and common types for the coordinator.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CoordinatorConfig, LateJoinPolicy, NoiseMechanism, PrivacyConfig};
pub use error::{Error, Result};
pub use types::*;
