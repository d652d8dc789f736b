//! Coordinator configuration.
//!
//! Configuration-driven round policy and privacy calibration.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Whether participants may join a round after training has started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateJoinPolicy {
    /// Joins are only accepted while the round is waiting
    Reject,
    /// Joins are also accepted during training; the completion target grows
    Allow,
}

impl Default for LateJoinPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

/// Noise distribution used by the privacy filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseMechanism {
    /// Gaussian mechanism, (epsilon, delta)-DP
    Gaussian,
    /// Laplace mechanism, pure epsilon-DP
    Laplace,
}

impl Default for NoiseMechanism {
    fn default() -> Self {
        Self::Gaussian
    }
}

/// Differential privacy calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Noise distribution
    pub mechanism: NoiseMechanism,
    /// L1/L2 sensitivity assumed for a single contribution
    pub sensitivity: f64,
    /// Failure probability for the Gaussian mechanism
    pub delta: f64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            mechanism: NoiseMechanism::Gaussian,
            sensitivity: 1.0,
            delta: 1e-5,
        }
    }
}

/// Coordinator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Roster size used when a round is created without an explicit minimum
    pub default_min_participants: usize,
    /// Late joiner handling
    pub late_join: LateJoinPolicy,
    /// Privacy filter calibration
    pub privacy: PrivacyConfig,
    /// Mean absolute difference below which a study is considered converged
    pub convergence_threshold: f64,
    /// Upper bound on rounds scheduled for one study
    pub max_rounds_per_study: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_min_participants: 3,
            late_join: LateJoinPolicy::Reject,
            privacy: PrivacyConfig::default(),
            convergence_threshold: 0.01,
            max_rounds_per_study: 10,
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.default_min_participants == 0 {
            return Err(Error::InvalidConfig(
                "default_min_participants must be at least 1".to_string(),
            ));
        }
        if !(self.privacy.sensitivity.is_finite() && self.privacy.sensitivity > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "privacy.sensitivity must be positive, got {}",
                self.privacy.sensitivity
            )));
        }
        if !(self.privacy.delta > 0.0 && self.privacy.delta < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "privacy.delta must lie in (0, 1), got {}",
                self.privacy.delta
            )));
        }
        if !(self.convergence_threshold >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "convergence_threshold must be non-negative, got {}",
                self.convergence_threshold
            )));
        }
        if self.max_rounds_per_study == 0 {
            return Err(Error::InvalidConfig(
                "max_rounds_per_study must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_min_participants, 3);
        assert_eq!(config.late_join, LateJoinPolicy::Reject);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CoordinatorConfig::from_json_str(
            r#"{"late_join": "allow", "privacy": {"mechanism": "laplace"}}"#,
        )
        .unwrap();
        assert_eq!(config.late_join, LateJoinPolicy::Allow);
        assert_eq!(config.privacy.mechanism, NoiseMechanism::Laplace);
        assert!((config.privacy.sensitivity - 1.0).abs() < 1e-12);
        assert_eq!(config.max_rounds_per_study, 10);
    }

    #[test]
    fn test_rejects_zero_min_participants() {
        let result = CoordinatorConfig::from_json_str(r#"{"default_min_participants": 0}"#);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_delta() {
        let mut config = CoordinatorConfig::default();
        config.privacy.delta = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = CoordinatorConfig::from_file("/nonexistent/fedround.json");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
