//! Differential privacy filter applied to incoming updates.
//!
//! Noise scale grows as the privacy budget (epsilon) shrinks.

use crate::core::{Error, NoiseMechanism, PrivacyConfig, Result};
use crate::federated::weights::{Layer, Layers, WeightSet};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Adds calibrated random noise to every layer of a weight set.
#[derive(Clone, Debug, Default)]
pub struct PrivacyFilter {
    config: PrivacyConfig,
}

impl PrivacyFilter {
    /// Create a filter with the given calibration.
    pub fn new(config: PrivacyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    /// Noise scale for a budget: sigma for Gaussian, b for Laplace.
    pub fn noise_scale(&self, privacy_budget: f64) -> Result<f64> {
        if !(privacy_budget.is_finite() && privacy_budget > 0.0) {
            return Err(Error::InvalidPrivacyBudget(privacy_budget));
        }
        let sensitivity = self.config.sensitivity;
        Ok(match self.config.mechanism {
            NoiseMechanism::Gaussian => {
                sensitivity * (2.0 * (1.25 / self.config.delta).ln()).sqrt() / privacy_budget
            }
            NoiseMechanism::Laplace => sensitivity / privacy_budget,
        })
    }

    /// Return a noised copy of `weight_set`; the input is left untouched.
    pub fn apply(&self, weight_set: &WeightSet, privacy_budget: f64) -> Result<WeightSet> {
        let noise = self.noise(privacy_budget)?;
        let mut rng = rand::thread_rng();

        let mut layers = Layers::new();
        for (name, layer) in weight_set.layers() {
            let values = layer
                .values()
                .iter()
                .map(|v| v + noise.sample(&mut rng))
                .collect();
            layers.insert(name.clone(), Layer::new(layer.shape().to_vec(), values)?);
        }

        Ok(weight_set
            .derive(layers)
            .with_metadata("privacy_budget", privacy_budget))
    }

    fn noise(&self, privacy_budget: f64) -> Result<Noise> {
        let scale = self.noise_scale(privacy_budget)?;
        Ok(match self.config.mechanism {
            NoiseMechanism::Gaussian => Noise::Gaussian(
                Normal::new(0.0, scale).map_err(|e| Error::InvalidConfig(e.to_string()))?,
            ),
            NoiseMechanism::Laplace => Noise::Laplace(scale),
        })
    }
}

enum Noise {
    Gaussian(Normal<f64>),
    /// Scale b of a zero-centred Laplace distribution
    Laplace(f64),
}

impl Noise {
    fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match self {
            Noise::Gaussian(normal) => normal.sample(rng),
            Noise::Laplace(scale) => {
                let u: f64 = rng.gen::<f64>() - 0.5;
                -scale * u.signum() * (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE).ln()
            }
        }
    }
}
