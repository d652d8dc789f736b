//! Federated averaging and convergence checks.

use crate::core::{Error, Result};
use crate::federated::weights::{Layer, Layers, WeightSet};
use std::collections::BTreeSet;

/// Method tag written into global model metadata.
pub const FEDERATED_AVERAGE: &str = "federated_average";

/// Computes global models from per-participant updates.
#[derive(Clone, Debug, Default)]
pub struct AggregationEngine;

impl AggregationEngine {
    /// Create a new engine.
    pub fn new() -> Self {
        Self
    }

    /// Unweighted FedAvg over every layer name seen in any update.
    ///
    /// A layer missing from some updates is averaged over the updates that
    /// carry it. Differing shapes under one name fail the whole call.
    pub fn aggregate<'a, I>(&self, updates: I) -> Result<WeightSet>
    where
        I: IntoIterator<Item = &'a WeightSet>,
    {
        let updates: Vec<&WeightSet> = updates.into_iter().collect();
        let first = updates.first().ok_or(Error::EmptyAggregation)?;
        let round_id = first.round_id();

        let names: BTreeSet<&str> = updates.iter().flat_map(|u| u.layer_names()).collect();

        let mut layers = Layers::new();
        for name in names {
            let contributions = WeightSet::merge(updates.iter().copied(), name);
            layers.insert(name.to_string(), Self::mean_layer(name, &contributions)?);
        }

        tracing::info!(
            round_id = %round_id,
            participants = updates.len(),
            layers = layers.len(),
            "averaged weights"
        );

        Ok(WeightSet::global(round_id, layers)
            .with_metadata("participants", updates.len())
            .with_metadata("aggregation_method", FEDERATED_AVERAGE))
    }

    fn mean_layer(name: &str, contributions: &[&Layer]) -> Result<Layer> {
        let reference = contributions[0];
        let mut sums = vec![0.0f64; reference.len()];

        for layer in contributions {
            if layer.shape() != reference.shape() || layer.len() != reference.len() {
                return Err(Error::IncompatibleShape {
                    layer: name.to_string(),
                    expected: reference.shape().to_vec(),
                    found: layer.shape().to_vec(),
                });
            }
            for (sum, v) in sums.iter_mut().zip(layer.values()) {
                *sum += v;
            }
        }

        let count = contributions.len() as f64;
        let means = sums.into_iter().map(|s| s / count).collect();
        Layer::new(reference.shape().to_vec(), means)
    }

    /// Mean absolute difference over the layers both sets share.
    ///
    /// Returns infinity when the sets share no layer.
    pub fn distance(&self, previous: &WeightSet, current: &WeightSet) -> Result<f64> {
        let mut total = 0.0;
        let mut elements = 0usize;

        for (name, prev) in previous.layers() {
            let Some(curr) = current.layer(name) else {
                continue;
            };
            if prev.shape() != curr.shape() || prev.len() != curr.len() {
                return Err(Error::IncompatibleShape {
                    layer: name.clone(),
                    expected: prev.shape().to_vec(),
                    found: curr.shape().to_vec(),
                });
            }
            total += prev
                .values()
                .iter()
                .zip(curr.values())
                .map(|(a, b)| (a - b).abs())
                .sum::<f64>();
            elements += prev.len();
        }

        if elements == 0 {
            return Ok(f64::INFINITY);
        }
        Ok(total / elements as f64)
    }

    /// Whether successive global models are within `threshold`.
    pub fn converged(&self, previous: &WeightSet, current: &WeightSet, threshold: f64) -> Result<bool> {
        Ok(self.distance(previous, current)? <= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RoundId;

    fn set(owner: &str, round: RoundId, layers: &[(&str, Vec<f64>)]) -> WeightSet {
        WeightSet::from_vectors(owner, round, layers.iter().map(|(n, v)| (*n, v.clone())))
    }

    #[test]
    fn test_fedavg_exact() {
        let engine = AggregationEngine::new();
        let round = RoundId::new();
        let updates = vec![
            set("a", round, &[("w", vec![1.0, 3.0])]),
            set("b", round, &[("w", vec![2.0, 4.0])]),
        ];

        let global = engine.aggregate(&updates).unwrap();

        assert_eq!(global.layer("w").unwrap().values(), &[1.5, 3.5]);
        assert!(global.is_global());
        assert_eq!(global.round_id(), round);
        assert_eq!(global.metadata()["participants"], serde_json::json!(2));
    }

    #[test]
    fn test_empty_aggregation() {
        let engine = AggregationEngine::new();
        let updates: Vec<WeightSet> = Vec::new();
        assert!(matches!(
            engine.aggregate(&updates),
            Err(Error::EmptyAggregation)
        ));
    }

    #[test]
    fn test_partial_layers_averaged_over_holders() {
        let engine = AggregationEngine::new();
        let round = RoundId::new();
        let updates = vec![
            set("a", round, &[("w", vec![1.0]), ("bias", vec![4.0])]),
            set("b", round, &[("w", vec![3.0])]),
            set("c", round, &[("w", vec![5.0]), ("bias", vec![2.0])]),
        ];

        let global = engine.aggregate(&updates).unwrap();

        assert_eq!(global.layer("w").unwrap().values(), &[3.0]);
        assert_eq!(global.layer("bias").unwrap().values(), &[3.0]);
    }

    #[test]
    fn test_shape_mismatch_fails() {
        let engine = AggregationEngine::new();
        let round = RoundId::new();
        let updates = vec![
            set("a", round, &[("w", vec![1.0, 2.0])]),
            set("b", round, &[("w", vec![1.0, 2.0, 3.0])]),
        ];

        let err = engine.aggregate(&updates).unwrap_err();
        match err {
            Error::IncompatibleShape {
                layer,
                expected,
                found,
            } => {
                assert_eq!(layer, "w");
                assert_eq!(expected, vec![2]);
                assert_eq!(found, vec![3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_matrix_layers() {
        let engine = AggregationEngine::new();
        let round = RoundId::new();
        let mut a = Layers::new();
        a.insert("w".into(), Layer::new(vec![2, 2], vec![0.0, 2.0, 4.0, 6.0]).unwrap());
        let mut b = Layers::new();
        b.insert("w".into(), Layer::new(vec![2, 2], vec![2.0, 2.0, 2.0, 2.0]).unwrap());
        let updates = vec![WeightSet::new("a", round, a), WeightSet::new("b", round, b)];

        let global = engine.aggregate(&updates).unwrap();
        let w = global.layer("w").unwrap();
        assert_eq!(w.shape(), &[2, 2]);
        assert_eq!(w.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_same_length_different_shape_fails() {
        let engine = AggregationEngine::new();
        let round = RoundId::new();
        let mut a = Layers::new();
        a.insert("w".into(), Layer::new(vec![2, 3], vec![0.0; 6]).unwrap());
        let mut b = Layers::new();
        b.insert("w".into(), Layer::new(vec![3, 2], vec![0.0; 6]).unwrap());
        let updates = vec![WeightSet::new("a", round, a), WeightSet::new("b", round, b)];

        assert!(matches!(
            engine.aggregate(&updates),
            Err(Error::IncompatibleShape { .. })
        ));
    }

    #[test]
    fn test_convergence_boundary() {
        let engine = AggregationEngine::new();
        let round = RoundId::new();
        let prev = set("global", round, &[("w", vec![0.0, 0.0])]);
        let close = set("global", round, &[("w", vec![0.009, -0.009])]);
        let far = set("global", round, &[("w", vec![0.011, -0.011])]);

        assert!(engine.converged(&prev, &close, 0.01).unwrap());
        assert!(!engine.converged(&prev, &far, 0.01).unwrap());
    }

    #[test]
    fn test_distance_ignores_unshared_layers() {
        let engine = AggregationEngine::new();
        let round = RoundId::new();
        let prev = set("global", round, &[("w", vec![1.0, 1.0]), ("old", vec![9.0])]);
        let curr = set("global", round, &[("w", vec![2.0, 3.0]), ("new", vec![7.0])]);

        let d = engine.distance(&prev, &curr).unwrap();
        assert!((d - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_distance_without_shared_layers() {
        let engine = AggregationEngine::new();
        let round = RoundId::new();
        let prev = set("global", round, &[("a", vec![1.0])]);
        let curr = set("global", round, &[("b", vec![1.0])]);

        assert!(engine.distance(&prev, &curr).unwrap().is_infinite());
        assert!(!engine.converged(&prev, &curr, 1.0).unwrap());
    }
}
