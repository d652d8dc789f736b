//! Model weight containers.
//!
//! A [`WeightSet`] is an immutable snapshot of named parameter arrays.
//! Shape consistency across sets is checked by the aggregation engine,
//! not here.

use crate::core::{now, Error, Hash256, ParticipantId, Result, RoundId, Timestamp};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;

/// Owner tag carried by aggregated models.
pub const GLOBAL_OWNER: &str = "global";

/// A dense f64 array with an explicit shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLayer")]
pub struct Layer {
    shape: Vec<usize>,
    values: Vec<f64>,
}

/// Unchecked decoding target; every decoded layer goes through [`Layer::new`].
#[derive(Deserialize)]
struct RawLayer {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl TryFrom<RawLayer> for Layer {
    type Error = Error;

    fn try_from(raw: RawLayer) -> Result<Self> {
        Layer::new(raw.shape, raw.values)
    }
}

impl Layer {
    /// Create a layer, checking that the shape covers every value.
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(Error::InvalidLayer(format!(
                "shape {:?} holds {} values, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    /// Create a one-dimensional layer.
    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of scalar elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Named parameter arrays of one model.
pub type Layers = BTreeMap<String, Layer>;

/// Immutable model snapshot tagged with owner and round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    owner_id: ParticipantId,
    round_id: RoundId,
    layers: Layers,
    metadata: BTreeMap<String, serde_json::Value>,
    created_at: Timestamp,
}

impl WeightSet {
    /// Create a participant's weight set.
    pub fn new(owner_id: impl Into<ParticipantId>, round_id: RoundId, layers: Layers) -> Self {
        Self {
            owner_id: owner_id.into(),
            round_id,
            layers,
            metadata: BTreeMap::new(),
            created_at: now(),
        }
    }

    /// Create an aggregated (global) weight set.
    pub fn global(round_id: RoundId, layers: Layers) -> Self {
        Self::new(GLOBAL_OWNER, round_id, layers)
    }

    /// Build from `(name, values)` pairs of one-dimensional layers.
    pub fn from_vectors<I, S>(owner_id: impl Into<ParticipantId>, round_id: RoundId, vectors: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let layers = vectors
            .into_iter()
            .map(|(name, values)| (name.into(), Layer::vector(values)))
            .collect();
        Self::new(owner_id, round_id, layers)
    }

    /// Attach a metadata entry, producing a new set.
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Same owner, round and metadata with replaced layers.
    pub(crate) fn derive(&self, layers: Layers) -> Self {
        Self {
            owner_id: self.owner_id.clone(),
            round_id: self.round_id,
            layers,
            metadata: self.metadata.clone(),
            created_at: now(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn layers(&self) -> &Layers {
        &self.layers
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn is_global(&self) -> bool {
        self.owner_id == GLOBAL_OWNER
    }

    /// Look up one layer.
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    /// Total scalar parameters across all layers.
    pub fn parameter_count(&self) -> usize {
        self.layers.values().map(Layer::len).sum()
    }

    /// Pull the named layer out of every set that carries it.
    pub fn merge<'a, I>(sets: I, layer_name: &str) -> Vec<&'a Layer>
    where
        I: IntoIterator<Item = &'a WeightSet>,
    {
        sets.into_iter().filter_map(|s| s.layer(layer_name)).collect()
    }

    /// SHA3-256 commitment over owner, round and layer contents.
    pub fn digest(&self) -> Hash256 {
        let mut hasher = Sha3_256::new();
        hasher.update(self.owner_id.as_bytes());
        hasher.update(self.round_id.0.as_bytes());
        for (name, layer) in &self.layers {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            for dim in &layer.shape {
                hasher.update((*dim as u64).to_le_bytes());
            }
            for v in &layer.values {
                hasher.update(v.to_le_bytes());
            }
        }
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Hash256::new(bytes)
    }

    /// Encode as base64 bincode for transport.
    pub fn to_wire(&self) -> Result<String> {
        // bincode cannot carry serde_json::Value, so metadata travels as JSON text
        let wire = WireWeightSet {
            owner_id: self.owner_id.clone(),
            round_id: self.round_id,
            layers: self.layers.clone(),
            metadata: serde_json::to_string(&self.metadata)?,
            created_at: self.created_at,
        };
        Ok(STANDARD.encode(bincode::serialize(&wire)?))
    }

    /// Decode a set produced by [`WeightSet::to_wire`].
    pub fn from_wire(encoded: &str) -> Result<Self> {
        let bytes = STANDARD.decode(encoded)?;
        let wire: WireWeightSet = bincode::deserialize(&bytes)?;
        Ok(Self {
            owner_id: wire.owner_id,
            round_id: wire.round_id,
            layers: wire.layers,
            metadata: serde_json::from_str(&wire.metadata)?,
            created_at: wire.created_at,
        })
    }

    /// Format as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Serialize, Deserialize)]
struct WireWeightSet {
    owner_id: ParticipantId,
    round_id: RoundId,
    layers: Layers,
    metadata: String,
    created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_shape_validation() {
        assert!(Layer::new(vec![2, 3], vec![0.0; 6]).is_ok());
        let err = Layer::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, Error::InvalidLayer(_)));
    }

    #[test]
    fn test_vector_layer() {
        let layer = Layer::vector(vec![1.0, 2.0, 3.0]);
        assert_eq!(layer.shape(), &[3]);
        assert_eq!(layer.len(), 3);
    }

    #[test]
    fn test_merge_skips_missing_layers() {
        let round = RoundId::new();
        let sets = vec![
            WeightSet::from_vectors("a", round, [("w", vec![1.0]), ("b", vec![0.5])]),
            WeightSet::from_vectors("b", round, [("w", vec![2.0])]),
        ];
        assert_eq!(WeightSet::merge(&sets, "w").len(), 2);
        assert_eq!(WeightSet::merge(&sets, "b").len(), 1);
        assert!(WeightSet::merge(&sets, "missing").is_empty());
    }

    #[test]
    fn test_parameter_count() {
        let mut layers = Layers::new();
        layers.insert("w".into(), Layer::new(vec![2, 2], vec![0.0; 4]).unwrap());
        layers.insert("b".into(), Layer::vector(vec![0.0; 2]));
        let set = WeightSet::new("hospital-a", RoundId::new(), layers);
        assert_eq!(set.parameter_count(), 6);
        assert_eq!(set.layer_names().collect::<Vec<_>>(), vec!["b", "w"]);
    }

    #[test]
    fn test_digest_tracks_content() {
        let round = RoundId::new();
        let a = WeightSet::from_vectors("a", round, [("w", vec![1.0, 2.0])]);
        let same = WeightSet::from_vectors("a", round, [("w", vec![1.0, 2.0])]);
        let other = WeightSet::from_vectors("a", round, [("w", vec![1.0, 2.5])]);
        assert_eq!(a.digest(), same.digest());
        assert_ne!(a.digest(), other.digest());
    }

    #[test]
    fn test_wire_encoding_preserves_set() {
        let set = WeightSet::from_vectors("clinic-7", RoundId::new(), [("w", vec![0.25, -1.5])])
            .with_metadata("samples", 120);
        let decoded = WeightSet::from_wire(&set.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_from_wire_rejects_garbage() {
        assert!(matches!(
            WeightSet::from_wire("%%%"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_global_owner() {
        let set = WeightSet::global(RoundId::new(), Layers::new());
        assert!(set.is_global());
        assert_eq!(set.owner_id(), GLOBAL_OWNER);
    }

    #[test]
    fn test_decoding_rejects_inconsistent_layer() {
        let round = RoundId::new();
        let set = WeightSet::from_vectors("a", round, [("w", vec![1.0, 3.0])]);
        let mut json: serde_json::Value = serde_json::from_str(&set.to_json().unwrap()).unwrap();
        json["layers"]["w"]["values"] = serde_json::json!([5.0]);

        assert!(serde_json::from_value::<WeightSet>(json).is_err());

        let layers = BTreeMap::from([(
            "w".to_string(),
            UncheckedLayer {
                shape: vec![2],
                values: vec![5.0],
            },
        )]);
        let wire = UncheckedWire {
            owner_id: "a".to_string(),
            round_id: round,
            layers,
            metadata: "{}".to_string(),
            created_at: now(),
        };
        let encoded = STANDARD.encode(bincode::serialize(&wire).unwrap());
        assert!(matches!(
            WeightSet::from_wire(&encoded),
            Err(Error::Serialization(_))
        ));
    }

    #[derive(Serialize)]
    struct UncheckedLayer {
        shape: Vec<usize>,
        values: Vec<f64>,
    }

    #[derive(Serialize)]
    struct UncheckedWire {
        owner_id: String,
        round_id: RoundId,
        layers: BTreeMap<String, UncheckedLayer>,
        metadata: String,
        created_at: Timestamp,
    }
}
