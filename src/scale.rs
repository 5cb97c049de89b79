//! Adapter strength types and activation-time weight normalization.
//!
//! This module provides:
//! - Caller-facing weight arguments ([`AdapterWeight`], [`WeightSpec`])
//! - Per-layer scale storage ([`ScaleValue`], [`ScaleState`])
//! - The pure broadcast/align step used by adapter activation
//! - The per-architecture scale-expansion lookup

use std::collections::HashMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{LoraError, Result};

/// Default adapter strength used when a weight entry is omitted.
pub const DEFAULT_STRENGTH: f64 = 1.0;

/// Architecture name under which the video transformer's scale expansion is
/// registered.
pub const HUNYUAN_VIDEO_ARCH: &str = "HunyuanVideoTransformer3D";

/// Block counts of a double/single-stream video transformer, used when
/// expanding per-block weight mappings into per-layer scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCounts {
    /// Number of double-stream transformer blocks
    pub transformer_blocks: usize,
    /// Number of single-stream transformer blocks
    pub single_transformer_blocks: usize,
}

/// An adapter strength as given by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdapterWeight {
    /// One strength for every layer the adapter touches.
    Scalar(f64),
    /// Strength per block group (e.g. `transformer_blocks` vs
    /// `single_transformer_blocks`); groups left out default to
    /// [`DEFAULT_STRENGTH`].
    PerBlock(HashMap<String, f64>),
}

/// The polymorphic `weights` argument of adapter activation.
///
/// Mirrors the accepted call forms: omitted, a single value broadcast over
/// all adapters, or one entry per adapter.
#[derive(Debug, Clone, Default)]
pub enum WeightSpec {
    /// No weights given; every adapter gets [`DEFAULT_STRENGTH`].
    #[default]
    Unspecified,
    /// A single weight broadcast to every adapter.
    Uniform(AdapterWeight),
    /// One (possibly omitted) weight per adapter, aligned by position.
    PerAdapter(Vec<Option<AdapterWeight>>),
}

impl From<()> for WeightSpec {
    fn from((): ()) -> Self {
        Self::Unspecified
    }
}

impl From<f64> for WeightSpec {
    fn from(weight: f64) -> Self {
        Self::Uniform(AdapterWeight::Scalar(weight))
    }
}

impl From<AdapterWeight> for WeightSpec {
    fn from(weight: AdapterWeight) -> Self {
        Self::Uniform(weight)
    }
}

impl From<HashMap<String, f64>> for WeightSpec {
    fn from(weights: HashMap<String, f64>) -> Self {
        Self::Uniform(AdapterWeight::PerBlock(weights))
    }
}

impl From<Vec<f64>> for WeightSpec {
    fn from(weights: Vec<f64>) -> Self {
        Self::PerAdapter(
            weights
                .into_iter()
                .map(|w| Some(AdapterWeight::Scalar(w)))
                .collect(),
        )
    }
}

impl From<Vec<Option<f64>>> for WeightSpec {
    fn from(weights: Vec<Option<f64>>) -> Self {
        Self::PerAdapter(
            weights
                .into_iter()
                .map(|w| w.map(AdapterWeight::Scalar))
                .collect(),
        )
    }
}

impl From<Vec<AdapterWeight>> for WeightSpec {
    fn from(weights: Vec<AdapterWeight>) -> Self {
        Self::PerAdapter(weights.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<AdapterWeight>>> for WeightSpec {
    fn from(weights: Vec<Option<AdapterWeight>>) -> Self {
        Self::PerAdapter(weights)
    }
}

/// Align a weight specification with a list of adapter names.
///
/// Broadcasts single values, fills omitted entries with
/// [`DEFAULT_STRENGTH`], and rejects per-adapter lists whose length does not
/// match the name list. Pure; performs no model mutation.
///
/// # Errors
/// Returns [`LoraError::WeightCountMismatch`] if a per-adapter list has a
/// different length than `names`.
pub fn align_weights(names: &[String], weights: WeightSpec) -> Result<Vec<AdapterWeight>> {
    match weights {
        WeightSpec::Unspecified => {
            Ok(vec![AdapterWeight::Scalar(DEFAULT_STRENGTH); names.len()])
        }
        WeightSpec::Uniform(weight) => Ok(vec![weight; names.len()]),
        WeightSpec::PerAdapter(weights) => {
            if weights.len() != names.len() {
                return Err(LoraError::WeightCountMismatch {
                    names: names.len(),
                    weights: weights.len(),
                });
            }
            Ok(weights
                .into_iter()
                .map(|w| w.unwrap_or(AdapterWeight::Scalar(DEFAULT_STRENGTH)))
                .collect())
        }
    }
}

/// A stored scale: a plain scalar or a device-resident rank-0 tensor.
#[derive(Debug, Clone)]
pub enum ScaleValue {
    /// Plain scalar strength.
    Scalar(f64),
    /// Device-resident strength (rank-0 tensor).
    Tensor(Tensor),
}

impl ScaleValue {
    /// Rebuild this value with a new strength, preserving representation: a
    /// scalar stays a scalar, a tensor is re-materialized on its device.
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn with_strength(&self, strength: f64) -> Result<Self> {
        match self {
            Self::Scalar(_) => Ok(Self::Scalar(strength)),
            Self::Tensor(t) => Ok(Self::Tensor(Tensor::new(strength as f32, t.device())?)),
        }
    }

    /// The strength as `f64`.
    ///
    /// # Errors
    /// Returns an error if a tensor value cannot be read back as a scalar.
    pub fn strength(&self) -> Result<f64> {
        match self {
            Self::Scalar(s) => Ok(*s),
            Self::Tensor(t) => Ok(f64::from(
                t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?,
            )),
        }
    }
}

/// A layer's scale storage.
///
/// Current layers keep one scale per adapter. Layers converted from the old
/// single-adapter format carry one ungated value instead; overwrites to a
/// [`ScaleState::Legacy`] state ignore the adapter name, matching the old
/// format's behavior. Kept as-is rather than silently migrated.
#[derive(Debug, Clone)]
pub enum ScaleState {
    /// One scale per registered adapter.
    PerAdapter(HashMap<String, ScaleValue>),
    /// Single ungated scale (old single-adapter layer format).
    Legacy(ScaleValue),
}

impl Default for ScaleState {
    fn default() -> Self {
        Self::PerAdapter(HashMap::new())
    }
}

impl ScaleState {
    /// Create empty per-adapter storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the scale that applies to `name`.
    ///
    /// A legacy state answers for every adapter name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ScaleValue> {
        match self {
            Self::PerAdapter(map) => map.get(name),
            Self::Legacy(value) => Some(value),
        }
    }

    /// Store a scale for `name`. On a legacy state the single value is
    /// overwritten whatever the name.
    pub fn set(&mut self, name: &str, value: ScaleValue) {
        match self {
            Self::PerAdapter(map) => {
                map.insert(name.to_string(), value);
            }
            Self::Legacy(existing) => *existing = value,
        }
    }

    /// Overwrite the scale for `name` with `strength`, preserving the stored
    /// representation (scalar stays scalar, tensor stays tensor on its
    /// device).
    ///
    /// On per-adapter storage an entry for `name` must already exist or the
    /// call is a silent no-op; on legacy storage the single value is
    /// overwritten regardless of `name`.
    ///
    /// # Errors
    /// Returns an error if tensor re-materialization fails.
    pub fn apply(&mut self, name: &str, strength: f64) -> Result<()> {
        match self {
            Self::PerAdapter(map) => {
                if let Some(value) = map.get_mut(name) {
                    *value = value.with_strength(strength)?;
                }
            }
            Self::Legacy(value) => {
                *value = value.with_strength(strength)?;
            }
        }
        Ok(())
    }

    /// Drop the entry for `name`, if any. No-op on legacy storage.
    pub fn remove(&mut self, name: &str) {
        if let Self::PerAdapter(map) = self {
            map.remove(name);
        }
    }

    /// Reset to empty per-adapter storage.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether no scale entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::PerAdapter(map) => map.is_empty(),
            Self::Legacy(_) => false,
        }
    }
}

/// Flat per-layer scales a model consumes after expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerScales {
    /// One strength for every layer.
    Uniform(f64),
    /// Strength per block path (e.g. `transformer_blocks.3`); layers outside
    /// every listed block get [`DEFAULT_STRENGTH`].
    PerLayer(HashMap<String, f64>),
}

impl LayerScales {
    /// The strength applying to the module at `module_path`.
    #[must_use]
    pub fn scale_for(&self, module_path: &str) -> f64 {
        match self {
            Self::Uniform(s) => *s,
            Self::PerLayer(map) => map
                .iter()
                .find(|(block, _)| {
                    module_path == block.as_str()
                        || (module_path.starts_with(block.as_str())
                            && module_path.as_bytes().get(block.len()) == Some(&b'.'))
                })
                .map_or(DEFAULT_STRENGTH, |(_, s)| *s),
        }
    }
}

/// Scale-expansion function: turns a caller-facing weight into the flat
/// per-layer structure the model expects.
pub type ExpansionFn = fn(&BlockCounts, &AdapterWeight) -> Result<LayerScales>;

/// Look up the scale expansion registered for an architecture name.
///
/// Returns `None` for architectures without an entry; activation treats that
/// as fatal.
#[must_use]
pub fn expansion_fn(architecture: &str) -> Option<ExpansionFn> {
    match architecture {
        HUNYUAN_VIDEO_ARCH => Some(expand_hunyuan_video),
        _ => None,
    }
}

/// Expansion for the double/single-stream video transformer.
///
/// Scalars pass through as a uniform scale. Per-block mappings fan out each
/// block-group key to one entry per block index; groups missing from the
/// mapping default to [`DEFAULT_STRENGTH`].
///
/// # Errors
/// Returns [`LoraError::UnknownScaleGroup`] for a block-group key the
/// architecture does not have.
fn expand_hunyuan_video(counts: &BlockCounts, weight: &AdapterWeight) -> Result<LayerScales> {
    const GROUPS: [&str; 2] = ["transformer_blocks", "single_transformer_blocks"];

    match weight {
        AdapterWeight::Scalar(s) => Ok(LayerScales::Uniform(*s)),
        AdapterWeight::PerBlock(map) => {
            for group in map.keys() {
                if !GROUPS.contains(&group.as_str()) {
                    return Err(LoraError::UnknownScaleGroup {
                        group: group.clone(),
                        architecture: HUNYUAN_VIDEO_ARCH.to_string(),
                    });
                }
            }

            let mut scales = HashMap::new();
            let double = map
                .get("transformer_blocks")
                .copied()
                .unwrap_or(DEFAULT_STRENGTH);
            for i in 0..counts.transformer_blocks {
                scales.insert(format!("transformer_blocks.{i}"), double);
            }
            let single = map
                .get("single_transformer_blocks")
                .copied()
                .unwrap_or(DEFAULT_STRENGTH);
            for i in 0..counts.single_transformer_blocks {
                scales.insert(format!("single_transformer_blocks.{i}"), single);
            }
            Ok(LayerScales::PerLayer(scales))
        }
    }
}
