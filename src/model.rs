//! Concrete video transformer implementing the adapter-manager interfaces.
//!
//! This module provides:
//! - [`VideoTransformer`]: named [`LoraLinear`] modules keyed by parameter
//!   path, plus the adapter registry and active set
//! - A standard module layout for the double/single-stream architecture

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};

use crate::error::{LoraError, Result};
use crate::io::StateDict;
use crate::layer::LoraLinear;
use crate::scale::{BlockCounts, LayerScales, ScaleValue, DEFAULT_STRENGTH, HUNYUAN_VIDEO_ARCH};
use crate::traits::{AdapterModel, AdapterScalable};

/// A double/single-stream video transformer as seen by the adapter manager:
/// a set of named linear modules with adapter routing.
pub struct VideoTransformer {
    /// Modules keyed by parameter path (e.g. `transformer_blocks.0.attn.to_q`)
    modules: BTreeMap<String, LoraLinear>,
    /// Registered adapter names in registration order
    adapters: Vec<String>,
    /// Currently active adapter names
    active: Vec<String>,
    /// Block counts reported to scale expansion
    counts: BlockCounts,
}

impl VideoTransformer {
    /// Create an empty model with the given block counts. Modules are added
    /// with [`VideoTransformer::add_module`].
    #[must_use]
    pub fn new(counts: BlockCounts) -> Self {
        Self {
            modules: BTreeMap::new(),
            adapters: Vec::new(),
            active: Vec::new(),
            counts,
        }
    }

    /// Build the standard module layout of the double/single-stream
    /// architecture at the given hidden size, with zero base weights.
    ///
    /// # Errors
    /// Returns an error if tensor allocation fails.
    pub fn standard(counts: BlockCounts, hidden: usize, device: &Device) -> Result<Self> {
        let mut model = Self::new(counts);

        for i in 0..counts.transformer_blocks {
            let base = format!("transformer_blocks.{i}");
            for proj in [
                "to_q",
                "to_k",
                "to_v",
                "add_q_proj",
                "add_k_proj",
                "add_v_proj",
            ] {
                model.add_module(
                    format!("{base}.attn.{proj}"),
                    LoraLinear::zeros(hidden, hidden, device)?,
                );
            }
            model.add_module(
                format!("{base}.attn.to_out.0"),
                LoraLinear::zeros(hidden, hidden, device)?,
            );
            model.add_module(
                format!("{base}.attn.to_add_out"),
                LoraLinear::zeros(hidden, hidden, device)?,
            );
            for ff in ["ff", "ff_context"] {
                model.add_module(
                    format!("{base}.{ff}.net.0.proj"),
                    LoraLinear::zeros(hidden, 4 * hidden, device)?,
                );
                model.add_module(
                    format!("{base}.{ff}.net.2"),
                    LoraLinear::zeros(4 * hidden, hidden, device)?,
                );
            }
            model.add_module(
                format!("{base}.norm1.linear"),
                LoraLinear::zeros(hidden, 6 * hidden, device)?,
            );
            model.add_module(
                format!("{base}.norm1_context.linear"),
                LoraLinear::zeros(hidden, 6 * hidden, device)?,
            );
        }

        for i in 0..counts.single_transformer_blocks {
            let base = format!("single_transformer_blocks.{i}");
            for proj in ["to_q", "to_k", "to_v"] {
                model.add_module(
                    format!("{base}.attn.{proj}"),
                    LoraLinear::zeros(hidden, hidden, device)?,
                );
            }
            model.add_module(
                format!("{base}.proj_mlp"),
                LoraLinear::zeros(hidden, 4 * hidden, device)?,
            );
            // Concatenated attention + MLP stream feeds the output projection.
            model.add_module(
                format!("{base}.proj_out"),
                LoraLinear::zeros(5 * hidden, hidden, device)?,
            );
            model.add_module(
                format!("{base}.norm.linear"),
                LoraLinear::zeros(hidden, 3 * hidden, device)?,
            );
        }

        Ok(model)
    }

    /// Add (or replace) a module at the given parameter path.
    pub fn add_module(&mut self, path: impl Into<String>, layer: LoraLinear) {
        self.modules.insert(path.into(), layer);
    }

    /// The module at `path`, if any.
    #[must_use]
    pub fn module(&self, path: &str) -> Option<&LoraLinear> {
        self.modules.get(path)
    }

    /// Mutable access to the module at `path`, if any.
    pub fn module_mut(&mut self, path: &str) -> Option<&mut LoraLinear> {
        self.modules.get_mut(path)
    }

    /// All module parameter paths.
    #[must_use]
    pub fn module_paths(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    /// Number of modules.
    #[must_use]
    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    /// Forward pass through a single module.
    ///
    /// # Errors
    /// Returns an error if the module does not exist or its forward fails.
    pub fn forward_module(&self, path: &str, input: &Tensor) -> Result<Tensor> {
        let layer = self
            .modules
            .get(path)
            .ok_or_else(|| LoraError::AdapterNotFound {
                name: format!("module '{path}' not found"),
            })?;
        layer.forward(input)
    }
}

impl AdapterModel for VideoTransformer {
    fn architecture(&self) -> &str {
        HUNYUAN_VIDEO_ARCH
    }

    fn block_counts(&self) -> BlockCounts {
        self.counts
    }

    fn register_adapter(
        &mut self,
        name: &str,
        state_dict: StateDict,
        network_alphas: Option<HashMap<String, f64>>,
    ) -> Result<()> {
        if self.adapters.iter().any(|n| n == name) {
            return Err(LoraError::AdapterExists {
                name: name.to_string(),
            });
        }

        // Pair up the down/up projections per module path.
        let mut pairs: HashMap<String, (Option<Tensor>, Option<Tensor>)> = HashMap::new();
        for (key, tensor) in state_dict {
            if let Some(module) = key.strip_suffix(".lora_A.weight") {
                pairs.entry(module.to_string()).or_default().0 = Some(tensor);
            } else if let Some(module) = key.strip_suffix(".lora_B.weight") {
                pairs.entry(module.to_string()).or_default().1 = Some(tensor);
            } else {
                return Err(LoraError::WeightLoad(format!(
                    "unexpected key in converted state dict: {key}"
                )));
            }
        }

        let alphas = network_alphas.unwrap_or_default();
        let mut routed = Vec::with_capacity(pairs.len());
        for (module_path, pair) in pairs {
            let (Some(a), Some(b)) = pair else {
                return Err(LoraError::WeightLoad(format!(
                    "incomplete low-rank pair for module {module_path}"
                )));
            };
            if !self.modules.contains_key(&module_path) {
                return Err(LoraError::WeightLoad(format!(
                    "no module at {module_path}"
                )));
            }

            let rank = a.dims().first().copied().unwrap_or(0);
            let scaling = match alphas.get(&module_path) {
                Some(alpha) if rank > 0 => alpha / rank as f64,
                _ => DEFAULT_STRENGTH,
            };
            routed.push((module_path, a, b, scaling));
        }

        for (module_path, a, b, scaling) in routed {
            if let Some(layer) = self.modules.get_mut(&module_path) {
                layer.insert_adapter(name, a, b, scaling)?;
            }
        }

        self.adapters.push(name.to_string());
        Ok(())
    }

    fn deregister_adapters(&mut self, names: &[String]) {
        for layer in self.modules.values_mut() {
            for name in names {
                layer.remove_adapter(name);
            }
        }
        self.adapters.retain(|n| !names.contains(n));
        self.active.retain(|n| !names.contains(n));
    }

    fn adapter_names(&self) -> Vec<String> {
        self.adapters.clone()
    }

    fn active_adapters(&self) -> Vec<String> {
        self.active.clone()
    }

    fn clear_active_adapters(&mut self) {
        self.active.clear();
        for layer in self.modules.values_mut() {
            layer.set_active(&[]);
        }
    }

    fn set_weights_and_activate(
        &mut self,
        names: &[String],
        scales: &[LayerScales],
    ) -> Result<()> {
        // Validate before touching any layer.
        for name in names {
            if !self.adapters.iter().any(|n| n == name) {
                return Err(LoraError::AdapterNotFound {
                    name: name.clone(),
                });
            }
        }
        if names.len() != scales.len() {
            return Err(LoraError::WeightCountMismatch {
                names: names.len(),
                weights: scales.len(),
            });
        }

        for (path, layer) in &mut self.modules {
            for (name, layer_scales) in names.iter().zip(scales) {
                let strength = layer_scales.scale_for(path);
                layer.set_adapter_scale(name, ScaleValue::Scalar(strength));
            }
            layer.set_active(names);
        }
        self.active = names.to_vec();
        Ok(())
    }

    fn scalable_layers_mut(&mut self) -> Vec<&mut dyn AdapterScalable> {
        self.modules
            .values_mut()
            .map(|layer| layer as &mut dyn AdapterScalable)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn counts() -> BlockCounts {
        BlockCounts {
            transformer_blocks: 1,
            single_transformer_blocks: 1,
        }
    }

    fn adapter_state_dict(device: &Device) -> Result<StateDict> {
        let mut sd = StateDict::new();
        sd.insert(
            "transformer_blocks.0.attn.to_q.lora_A.weight".to_string(),
            Tensor::ones((2, 8), DType::F32, device)?,
        );
        sd.insert(
            "transformer_blocks.0.attn.to_q.lora_B.weight".to_string(),
            Tensor::ones((8, 2), DType::F32, device)?,
        );
        Ok(sd)
    }

    #[test]
    fn test_standard_layout() -> Result<()> {
        let device = Device::Cpu;
        let model = VideoTransformer::standard(counts(), 8, &device)?;

        // 14 modules per double block, 6 per single block.
        assert_eq!(model.num_modules(), 20);
        assert!(model.module("transformer_blocks.0.attn.to_q").is_some());
        assert!(model.module("transformer_blocks.0.ff_context.net.2").is_some());
        assert!(model.module("single_transformer_blocks.0.proj_out").is_some());

        let proj_out = model.module("single_transformer_blocks.0.proj_out").unwrap();
        assert_eq!(proj_out.in_features(), 40);
        assert_eq!(proj_out.out_features(), 8);
        Ok(())
    }

    #[test]
    fn test_register_and_enumerate() -> Result<()> {
        let device = Device::Cpu;
        let mut model = VideoTransformer::standard(counts(), 8, &device)?;
        model.register_adapter("style", adapter_state_dict(&device)?, None)?;

        assert_eq!(model.adapter_names(), vec!["style".to_string()]);
        assert!(model
            .module("transformer_blocks.0.attn.to_q")
            .unwrap()
            .has_adapter("style"));
        Ok(())
    }

    #[test]
    fn test_register_duplicate_errors() -> Result<()> {
        let device = Device::Cpu;
        let mut model = VideoTransformer::standard(counts(), 8, &device)?;
        model.register_adapter("style", adapter_state_dict(&device)?, None)?;
        let result = model.register_adapter("style", adapter_state_dict(&device)?, None);
        assert!(matches!(result.unwrap_err(), LoraError::AdapterExists { .. }));
        Ok(())
    }

    #[test]
    fn test_register_unknown_module_errors() -> Result<()> {
        let device = Device::Cpu;
        let mut model = VideoTransformer::standard(counts(), 8, &device)?;

        let mut sd = StateDict::new();
        sd.insert(
            "transformer_blocks.9.attn.to_q.lora_A.weight".to_string(),
            Tensor::ones((2, 8), DType::F32, &device)?,
        );
        sd.insert(
            "transformer_blocks.9.attn.to_q.lora_B.weight".to_string(),
            Tensor::ones((8, 2), DType::F32, &device)?,
        );
        let result = model.register_adapter("style", sd, None);
        assert!(matches!(result.unwrap_err(), LoraError::WeightLoad(_)));
        assert!(model.adapter_names().is_empty());
        Ok(())
    }

    #[test]
    fn test_network_alpha_sets_scaling() -> Result<()> {
        let device = Device::Cpu;
        let mut model = VideoTransformer::standard(counts(), 8, &device)?;
        let alphas = [("transformer_blocks.0.attn.to_q".to_string(), 4.0)]
            .into_iter()
            .collect();
        model.register_adapter("style", adapter_state_dict(&device)?, Some(alphas))?;

        // rank 2, alpha 4 → scaling 2.0
        let layer = model.module("transformer_blocks.0.attn.to_q").unwrap();
        let scale = layer.adapter_scale("style").unwrap().strength()?;
        assert!((scale - 2.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_deregister_removes_everywhere() -> Result<()> {
        let device = Device::Cpu;
        let mut model = VideoTransformer::standard(counts(), 8, &device)?;
        model.register_adapter("style", adapter_state_dict(&device)?, None)?;
        model.set_weights_and_activate(
            &["style".to_string()],
            &[LayerScales::Uniform(1.0)],
        )?;

        model.deregister_adapters(&["style".to_string()]);
        assert!(model.adapter_names().is_empty());
        assert!(model.active_adapters().is_empty());
        assert!(!model
            .module("transformer_blocks.0.attn.to_q")
            .unwrap()
            .has_adapter("style"));
        Ok(())
    }

    #[test]
    fn test_activate_unknown_adapter_errors() -> Result<()> {
        let device = Device::Cpu;
        let mut model = VideoTransformer::standard(counts(), 8, &device)?;
        let result = model.set_weights_and_activate(
            &["missing".to_string()],
            &[LayerScales::Uniform(1.0)],
        );
        assert!(matches!(
            result.unwrap_err(),
            LoraError::AdapterNotFound { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_activate_writes_scales_and_active_set() -> Result<()> {
        let device = Device::Cpu;
        let mut model = VideoTransformer::standard(counts(), 8, &device)?;
        model.register_adapter("style", adapter_state_dict(&device)?, None)?;

        model.set_weights_and_activate(
            &["style".to_string()],
            &[LayerScales::Uniform(0.5)],
        )?;

        assert_eq!(model.active_adapters(), vec!["style".to_string()]);
        let layer = model.module("transformer_blocks.0.attn.to_q").unwrap();
        assert_eq!(layer.active_adapters(), &["style".to_string()]);
        assert!((layer.adapter_scale("style").unwrap().strength()? - 0.5).abs() < 1e-9);

        // Layers without the adapter carry no scale residue.
        let untouched = model.module("transformer_blocks.0.attn.to_k").unwrap();
        assert!(untouched.adapter_scale("style").is_none());
        Ok(())
    }

    #[test]
    fn test_forward_module_applies_activation() -> Result<()> {
        let device = Device::Cpu;
        let mut model = VideoTransformer::standard(counts(), 8, &device)?;
        model.register_adapter("style", adapter_state_dict(&device)?, None)?;
        model.set_weights_and_activate(
            &["style".to_string()],
            &[LayerScales::Uniform(0.5)],
        )?;

        // x·Aᵀ = [8]*2 rows → ·Bᵀ = 16 each, ×0.5 = 8; zero base.
        let input = Tensor::ones((1, 8), DType::F32, &device)?;
        let output = model.forward_module("transformer_blocks.0.attn.to_q", &input)?;
        let values = output.to_vec2::<f32>()?;
        assert_eq!(values[0][0], 8.0);
        Ok(())
    }
}
