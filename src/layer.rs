//! Linear layer with injected per-adapter low-rank weights.
//!
//! A [`LoraLinear`] wraps a base projection and carries any number of named
//! adapters, each a pair of low-rank matrices plus a scale:
//! `y = base(x) + Σ_active scale · (x · Aᵀ · Bᵀ)`.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;

use crate::error::{LoraError, Result};
use crate::scale::{ScaleState, ScaleValue, DEFAULT_STRENGTH};
use crate::traits::AdapterScalable;

/// A linear layer with removable low-rank adapters.
pub struct LoraLinear {
    /// Base projection
    base: Linear,
    /// Down projections per adapter: `r × in_features`
    lora_a: HashMap<String, Tensor>,
    /// Up projections per adapter: `out_features × r`
    lora_b: HashMap<String, Tensor>,
    /// Per-adapter scales
    scale: ScaleState,
    /// Adapters applied during the forward pass
    active: Vec<String>,
    /// Input dimension
    in_features: usize,
    /// Output dimension
    out_features: usize,
}

impl LoraLinear {
    /// Create a layer from a base weight tensor of shape
    /// `[out_features, in_features]`.
    ///
    /// # Errors
    /// Returns an error if the weight is not rank 2.
    pub fn new(base_weight: Tensor) -> Result<Self> {
        let (out_features, in_features) = base_weight.dims2()?;

        Ok(Self {
            base: Linear::new(base_weight, None),
            lora_a: HashMap::new(),
            lora_b: HashMap::new(),
            scale: ScaleState::new(),
            active: Vec::new(),
            in_features,
            out_features,
        })
    }

    /// Create a layer with a zero base weight. Useful when the surrounding
    /// model owns the real weights and only adapter routing is needed.
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn zeros(in_features: usize, out_features: usize, device: &Device) -> Result<Self> {
        let base_weight = Tensor::zeros((out_features, in_features), DType::F32, device)?;
        Self::new(base_weight)
    }

    /// Input dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Attach an adapter's low-rank pair under `name` at the given scaling.
    ///
    /// `lora_a` must be `r × in_features` and `lora_b` must be
    /// `out_features × r`.
    ///
    /// # Errors
    /// Returns a shape mismatch if the pair does not fit this layer.
    pub fn insert_adapter(
        &mut self,
        name: &str,
        lora_a: Tensor,
        lora_b: Tensor,
        scaling: f64,
    ) -> Result<()> {
        let a_dims = lora_a.dims().to_vec();
        let b_dims = lora_b.dims().to_vec();
        let rank = a_dims.first().copied().unwrap_or(0);

        if a_dims != [rank, self.in_features] {
            return Err(LoraError::ShapeMismatch {
                expected: vec![rank, self.in_features],
                actual: a_dims,
            });
        }
        if b_dims != [self.out_features, rank] {
            return Err(LoraError::ShapeMismatch {
                expected: vec![self.out_features, rank],
                actual: b_dims,
            });
        }

        self.lora_a.insert(name.to_string(), lora_a);
        self.lora_b.insert(name.to_string(), lora_b);
        self.scale.set(name, ScaleValue::Scalar(scaling));
        Ok(())
    }

    /// Drop the adapter under `name`, if present.
    pub fn remove_adapter(&mut self, name: &str) {
        self.lora_a.remove(name);
        self.lora_b.remove(name);
        self.scale.remove(name);
        self.active.retain(|n| n != name);
    }

    /// Whether an adapter is attached under `name`.
    #[must_use]
    pub fn has_adapter(&self, name: &str) -> bool {
        self.lora_a.contains_key(name)
    }

    /// Names of all attached adapters.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<&str> {
        self.lora_a.keys().map(String::as_str).collect()
    }

    /// Store a scale for an attached adapter. Ignored when no adapter is
    /// attached under `name`, so activation cannot leave scale residue for
    /// layers an adapter never touched.
    pub fn set_adapter_scale(&mut self, name: &str, value: ScaleValue) {
        if self.has_adapter(name) {
            self.scale.set(name, value);
        }
    }

    /// The scale that would apply to `name`, if any.
    #[must_use]
    pub fn adapter_scale(&self, name: &str) -> Option<&ScaleValue> {
        self.scale.get(name)
    }

    /// Mark the adapters applied during the forward pass. Names without an
    /// attached adapter on this layer are dropped.
    pub fn set_active(&mut self, names: &[String]) {
        self.active = names.iter().filter(|n| self.has_adapter(n)).cloned().collect();
    }

    /// Names of the adapters applied during the forward pass.
    #[must_use]
    pub fn active_adapters(&self) -> &[String] {
        &self.active
    }

    /// Forward pass: base projection plus every active adapter's scaled
    /// low-rank contribution.
    ///
    /// # Errors
    /// Returns an error if a tensor operation fails.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut output = self.base.forward(input)?;

        for name in &self.active {
            let (Some(a), Some(b)) = (self.lora_a.get(name), self.lora_b.get(name)) else {
                continue;
            };

            let lora_out = Linear::new(a.clone(), None).forward(input)?;
            let lora_out = Linear::new(b.clone(), None).forward(&lora_out)?;

            let scale = match self.scale.get(name) {
                Some(ScaleValue::Tensor(t)) => t.clone(),
                Some(ScaleValue::Scalar(s)) => Tensor::new(*s as f32, lora_out.device())?,
                None => Tensor::new(DEFAULT_STRENGTH as f32, lora_out.device())?,
            };
            output = output.broadcast_add(&lora_out.broadcast_mul(&scale)?)?;
        }

        Ok(output)
    }
}

impl AdapterScalable for LoraLinear {
    fn scale_state(&self) -> Option<&ScaleState> {
        Some(&self.scale)
    }

    fn scale_state_mut(&mut self) -> Option<&mut ScaleState> {
        Some(&mut self.scale)
    }

    fn clear_adapter_state(&mut self) {
        self.lora_a.clear();
        self.lora_b.clear();
        self.scale.clear();
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones(shape: (usize, usize), device: &Device) -> Result<Tensor> {
        Ok(Tensor::ones(shape, DType::F32, device)?)
    }

    fn attach_unit_adapter(layer: &mut LoraLinear, name: &str, scaling: f64) -> Result<()> {
        let device = Device::Cpu;
        layer.insert_adapter(
            name,
            ones((1, layer.in_features()), &device)?,
            ones((layer.out_features(), 1), &device)?,
            scaling,
        )
    }

    #[test]
    fn test_insert_and_remove() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = LoraLinear::zeros(4, 4, &device)?;
        attach_unit_adapter(&mut layer, "style", 1.0)?;

        assert!(layer.has_adapter("style"));
        layer.remove_adapter("style");
        assert!(!layer.has_adapter("style"));
        assert!(layer.adapter_scale("style").is_none());
        Ok(())
    }

    #[test]
    fn test_insert_rejects_bad_shapes() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = LoraLinear::zeros(4, 4, &device)?;
        let result = layer.insert_adapter(
            "style",
            ones((1, 3), &device)?,
            ones((4, 1), &device)?,
            1.0,
        );
        assert!(matches!(result.unwrap_err(), LoraError::ShapeMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_forward_applies_active_adapter() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = LoraLinear::zeros(2, 2, &device)?;
        attach_unit_adapter(&mut layer, "style", 0.5)?;
        layer.set_active(&["style".to_string()]);

        // x·Aᵀ = 2, ·Bᵀ = [2, 2], ×0.5 = [1, 1]; base is zero.
        let input = Tensor::ones((1, 2), DType::F32, &device)?;
        let output = layer.forward(&input)?.to_vec2::<f32>()?;
        assert_eq!(output, vec![vec![1.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn test_forward_skips_inactive_adapter() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = LoraLinear::zeros(2, 2, &device)?;
        attach_unit_adapter(&mut layer, "style", 1.0)?;

        let input = Tensor::ones((1, 2), DType::F32, &device)?;
        let output = layer.forward(&input)?.to_vec2::<f32>()?;
        assert_eq!(output, vec![vec![0.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn test_scale_overwrite_changes_forward() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = LoraLinear::zeros(2, 2, &device)?;
        attach_unit_adapter(&mut layer, "style", 1.0)?;
        layer.set_active(&["style".to_string()]);

        layer.scale_state_mut().unwrap().apply("style", 2.0)?;

        let input = Tensor::ones((1, 2), DType::F32, &device)?;
        let output = layer.forward(&input)?.to_vec2::<f32>()?;
        assert_eq!(output, vec![vec![4.0, 4.0]]);
        Ok(())
    }

    #[test]
    fn test_legacy_scale_gates_any_adapter() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = LoraLinear::zeros(2, 2, &device)?;
        attach_unit_adapter(&mut layer, "style", 1.0)?;
        layer.set_active(&["style".to_string()]);
        *layer.scale_state_mut().unwrap() = ScaleState::Legacy(ScaleValue::Scalar(0.25));

        let input = Tensor::ones((1, 2), DType::F32, &device)?;
        let output = layer.forward(&input)?.to_vec2::<f32>()?;
        assert_eq!(output, vec![vec![0.5, 0.5]]);
        Ok(())
    }

    #[test]
    fn test_set_active_drops_unknown_names() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = LoraLinear::zeros(2, 2, &device)?;
        attach_unit_adapter(&mut layer, "style", 1.0)?;
        layer.set_active(&["style".to_string(), "missing".to_string()]);
        assert_eq!(layer.active_adapters(), &["style".to_string()]);
        Ok(())
    }

    #[test]
    fn test_clear_adapter_state() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = LoraLinear::zeros(2, 2, &device)?;
        attach_unit_adapter(&mut layer, "style", 1.0)?;
        layer.set_active(&["style".to_string()]);

        layer.clear_adapter_state();
        assert!(!layer.has_adapter("style"));
        assert!(layer.active_adapters().is_empty());
        assert!(layer.scale_state().unwrap().is_empty());
        Ok(())
    }
}
