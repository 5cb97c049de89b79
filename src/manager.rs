//! Adapter lifecycle operations over a transformer model.
//!
//! This module provides the four management entry points:
//! - [`load_lora`]: fetch, convert, and register a weight file as an adapter
//! - [`unload_all`]: deregister everything and sweep residual layer state
//! - [`set_lora_scale`]: overwrite one adapter's scale on every layer
//! - [`set_adapters`]: normalize weights and mark the active adapter set
//!
//! All operations take the model by `&mut` and run synchronously on the
//! caller's thread.

use std::path::Path;

use tracing::{debug, info};

use crate::convert::convert_hunyuan_video_lora;
use crate::device::DeviceContext;
use crate::error::{LoraError, Result};
use crate::io::{self, DEFAULT_WEIGHT_NAME};
use crate::scale::{align_weights, expansion_fn, WeightSpec};
use crate::traits::AdapterModel;

/// Substring replacing `.` in adapter names derived from file names. The
/// registration mechanism treats `.` as a structural separator in parameter
/// paths, so a dotted name would corrupt lookups.
const DOT_SENTINEL: &str = "_DOT_";

/// Adapter name argument: a single name or an ordered list.
#[derive(Debug, Clone)]
pub struct AdapterNames(Vec<String>);

impl AdapterNames {
    /// The names as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for AdapterNames {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl From<String> for AdapterNames {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl From<Vec<String>> for AdapterNames {
    fn from(names: Vec<String>) -> Self {
        Self(names)
    }
}

impl From<Vec<&str>> for AdapterNames {
    fn from(names: Vec<&str>) -> Self {
        Self(names.into_iter().map(ToString::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for AdapterNames {
    fn from(names: [&str; N]) -> Self {
        Self(names.iter().map(ToString::to_string).collect())
    }
}

/// Derive the adapter identifier for a weight file name: the stem with every
/// remaining `.` replaced by a sentinel.
///
/// `my.lora.safetensors` → `my_DOT_lora`.
#[must_use]
pub fn adapter_name_for_file(weight_name: &str) -> String {
    let stem = Path::new(weight_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(weight_name);
    stem.replace('.', DOT_SENTINEL)
}

/// Load a LoRA weight file into the model as a named adapter.
///
/// Fetches `<lora_path>/<weight_name>` (default
/// [`DEFAULT_WEIGHT_NAME`]), converts the keys to the transformer's naming
/// convention, and registers the result under the identifier derived from
/// the file name. An adapter already registered under that identifier is
/// deregistered first; reloading replaces, it does not error.
///
/// On accelerator devices, free-memory figures are logged around the load
/// when the context carries a reporter.
///
/// # Errors
/// Fetch, conversion, and registration failures propagate unmodified.
pub fn load_lora<M: AdapterModel>(
    model: &mut M,
    ctx: &DeviceContext,
    lora_path: impl AsRef<Path>,
    weight_name: Option<&str>,
) -> Result<String> {
    let weight_name = weight_name.unwrap_or(DEFAULT_WEIGHT_NAME);

    let free_before = if ctx.is_accelerator() {
        // Cache is released first so the reading reflects real usage.
        ctx.release_cache();
        let free = ctx.free_memory_gb();
        if let Some(gb) = free {
            debug!(free_gb = gb, "device memory before LoRA load");
        }
        free
    } else {
        None
    };

    let state_dict = io::fetch_state_dict(&lora_path, weight_name, ctx.device())?;
    let converted = convert_hunyuan_video_lora(state_dict)?;

    let adapter_name = adapter_name_for_file(weight_name);
    if model.adapter_names().iter().any(|n| n == &adapter_name) {
        info!(adapter = %adapter_name, "replacing existing LoRA adapter");
        model.deregister_adapters(std::slice::from_ref(&adapter_name));
    }

    let alphas = (!converted.network_alphas.is_empty()).then_some(converted.network_alphas);
    model.register_adapter(&adapter_name, converted.state_dict, alphas)?;
    info!(adapter = %adapter_name, "LoRA adapter loaded");

    if ctx.is_accelerator() {
        ctx.release_cache();
        if let (Some(before), Some(after)) = (free_before, ctx.free_memory_gb()) {
            debug!(
                free_gb = after,
                used_gb = before - after,
                "device memory after LoRA load"
            );
        }
    }

    Ok(adapter_name)
}

/// Load the adapter described by `<dir>/manifest.json` and activate it at
/// the manifest strength.
///
/// # Errors
/// Manifest, load, and activation failures propagate unmodified.
pub fn load_lora_from_manifest<M: AdapterModel>(
    model: &mut M,
    ctx: &DeviceContext,
    dir: impl AsRef<Path>,
) -> Result<String> {
    let manifest = io::load_manifest(&dir)?;
    let adapter_name = load_lora(model, ctx, &dir, Some(&manifest.weight_name))?;
    set_adapters(model, adapter_name.clone(), manifest.strength)?;
    Ok(adapter_name)
}

/// Deregister every adapter and sweep residual per-adapter layer state.
///
/// A no-op (logged) when nothing is registered. Deregistration alone may
/// leave orphaned entries in individual layers, so every layer's weight and
/// scale containers are cleared afterwards, then cached device memory is
/// released.
pub fn unload_all<M: AdapterModel>(model: &mut M, ctx: &DeviceContext) {
    let names = model.adapter_names();
    if names.is_empty() {
        info!("no LoRA adapters to unload");
        return;
    }

    model.deregister_adapters(&names);
    model.clear_active_adapters();

    for layer in model.scalable_layers_mut() {
        layer.clear_adapter_state();
    }

    ctx.release_cache();
    info!(count = names.len(), "unloaded all LoRA adapters");
}

/// Overwrite one adapter's scale with `strength` on every layer carrying it.
///
/// Layers whose scale map lacks the identifier are skipped without error or
/// log. Layers still on the legacy single-value scale format are overwritten
/// regardless of the identifier; that behavior is inherited from the old
/// format and deliberately left unchanged.
///
/// # Errors
/// Returns an error if a device-resident scale cannot be re-materialized.
pub fn set_lora_scale<M: AdapterModel>(
    model: &mut M,
    adapter_name: &str,
    strength: f64,
) -> Result<()> {
    for layer in model.scalable_layers_mut() {
        if let Some(state) = layer.scale_state_mut() {
            state.apply(adapter_name, strength)?;
        }
    }
    debug!(adapter = %adapter_name, strength, "applied LoRA scale");
    Ok(())
}

/// Mark the given adapters as the active set with the given weights.
///
/// Accepts one name or a list; weights may be omitted (`()`), a single value
/// broadcast over all names, or a per-name list. Omitted entries default to
/// strength 1.0. Weights are expanded through the architecture's registered
/// scale expansion before activation.
///
/// # Errors
/// - [`LoraError::WeightCountMismatch`] if a weight list does not align with
///   the names; raised before any mutation.
/// - [`LoraError::UnknownArchitecture`] if no scale expansion is registered
///   for the model's architecture.
/// - [`LoraError::AdapterNotFound`] if a name is not registered.
pub fn set_adapters<M: AdapterModel>(
    model: &mut M,
    adapter_names: impl Into<AdapterNames>,
    weights: impl Into<WeightSpec>,
) -> Result<()> {
    let names = adapter_names.into().0;
    let aligned = align_weights(&names, weights.into())?;

    let Some(expand) = expansion_fn(model.architecture()) else {
        return Err(LoraError::UnknownArchitecture {
            architecture: model.architecture().to_string(),
        });
    };

    let counts = model.block_counts();
    let scales = aligned
        .iter()
        .map(|weight| expand(&counts, weight))
        .collect::<Result<Vec<_>>>()?;

    model.set_weights_and_activate(&names, &scales)
}
