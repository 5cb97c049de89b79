//! I/O for adapter weight files and manifests.
//!
//! This module provides functionality for:
//! - Fetching LoRA state dicts from safetensors files
//! - Saving state dicts to safetensors format
//! - Reading and writing adapter manifests (JSON)

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{LoraError, Result};
use crate::scale::DEFAULT_STRENGTH;

/// A transient mapping from parameter path to tensor, consumed exactly once
/// by adapter registration.
pub type StateDict = HashMap<String, Tensor>;

/// Default weight file name looked up when the caller gives none.
pub const DEFAULT_WEIGHT_NAME: &str = "pytorch_lora_weights.safetensors";

/// File name of the adapter manifest inside a LoRA directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Fetch a raw LoRA state dict from `<dir>/<weight_name>`.
///
/// The file is a safetensors container; tensors are loaded onto `device`.
///
/// # Errors
/// Returns an error if the file is missing or cannot be parsed.
pub fn fetch_state_dict<P: AsRef<Path>>(
    dir: P,
    weight_name: &str,
    device: &Device,
) -> Result<StateDict> {
    let path = dir.as_ref().join(weight_name);
    if !path.is_file() {
        return Err(LoraError::WeightLoad(format!(
            "weight file not found: {}",
            path.display()
        )));
    }
    Ok(candle_core::safetensors::load(&path, device)?)
}

/// Save a state dict to a safetensors file.
///
/// # Errors
/// Returns an error if serialization or the file write fails.
pub fn save_state_dict<P: AsRef<Path>>(state_dict: &StateDict, path: P) -> Result<()> {
    let tensors: Vec<(&str, Tensor)> = state_dict
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.clone()))
        .collect();

    safetensors::tensor::serialize_to_file(tensors, &None, path.as_ref())
        .map_err(|e| LoraError::Io(format!("failed to save safetensors: {e}")))?;

    Ok(())
}

/// Manifest describing a LoRA directory: which weight file to load and the
/// strength to activate it at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterManifest {
    /// Weight file name relative to the manifest's directory.
    pub weight_name: String,
    /// Strength the adapter is activated at after loading.
    #[serde(default = "default_strength")]
    pub strength: f64,
}

fn default_strength() -> f64 {
    DEFAULT_STRENGTH
}

/// Load the manifest from `<dir>/manifest.json`.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn load_manifest<P: AsRef<Path>>(dir: P) -> Result<AdapterManifest> {
    let path = dir.as_ref().join(MANIFEST_FILENAME);
    let json = fs::read_to_string(&path)
        .map_err(|e| LoraError::Io(format!("failed to read {}: {e}", path.display())))?;

    serde_json::from_str(&json)
        .map_err(|e| LoraError::Io(format!("failed to parse {}: {e}", path.display())))
}

/// Write the manifest to `<dir>/manifest.json`.
///
/// # Errors
/// Returns an error if serialization or the file write fails.
pub fn save_manifest<P: AsRef<Path>>(manifest: &AdapterManifest, dir: P) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| LoraError::Io(format!("failed to serialize manifest: {e}")))?;

    fs::write(dir.as_ref().join(MANIFEST_FILENAME), json)
        .map_err(|e| LoraError::Io(format!("failed to write manifest: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use tempfile::TempDir;

    #[test]
    fn test_save_fetch_state_dict() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;

        let mut state_dict = StateDict::new();
        state_dict.insert(
            "blocks.0.lora_A.weight".to_string(),
            Tensor::randn(0f32, 1f32, (8, 64), &device)?,
        );
        state_dict.insert(
            "blocks.0.lora_B.weight".to_string(),
            Tensor::randn(0f32, 1f32, (64, 8), &device)?,
        );

        save_state_dict(&state_dict, temp_dir.path().join("adapter.safetensors"))?;

        let loaded = fetch_state_dict(temp_dir.path(), "adapter.safetensors", &device)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["blocks.0.lora_A.weight"].dims(), &[8, 64]);
        Ok(())
    }

    #[test]
    fn test_fetch_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = fetch_state_dict(temp_dir.path(), "missing.safetensors", &Device::Cpu);
        assert!(matches!(result.unwrap_err(), LoraError::WeightLoad(_)));
    }

    #[test]
    fn test_manifest_round_trip() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let manifest = AdapterManifest {
            weight_name: "style.safetensors".to_string(),
            strength: 0.8,
        };

        save_manifest(&manifest, temp_dir.path())?;
        let loaded = load_manifest(temp_dir.path())?;
        assert_eq!(loaded, manifest);
        Ok(())
    }

    #[test]
    fn test_manifest_strength_defaults() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(
            temp_dir.path().join(MANIFEST_FILENAME),
            r#"{"weight_name": "style.safetensors"}"#,
        )?;

        let loaded = load_manifest(temp_dir.path())?;
        assert!((loaded.strength - 1.0).abs() < 1e-9);
        Ok(())
    }
}
