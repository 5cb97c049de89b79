//! LoRA key conversion to the video transformer's naming convention.
//!
//! Adapter files for the double/single-stream video architecture circulate in
//! the original checkpoint naming (`double_blocks.N.img_attn_qkv`, Kohya
//! `lora_down`/`lora_up` suffixes, fused qkv projections). The transformer
//! registers adapters under its own module paths
//! (`transformer_blocks.N.attn.to_q`, PEFT `lora_A`/`lora_B` suffixes, split
//! projections), so every state dict passes through this conversion before
//! registration.

use std::collections::HashMap;

use candle_core::{DType, Tensor};

use crate::error::{LoraError, Result};
use crate::io::StateDict;

/// A converted LoRA state dict plus the network alphas extracted from it.
#[derive(Debug)]
pub struct ConvertedLora {
    /// Tensors under the transformer's naming convention.
    pub state_dict: StateDict,
    /// Per-module alpha scalars pulled out of `.alpha` entries. Empty when
    /// the file carried none.
    pub network_alphas: HashMap<String, f64>,
}

/// The role a state-dict entry plays for its module.
enum Role {
    /// Down projection (`lora_down` / `lora_A`)
    A,
    /// Up projection (`lora_up` / `lora_B`)
    B,
    /// Alpha scalar
    Alpha,
}

/// How a fused projection's up-projection rows are divided among targets.
enum Split {
    /// Equal chunks, one per target (fused qkv).
    Equal,
    /// Three attention chunks of `h` rows plus one MLP chunk of `4h` rows,
    /// where the fused output dimension is `7h` (single-stream `linear1`).
    QkvMlp,
}

/// Where a source module lands in the target convention.
enum Mapped {
    Single(String),
    Fused { targets: Vec<String>, split: Split },
}

/// Convert a raw LoRA state dict to the transformer's naming convention.
///
/// Handles prefix stripping (`diffusion_model.`, `transformer.`), Kohya →
/// PEFT suffix renaming, block renames, fused-projection splitting, and
/// alpha extraction. Keys already in the target convention pass through
/// unchanged.
///
/// # Errors
/// Returns [`LoraError::UnmappedKey`] for a key that does not resolve to a
/// known module, or a weight-load error when a fused tensor cannot be split.
pub fn convert_hunyuan_video_lora(state_dict: StateDict) -> Result<ConvertedLora> {
    let mut converted = StateDict::new();
    let mut network_alphas = HashMap::new();

    for (key, tensor) in state_dict {
        let stripped = key
            .strip_prefix("diffusion_model.")
            .or_else(|| key.strip_prefix("transformer."))
            .unwrap_or(&key);

        let (module, role) = split_role(stripped).ok_or_else(|| LoraError::UnmappedKey {
            key: key.clone(),
        })?;
        let mapped = rename_module(module).ok_or_else(|| LoraError::UnmappedKey {
            key: key.clone(),
        })?;

        match (mapped, role) {
            (Mapped::Single(target), Role::A) => {
                converted.insert(format!("{target}.lora_A.weight"), tensor);
            }
            (Mapped::Single(target), Role::B) => {
                converted.insert(format!("{target}.lora_B.weight"), tensor);
            }
            (Mapped::Single(target), Role::Alpha) => {
                network_alphas.insert(target, read_alpha(&key, &tensor)?);
            }
            (Mapped::Fused { targets, .. }, Role::A) => {
                // The down projection is shared by every split target.
                for target in targets {
                    converted.insert(format!("{target}.lora_A.weight"), tensor.clone());
                }
            }
            (Mapped::Fused { targets, split }, Role::B) => {
                for (target, chunk) in split_up_projection(&key, &tensor, &targets, &split)? {
                    converted.insert(format!("{target}.lora_B.weight"), chunk);
                }
            }
            (Mapped::Fused { targets, .. }, Role::Alpha) => {
                let alpha = read_alpha(&key, &tensor)?;
                for target in targets {
                    network_alphas.insert(target, alpha);
                }
            }
        }
    }

    Ok(ConvertedLora {
        state_dict: converted,
        network_alphas,
    })
}

/// Split a key into its module path and entry role.
fn split_role(key: &str) -> Option<(&str, Role)> {
    if let Some(module) = key
        .strip_suffix(".lora_down.weight")
        .or_else(|| key.strip_suffix(".lora_A.weight"))
    {
        return Some((module, Role::A));
    }
    if let Some(module) = key
        .strip_suffix(".lora_up.weight")
        .or_else(|| key.strip_suffix(".lora_B.weight"))
    {
        return Some((module, Role::B));
    }
    if let Some(module) = key.strip_suffix(".alpha") {
        return Some((module, Role::Alpha));
    }
    None
}

/// Map a source module path into the target convention.
fn rename_module(module: &str) -> Option<Mapped> {
    if let Some(rest) = module.strip_prefix("double_blocks.") {
        let (index, inner) = split_block_index(rest)?;
        let base = format!("transformer_blocks.{index}");
        let mapped = match inner {
            "img_attn_qkv" => Mapped::Fused {
                targets: attn_targets(&base, &["to_q", "to_k", "to_v"]),
                split: Split::Equal,
            },
            "txt_attn_qkv" => Mapped::Fused {
                targets: attn_targets(&base, &["add_q_proj", "add_k_proj", "add_v_proj"]),
                split: Split::Equal,
            },
            "img_attn_proj" => Mapped::Single(format!("{base}.attn.to_out.0")),
            "txt_attn_proj" => Mapped::Single(format!("{base}.attn.to_add_out")),
            "img_mlp.fc1" => Mapped::Single(format!("{base}.ff.net.0.proj")),
            "img_mlp.fc2" => Mapped::Single(format!("{base}.ff.net.2")),
            "txt_mlp.fc1" => Mapped::Single(format!("{base}.ff_context.net.0.proj")),
            "txt_mlp.fc2" => Mapped::Single(format!("{base}.ff_context.net.2")),
            "img_mod.linear" => Mapped::Single(format!("{base}.norm1.linear")),
            "txt_mod.linear" => Mapped::Single(format!("{base}.norm1_context.linear")),
            _ => return None,
        };
        return Some(mapped);
    }

    if let Some(rest) = module.strip_prefix("single_blocks.") {
        let (index, inner) = split_block_index(rest)?;
        let base = format!("single_transformer_blocks.{index}");
        let mapped = match inner {
            "linear1" => Mapped::Fused {
                targets: vec![
                    format!("{base}.attn.to_q"),
                    format!("{base}.attn.to_k"),
                    format!("{base}.attn.to_v"),
                    format!("{base}.proj_mlp"),
                ],
                split: Split::QkvMlp,
            },
            "linear2" => Mapped::Single(format!("{base}.proj_out")),
            "modulation.linear" => Mapped::Single(format!("{base}.norm.linear")),
            _ => return None,
        };
        return Some(mapped);
    }

    // Already in the target convention.
    if module.starts_with("transformer_blocks.") || module.starts_with("single_transformer_blocks.")
    {
        return Some(Mapped::Single(module.to_string()));
    }

    None
}

fn attn_targets(base: &str, projections: &[&str]) -> Vec<String> {
    projections
        .iter()
        .map(|p| format!("{base}.attn.{p}"))
        .collect()
}

/// Split `"<index>.<inner>"` into its parts, validating the index.
fn split_block_index(rest: &str) -> Option<(usize, &str)> {
    let (index, inner) = rest.split_once('.')?;
    let index = index.parse::<usize>().ok()?;
    Some((index, inner))
}

/// Divide a fused up-projection tensor among its split targets along dim 0.
fn split_up_projection(
    key: &str,
    tensor: &Tensor,
    targets: &[String],
    split: &Split,
) -> Result<Vec<(String, Tensor)>> {
    let rows = tensor.dims().first().copied().unwrap_or(0);
    let chunks = match split {
        Split::Equal => {
            if targets.is_empty() || rows % targets.len() != 0 {
                return Err(LoraError::WeightLoad(format!(
                    "cannot split {key}: {rows} rows into {} equal chunks",
                    targets.len()
                )));
            }
            tensor.chunk(targets.len(), 0)?
        }
        Split::QkvMlp => {
            if rows % 7 != 0 {
                return Err(LoraError::WeightLoad(format!(
                    "cannot split {key}: fused output dimension {rows} is not a multiple of 7"
                )));
            }
            let h = rows / 7;
            vec![
                tensor.narrow(0, 0, h)?,
                tensor.narrow(0, h, h)?,
                tensor.narrow(0, 2 * h, h)?,
                tensor.narrow(0, 3 * h, 4 * h)?,
            ]
        }
    };

    Ok(targets.iter().cloned().zip(chunks).collect())
}

/// Read an alpha entry back as a scalar.
fn read_alpha(key: &str, tensor: &Tensor) -> Result<f64> {
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    values
        .first()
        .map(|v| f64::from(*v))
        .ok_or_else(|| LoraError::WeightLoad(format!("empty alpha tensor for {key}")))
}
