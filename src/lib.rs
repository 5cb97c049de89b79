//! # video-lora
//!
//! LoRA adapter lifecycle management for video-diffusion transformers.
//!
//! This crate handles the administrative side of low-rank adapters on a
//! double/single-stream video transformer:
//! - **Load**: fetch a safetensors weight file, convert its keys to the
//!   transformer's naming convention, and register it as a named adapter
//! - **Unload**: deregister every adapter and sweep residual layer state
//! - **Scale**: overwrite one adapter's per-layer strength
//! - **Activate**: normalize a weight specification and mark the active
//!   adapter set
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use video_lora::{
//!     load_lora, set_adapters, unload_all, BlockCounts, DeviceContext, VideoTransformer,
//! };
//! use candle_core::Device;
//!
//! let device = Device::Cpu;
//! let ctx = DeviceContext::new(device.clone());
//! let counts = BlockCounts { transformer_blocks: 20, single_transformer_blocks: 40 };
//! let mut model = VideoTransformer::standard(counts, 3072, &device)?;
//!
//! let name = load_lora(&mut model, &ctx, "loras/", Some("style.safetensors"))?;
//! set_adapters(&mut model, name.as_str(), 0.8)?;
//! // ...
//! unload_all(&mut model, &ctx);
//! ```
//!
//! ## Architecture
//!
//! The manager functions are generic over the [`AdapterModel`] interface;
//! layers opt into scaling through the [`AdapterScalable`] capability.
//! [`VideoTransformer`] is the crate's concrete implementation of both.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod convert;
pub mod device;
pub mod error;
pub mod io;
pub mod layer;
pub mod manager;
pub mod model;
pub mod scale;
pub mod traits;

pub use convert::{convert_hunyuan_video_lora, ConvertedLora};
pub use device::DeviceContext;
pub use error::{LoraError, Result};
pub use io::{
    fetch_state_dict, load_manifest, save_manifest, save_state_dict, AdapterManifest, StateDict,
    DEFAULT_WEIGHT_NAME, MANIFEST_FILENAME,
};
pub use layer::LoraLinear;
pub use manager::{
    adapter_name_for_file, load_lora, load_lora_from_manifest, set_adapters, set_lora_scale,
    unload_all, AdapterNames,
};
pub use model::VideoTransformer;
pub use scale::{
    align_weights, expansion_fn, AdapterWeight, BlockCounts, ExpansionFn, LayerScales,
    ScaleState, ScaleValue, WeightSpec, DEFAULT_STRENGTH, HUNYUAN_VIDEO_ARCH,
};
pub use traits::{AdapterModel, AdapterScalable};
