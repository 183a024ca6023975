//! LoRA patches for the text encoders.
//!
//! - [`types`]: patch data and the per-encoder key prefixes
//! - [`loader`]: reading patches from safetensors
//! - [`patcher`]: scoped fusion / sidecar application with guaranteed restore

pub mod loader;
pub mod patcher;
pub mod types;

pub use patcher::{BaselineWeights, LayerPatcher, PatchScope, PatchStats, PatchableModel};
pub use types::{FLUX_LORA_CLIP_PREFIX, FLUX_LORA_T5_PREFIX, LoraLayer, ModelPatch};
