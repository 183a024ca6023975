//! Text encoder models.
//!
//! ## Components
//!
//! - [`t5`]: T5 v1.1 encoder stack (per-token hidden states)
//! - [`clip`]: CLIP text transformer (pooled embedding)
//! - [`linear`]: projections patchable by LoRA fusion or sidecar
//! - [`weights`]: full-precision, quantize-on-load and GGUF weight sources
//! - [`tokenizer`]: fixed-window prompt tokenization per encoder family

pub mod clip;
pub mod linear;
pub mod t5;
pub mod tokenizer;
pub mod weights;
