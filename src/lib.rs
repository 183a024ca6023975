//! FLUX prompt conditioning in pure Rust.
//!
//! A candle-based implementation of the FLUX text-encoding node: a prompt is
//! encoded by a T5 v1.1 encoder (per-token hidden states) and a CLIP text
//! encoder (pooled embedding), optionally with LoRA patches, and the pair is
//! stored as one conditioning record.
//!
//! ## Architecture
//!
//! ```text
//! prompt ──→ T5 tokenizer ──→ T5 encoder (+ LoRA) ──→ [1, 256|512, 4096]
//!                                                            │  (T5 released)
//! prompt ──→ CLIP tokenizer ─→ CLIP encoder (+ LoRA) ─→ [1, 768]
//!                                                            ↓
//!                                               conditioning store → name
//! ```
//!
//! LoRAs are fused into full-precision weights and attached as forward-time
//! sidecars to quantized ones; either way the encoder is restored when the
//! patch scope ends.
//!
//! ## Modules
//!
//! - [`model`]: T5 and CLIP encoders, patchable linear layers, tokenization
//! - [`lora`]: LoRA loading and scoped patch application
//! - [`loader`]: model manifest, weight loading, device residency
//! - [`pipeline`]: the two encoding stages and the orchestrating invocation
//! - [`conditioning`]: conditioning records and stores
//! - [`diagnostics`]: colorized tokenization breakdown
//! - [`manager`]: queued invocations on a blocking worker

pub mod conditioning;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod loader;
pub mod lora;
pub mod manager;
pub mod model;
pub mod pipeline;

mod error;
#[cfg(test)]
mod testing;

pub use error::{Error, Result};
