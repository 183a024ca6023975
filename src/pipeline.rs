//! FLUX prompt conditioning.
//!
//! ```text
//! prompt ─┬─→ T5 stage   (acquire → patch → tokenize → encode → release)
//!         │        ↓ [1, 256|512, H]
//!         └─→ CLIP stage (acquire → patch → tokenize → encode → release)
//!                  ↓ [1, H']
//!          ConditioningFieldData → store → conditioning name
//! ```
//!
//! The stages are independent but run strictly one after the other: the T5
//! encoder is released before the CLIP encoder is acquired, so at most one of
//! them occupies the device. Both encoder formats are checked before either
//! stage starts, so an unsupported format fails without loading anything.

use std::sync::Arc;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::conditioning::{ConditioningFieldData, FluxConditioningInfo};
use crate::config::{EncoderFamily, PatchStrategy, T5MaxSeqLen};
use crate::context::InvocationContext;
use crate::diagnostics;
use crate::loader::{EncoderConfig, ModelKey, ModelLoader};
use crate::lora::{
    BaselineWeights, FLUX_LORA_CLIP_PREFIX, FLUX_LORA_T5_PREFIX, LayerPatcher, ModelPatch, PatchScope,
    PatchableModel,
};
use crate::model::tokenizer::{CLIP_MAX_SEQ_LEN, PromptTokenizer};
use crate::{Error, Result};

/// A LoRA and the strength to apply it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraField {
    pub lora: ModelKey,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct T5EncoderField {
    pub text_encoder: ModelKey,
    pub tokenizer: ModelKey,
    #[serde(default)]
    pub loras: Vec<LoraField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipField {
    pub text_encoder: ModelKey,
    pub tokenizer: ModelKey,
    #[serde(default)]
    pub loras: Vec<LoraField>,
}

/// Reference to a stored tensor, e.g. a regional prompt mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorField {
    pub tensor_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FluxConditioningField {
    pub conditioning_name: String,
    /// Passed through unchanged from the invocation.
    pub mask: Option<TensorField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FluxConditioningOutput {
    pub conditioning: FluxConditioningField,
}

fn default_t5_max_seq_len() -> T5MaxSeqLen {
    T5MaxSeqLen::Dev512
}

/// Encode one prompt into FLUX conditioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxTextEncoderInvocation {
    pub prompt: String,
    pub clip: ClipField,
    pub t5_encoder: T5EncoderField,
    /// 256 for FLUX schnell, 512 for FLUX dev.
    #[serde(default = "default_t5_max_seq_len")]
    pub t5_max_seq_len: T5MaxSeqLen,
    #[serde(default)]
    pub mask: Option<TensorField>,
}

impl FluxTextEncoderInvocation {
    pub fn invoke(&self, ctx: &InvocationContext) -> Result<FluxConditioningOutput> {
        let t5_config = encoder_config(ctx.models.as_ref(), &self.t5_encoder.text_encoder, EncoderFamily::T5)?;
        let clip_config = encoder_config(ctx.models.as_ref(), &self.clip.text_encoder, EncoderFamily::Clip)?;
        EncoderFamily::T5.patch_strategy(t5_config.format)?;
        EncoderFamily::Clip.patch_strategy(clip_config.format)?;

        // Everything the T5 stage acquires is dropped when it returns.
        let t5_embeds = t5_encode(
            ctx,
            &self.prompt,
            &t5_config,
            &self.t5_encoder,
            self.t5_max_seq_len,
        )?;
        let clip_embeds = clip_encode(ctx, &self.prompt, &clip_config, &self.clip)?;

        let conditioning_name = ctx.conditioning.save(ConditioningFieldData {
            conditionings: vec![FluxConditioningInfo {
                clip_embeds,
                t5_embeds,
            }],
        })?;
        tracing::info!(%conditioning_name, "FLUX conditioning stored");

        Ok(FluxConditioningOutput {
            conditioning: FluxConditioningField {
                conditioning_name,
                mask: self.mask.clone(),
            },
        })
    }
}

fn encoder_config(models: &dyn ModelLoader, key: &ModelKey, family: EncoderFamily) -> Result<EncoderConfig> {
    let config = models.encoder_config(key)?;
    if config.family != family {
        return Err(Error::Invariant(format!(
            "model {key} is a {} encoder, expected {family}",
            config.family
        )));
    }
    Ok(config)
}

/// Loads each LoRA only when the patcher asks for it.
pub struct LoraIter<'a> {
    models: &'a dyn ModelLoader,
    loras: std::slice::Iter<'a, LoraField>,
}

impl<'a> LoraIter<'a> {
    pub fn new(models: &'a dyn ModelLoader, loras: &'a [LoraField]) -> Self {
        Self {
            models,
            loras: loras.iter(),
        }
    }
}

impl Iterator for LoraIter<'_> {
    type Item = Result<(Arc<ModelPatch>, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        let field = self.loras.next()?;
        Some(self.models.load_patch(&field.lora).map(|patch| (patch, field.weight)))
    }
}

/// T5 stage: `[1, max_seq_len, d_model]` hidden states.
pub fn t5_encode(
    ctx: &InvocationContext,
    prompt: &str,
    config: &EncoderConfig,
    field: &T5EncoderField,
    max_seq_len: T5MaxSeqLen,
) -> Result<Tensor> {
    let strategy = EncoderFamily::T5.patch_strategy(config.format)?;
    let max_length = max_seq_len.tokens();

    let mut encoder = ctx.models.t5_on_device(config)?;
    let tokenizer = PromptTokenizer::new(ctx.models.load_tokenizer(&field.tokenizer)?, EncoderFamily::T5)?;
    let (baseline, model) = encoder.parts_mut();
    let patched = patch_encoder(
        ctx.models.as_ref(),
        model,
        baseline,
        &field.loras,
        EncoderFamily::T5,
        strategy,
    )?;

    if ctx.config.log_tokenization {
        diagnostics::log_tokenization(prompt, &tokenizer, max_length)?;
    }
    let tokens = tokenizer.tokenize(prompt, max_length)?;

    ctx.progress.signal_progress("Running T5 encoder");
    let input_ids = tokens.input_ids(patched.device())?;
    patched.forward(&input_ids)
}

/// CLIP stage: `[1, hidden]` pooled embedding over a 77-token window.
pub fn clip_encode(
    ctx: &InvocationContext,
    prompt: &str,
    config: &EncoderConfig,
    field: &ClipField,
) -> Result<Tensor> {
    let strategy = EncoderFamily::Clip.patch_strategy(config.format)?;

    let mut encoder = ctx.models.clip_on_device(config)?;
    let tokenizer = PromptTokenizer::new(ctx.models.load_tokenizer(&field.tokenizer)?, EncoderFamily::Clip)?;
    let (baseline, model) = encoder.parts_mut();
    let patched = patch_encoder(
        ctx.models.as_ref(),
        model,
        baseline,
        &field.loras,
        EncoderFamily::Clip,
        strategy,
    )?;

    if ctx.config.log_tokenization {
        diagnostics::log_tokenization(prompt, &tokenizer, CLIP_MAX_SEQ_LEN)?;
    }
    let tokens = tokenizer.tokenize(prompt, CLIP_MAX_SEQ_LEN)?;

    ctx.progress.signal_progress("Running CLIP encoder");
    let input_ids = tokens.input_ids(patched.device())?;
    let output = patched.forward(&input_ids, &[tokens.eos_position])?;
    Ok(output.pooler_output)
}

/// Apply a stage's LoRAs to its encoder under `strategy`.
fn patch_encoder<'m, M: PatchableModel>(
    models: &dyn ModelLoader,
    model: &'m mut M,
    baseline: Option<&BaselineWeights>,
    loras: &[LoraField],
    family: EncoderFamily,
    strategy: PatchStrategy,
) -> Result<PatchScope<'m, M>> {
    let prefix = match family {
        EncoderFamily::T5 => FLUX_LORA_T5_PREFIX,
        EncoderFamily::Clip => FLUX_LORA_CLIP_PREFIX,
    };
    let dtype = model.dtype();
    let patched = LayerPatcher::apply_smart_model_patches(
        model,
        LoraIter::new(models, loras),
        prefix,
        dtype,
        baseline,
        strategy.force_sidecar(),
    )?;
    let stats = patched.stats();
    if stats.patches > 0 {
        tracing::info!(
            encoder = %family,
            ?strategy,
            patches = stats.patches,
            fused = stats.fused,
            sidecars = stats.sidecars,
            "LoRA patches active"
        );
    }
    Ok(patched)
}
