//! CLIP text transformer (the FLUX pooled encoder).
//!
//! Causal pre-norm transformer with quick-GELU MLPs. The pooled output is the
//! final-normed hidden state at the end-of-text token of each row, which is
//! what FLUX feeds into its `vector` conditioning.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, LayerNorm};
use serde::Deserialize;

use super::linear::PatchableLinear;
use super::weights::WeightSource;
use crate::lora::PatchableModel;
use crate::{Error, Result};

/// Hyperparameters from the HF `config.json`. Defaults are `openai/clip-vit-large-patch14`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClipTextConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_vocab_size() -> usize {
    49408
}
fn default_hidden_size() -> usize {
    768
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_num_hidden_layers() -> usize {
    12
}
fn default_num_attention_heads() -> usize {
    12
}
fn default_max_position_embeddings() -> usize {
    77
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for ClipTextConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            max_position_embeddings: default_max_position_embeddings(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

fn quick_gelu(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?
}

#[derive(Debug, Clone)]
struct ClipAttention {
    q_proj: PatchableLinear,
    k_proj: PatchableLinear,
    v_proj: PatchableLinear,
    out_proj: PatchableLinear,
    num_heads: usize,
    head_dim: usize,
}

impl ClipAttention {
    fn load(source: &WeightSource, cfg: &ClipTextConfig) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            q_proj: source.pp("q_proj").linear(h, h, true)?,
            k_proj: source.pp("k_proj").linear(h, h, true)?,
            v_proj: source.pp("v_proj").linear(h, h, true)?,
            out_proj: source.pp("out_proj").linear(h, h, true)?,
            num_heads: cfg.num_attention_heads,
            head_dim: h / cfg.num_attention_heads,
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, hidden) = xs.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let scale = (self.head_dim as f64).powf(-0.5);
        let q = split((self.q_proj.forward(xs)? * scale)?)?;
        let k = split(self.k_proj.forward(xs)?)?;
        let v = split(self.v_proj.forward(xs)?)?;

        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .to_dtype(DType::F32)?
            .broadcast_add(causal_mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, hidden))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

#[derive(Debug, Clone)]
struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: LayerNorm,
    fc1: PatchableLinear,
    fc2: PatchableLinear,
    layer_norm2: LayerNorm,
}

impl ClipEncoderLayer {
    fn load(source: &WeightSource, cfg: &ClipTextConfig) -> Result<Self> {
        let mlp = source.pp("mlp");
        Ok(Self {
            self_attn: ClipAttention::load(&source.pp("self_attn"), cfg)?,
            layer_norm1: source.pp("layer_norm1").layer_norm(cfg.hidden_size, cfg.layer_norm_eps)?,
            fc1: mlp.pp("fc1").linear(cfg.hidden_size, cfg.intermediate_size, true)?,
            fc2: mlp.pp("fc2").linear(cfg.intermediate_size, cfg.hidden_size, true)?,
            layer_norm2: source.pp("layer_norm2").layer_norm(cfg.hidden_size, cfg.layer_norm_eps)?,
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let attn = self
            .self_attn
            .forward(&self.layer_norm1.forward(xs)?, causal_mask)?;
        let xs = (xs + attn)?;
        let hidden = quick_gelu(&self.fc1.forward(&self.layer_norm2.forward(&xs)?)?)?;
        let mlp = self.fc2.forward(&hidden)?;
        Ok((xs + mlp)?)
    }

    fn linear_mut(&mut self, path: &str) -> Option<&mut PatchableLinear> {
        match path {
            "self_attn.q_proj" => Some(&mut self.self_attn.q_proj),
            "self_attn.k_proj" => Some(&mut self.self_attn.k_proj),
            "self_attn.v_proj" => Some(&mut self.self_attn.v_proj),
            "self_attn.out_proj" => Some(&mut self.self_attn.out_proj),
            "mlp.fc1" => Some(&mut self.fc1),
            "mlp.fc2" => Some(&mut self.fc2),
            _ => None,
        }
    }
}

/// Outputs of [`ClipTextModel::forward`].
#[derive(Debug, Clone)]
pub struct ClipTextOutput {
    /// `[B, L, hidden]`
    pub last_hidden_state: Tensor,
    /// `[B, hidden]`
    pub pooler_output: Tensor,
}

/// CLIP text model with HF `text_model.*` weight names.
#[derive(Debug, Clone)]
pub struct ClipTextModel {
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<ClipEncoderLayer>,
    final_layer_norm: LayerNorm,
    max_position_embeddings: usize,
    dtype: DType,
    device: Device,
}

impl ClipTextModel {
    pub fn load(source: &WeightSource, cfg: &ClipTextConfig) -> Result<Self> {
        let text_model = source.pp("text_model");
        let embeddings = text_model.pp("embeddings");
        let encoder = text_model.pp("encoder");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| ClipEncoderLayer::load(&encoder.pp(format!("layers.{i}")), cfg))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            token_embedding: embeddings
                .pp("token_embedding")
                .embedding(cfg.vocab_size, cfg.hidden_size)?,
            position_embedding: embeddings
                .pp("position_embedding")
                .embedding(cfg.max_position_embeddings, cfg.hidden_size)?,
            layers,
            final_layer_norm: text_model
                .pp("final_layer_norm")
                .layer_norm(cfg.hidden_size, cfg.layer_norm_eps)?,
            max_position_embeddings: cfg.max_position_embeddings,
            dtype: source.dtype(),
            device: source.device().clone(),
        })
    }

    fn causal_mask(&self, seq_len: usize) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Ok(Tensor::from_vec(mask, (seq_len, seq_len), &self.device)?)
    }

    /// `input_ids [B, L]`, `eos_positions[b]` = index of the end-of-text token in row `b`.
    pub fn forward(&self, input_ids: &Tensor, eos_positions: &[usize]) -> Result<ClipTextOutput> {
        let (batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_position_embeddings {
            return Err(Error::Invariant(format!(
                "CLIP input has {seq_len} tokens, the model supports {}",
                self.max_position_embeddings
            )));
        }
        if eos_positions.len() != batch {
            return Err(Error::Invariant(format!(
                "expected {batch} end-of-text positions, got {}",
                eos_positions.len()
            )));
        }

        let position_ids = Tensor::arange(0u32, seq_len as u32, &self.device)?.unsqueeze(0)?;
        let mut xs = self
            .token_embedding
            .forward(input_ids)?
            .broadcast_add(&self.position_embedding.forward(&position_ids)?)?;
        let mask = self.causal_mask(seq_len)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &mask)?;
        }
        let last_hidden_state = self.final_layer_norm.forward(&xs)?;

        let pooled = eos_positions
            .iter()
            .enumerate()
            .map(|(row, &position)| last_hidden_state.get(row)?.get(position))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let pooler_output = Tensor::stack(&pooled, 0)?;

        Ok(ClipTextOutput {
            last_hidden_state,
            pooler_output,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl PatchableModel for ClipTextModel {
    fn linear_mut(&mut self, module_path: &str) -> Option<&mut PatchableLinear> {
        let rest = module_path.strip_prefix("text_model.encoder.layers.")?;
        let (index, layer_path) = rest.split_once('.')?;
        let index: usize = index.parse().ok()?;
        self.layers.get_mut(index)?.linear_mut(layer_path)
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}
