//! T5 v1.1 encoder (the FLUX sequence encoder).
//!
//! ```text
//! ids [B, L] → shared embedding → N × (self-attn + gated-GELU FF) → final RMS norm → [B, L, d_model]
//! ```
//!
//! Differences from a textbook transformer that matter for checkpoint parity:
//! - attention scores are not scaled by `1/sqrt(d_kv)`
//! - positions come from a bucketed relative bias computed in block 0 and shared by all blocks
//! - layer norms are RMS only (no mean subtraction, no bias)
//!
//! Every projection is a [`PatchableLinear`] addressable by its HF module path,
//! e.g. `encoder.block.3.layer.0.SelfAttention.q`.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::Embedding;
use serde::Deserialize;

use super::linear::PatchableLinear;
use super::weights::WeightSource;
use crate::lora::PatchableModel;
use crate::{Error, Result};

/// Hyperparameters from the HF `config.json`. Defaults are `google/t5-v1_1-xxl`.
#[derive(Debug, Clone, Deserialize)]
pub struct T5Config {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_d_kv")]
    pub d_kv: usize,
    #[serde(default = "default_d_ff")]
    pub d_ff: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,
}

fn default_vocab_size() -> usize {
    32128
}
fn default_d_model() -> usize {
    4096
}
fn default_d_kv() -> usize {
    64
}
fn default_d_ff() -> usize {
    10240
}
fn default_num_layers() -> usize {
    24
}
fn default_num_heads() -> usize {
    64
}
fn default_num_buckets() -> usize {
    32
}
fn default_max_distance() -> usize {
    128
}
fn default_eps() -> f64 {
    1e-6
}

impl Default for T5Config {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            d_model: default_d_model(),
            d_kv: default_d_kv(),
            d_ff: default_d_ff(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            relative_attention_num_buckets: default_num_buckets(),
            relative_attention_max_distance: default_max_distance(),
            layer_norm_epsilon: default_eps(),
        }
    }
}

impl T5Config {
    pub fn inner_dim(&self) -> usize {
        self.num_heads * self.d_kv
    }
}

/// T5 RMS norm: `x / sqrt(mean(x²) + eps) * w`, computed in f32.
#[derive(Debug, Clone)]
struct T5LayerNorm {
    weight: Tensor,
    eps: f64,
}

impl T5LayerNorm {
    fn load(source: &WeightSource, dim: usize, eps: f64) -> Result<Self> {
        Ok(Self {
            weight: source.tensor(dim, "weight")?,
            eps,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let xs = xs.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(xs.to_dtype(dtype)?.broadcast_mul(&self.weight)?)
    }
}

/// Bidirectional relative position bucket (T5 `_relative_position_bucket`).
///
/// `relative_position = key_pos - query_pos`.
pub fn relative_position_bucket(relative_position: i64, num_buckets: usize, max_distance: usize) -> u32 {
    let num_buckets = (num_buckets / 2) as i64;
    let mut bucket = if relative_position > 0 { num_buckets } else { 0 };
    let distance = relative_position.unsigned_abs() as i64;
    let max_exact = num_buckets / 2;
    if distance < max_exact {
        bucket += distance;
    } else {
        let scaled = (distance as f64 / max_exact as f64).ln()
            / (max_distance as f64 / max_exact as f64).ln()
            * (num_buckets - max_exact) as f64;
        bucket += (max_exact + scaled as i64).min(num_buckets - 1);
    }
    bucket as u32
}

#[derive(Debug, Clone)]
struct T5Attention {
    q: PatchableLinear,
    k: PatchableLinear,
    v: PatchableLinear,
    o: PatchableLinear,
    relative_attention_bias: Option<Embedding>,
    num_heads: usize,
    d_kv: usize,
    num_buckets: usize,
    max_distance: usize,
}

impl T5Attention {
    fn load(source: &WeightSource, cfg: &T5Config, has_relative_bias: bool) -> Result<Self> {
        let inner = cfg.inner_dim();
        let relative_attention_bias = if has_relative_bias {
            Some(
                source
                    .pp("relative_attention_bias")
                    .embedding(cfg.relative_attention_num_buckets, cfg.num_heads)?,
            )
        } else {
            None
        };
        Ok(Self {
            q: source.pp("q").linear(cfg.d_model, inner, false)?,
            k: source.pp("k").linear(cfg.d_model, inner, false)?,
            v: source.pp("v").linear(cfg.d_model, inner, false)?,
            o: source.pp("o").linear(inner, cfg.d_model, false)?,
            relative_attention_bias,
            num_heads: cfg.num_heads,
            d_kv: cfg.d_kv,
            num_buckets: cfg.relative_attention_num_buckets,
            max_distance: cfg.relative_attention_max_distance,
        })
    }

    /// `[1, H, L, L]` position bias. Only block 0 owns the embedding.
    fn compute_bias(&self, seq_len: usize, device: &Device) -> Result<Option<Tensor>> {
        let Some(embedding) = &self.relative_attention_bias else {
            return Ok(None);
        };
        let buckets: Vec<u32> = (0..seq_len as i64)
            .flat_map(|query| {
                (0..seq_len as i64).map(move |key| {
                    relative_position_bucket(key - query, self.num_buckets, self.max_distance)
                })
            })
            .collect();
        let buckets = Tensor::from_vec(buckets, (seq_len, seq_len), device)?;
        // [L, L, H] → [1, H, L, L]
        let bias = embedding.forward(&buckets)?.permute((2, 0, 1))?.unsqueeze(0)?;
        Ok(Some(bias))
    }

    fn forward(&self, xs: &Tensor, position_bias: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.num_heads, self.d_kv))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(self.q.forward(xs)?)?;
        let k = split(self.k.forward(xs)?)?;
        let v = split(self.v.forward(xs)?)?;

        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .to_dtype(DType::F32)?
            .broadcast_add(&position_bias.to_dtype(DType::F32)?)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.d_kv))?;
        Ok(self.o.forward(&out)?)
    }
}

#[derive(Debug, Clone)]
struct T5GatedFeedForward {
    wi_0: PatchableLinear,
    wi_1: PatchableLinear,
    wo: PatchableLinear,
}

impl T5GatedFeedForward {
    fn load(source: &WeightSource, cfg: &T5Config) -> Result<Self> {
        Ok(Self {
            wi_0: source.pp("wi_0").linear(cfg.d_model, cfg.d_ff, false)?,
            wi_1: source.pp("wi_1").linear(cfg.d_model, cfg.d_ff, false)?,
            wo: source.pp("wo").linear(cfg.d_ff, cfg.d_model, false)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // gelu_new (tanh approximation) gate
        let gate = self.wi_0.forward(xs)?.gelu()?;
        let hidden = (gate * self.wi_1.forward(xs)?)?;
        Ok(self.wo.forward(&hidden)?)
    }
}

#[derive(Debug, Clone)]
struct T5Block {
    attention: T5Attention,
    attention_norm: T5LayerNorm,
    ff: T5GatedFeedForward,
    ff_norm: T5LayerNorm,
}

impl T5Block {
    fn load(source: &WeightSource, cfg: &T5Config, index: usize) -> Result<Self> {
        let attn = source.pp("layer.0");
        let ff = source.pp("layer.1");
        Ok(Self {
            attention: T5Attention::load(&attn.pp("SelfAttention"), cfg, index == 0)?,
            attention_norm: T5LayerNorm::load(&attn.pp("layer_norm"), cfg.d_model, cfg.layer_norm_epsilon)?,
            ff: T5GatedFeedForward::load(&ff.pp("DenseReluDense"), cfg)?,
            ff_norm: T5LayerNorm::load(&ff.pp("layer_norm"), cfg.d_model, cfg.layer_norm_epsilon)?,
        })
    }

    fn forward(&self, xs: &Tensor, position_bias: &Tensor) -> Result<Tensor> {
        let attn = self
            .attention
            .forward(&self.attention_norm.forward(xs)?, position_bias)?;
        let xs = (xs + attn)?;
        let ff = self.ff.forward(&self.ff_norm.forward(&xs)?)?;
        Ok((xs + ff)?)
    }

    fn linear_mut(&mut self, path: &str) -> Option<&mut PatchableLinear> {
        match path {
            "layer.0.SelfAttention.q" => Some(&mut self.attention.q),
            "layer.0.SelfAttention.k" => Some(&mut self.attention.k),
            "layer.0.SelfAttention.v" => Some(&mut self.attention.v),
            "layer.0.SelfAttention.o" => Some(&mut self.attention.o),
            "layer.1.DenseReluDense.wi_0" => Some(&mut self.ff.wi_0),
            "layer.1.DenseReluDense.wi_1" => Some(&mut self.ff.wi_1),
            "layer.1.DenseReluDense.wo" => Some(&mut self.ff.wo),
            _ => None,
        }
    }
}

/// T5 encoder stack. Produces `last_hidden_state`.
#[derive(Debug, Clone)]
pub struct T5EncoderModel {
    shared: Embedding,
    blocks: Vec<T5Block>,
    final_layer_norm: T5LayerNorm,
    dtype: DType,
    device: Device,
}

impl T5EncoderModel {
    /// Load from the root of an HF `T5EncoderModel` checkpoint
    /// (`shared.weight`, `encoder.block.*`, `encoder.final_layer_norm.weight`).
    pub fn load(source: &WeightSource, cfg: &T5Config) -> Result<Self> {
        let shared = source.pp("shared").embedding(cfg.vocab_size, cfg.d_model)?;
        let encoder = source.pp("encoder");
        let blocks = (0..cfg.num_layers)
            .map(|i| T5Block::load(&encoder.pp(format!("block.{i}")), cfg, i))
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm =
            T5LayerNorm::load(&encoder.pp("final_layer_norm"), cfg.d_model, cfg.layer_norm_epsilon)?;
        Ok(Self {
            shared,
            blocks,
            final_layer_norm,
            dtype: source.dtype(),
            device: source.device().clone(),
        })
    }

    /// `input_ids [B, L]` → `[B, L, d_model]`.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let mut xs = self.shared.forward(input_ids)?;
        if let Some(first) = self.blocks.first() {
            let position_bias = first
                .attention
                .compute_bias(seq_len, &self.device)?
                .ok_or_else(|| Error::Invariant("T5 block 0 has no relative attention bias".into()))?;
            for block in &self.blocks {
                xs = block.forward(&xs, &position_bias)?;
            }
        }
        self.final_layer_norm.forward(&xs)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl PatchableModel for T5EncoderModel {
    fn linear_mut(&mut self, module_path: &str) -> Option<&mut PatchableLinear> {
        let rest = module_path.strip_prefix("encoder.block.")?;
        let (index, layer_path) = rest.split_once('.')?;
        let index: usize = index.parse().ok()?;
        self.blocks.get_mut(index)?.linear_mut(layer_path)
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}
