//! Weight sources shared by the encoder constructors.
//!
//! Full-precision checkpoints come through a candle [`VarBuilder`] and may be
//! quantized while loading (bitsandbytes-style formats); GGUF checkpoints come
//! through the quantized var builder. Encoders build their layers through
//! [`WeightSource`] without caring which one is behind it.

use std::sync::Arc;

use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::{Embedding, LayerNorm, VarBuilder};
use candle_transformers::quantized_var_builder::VarBuilder as QVarBuilder;

use super::linear::PatchableLinear;
use crate::Result;

#[derive(Clone)]
pub enum WeightSource<'a> {
    /// Full-precision tensors. `quantize` packs every projection on load.
    Full {
        vb: VarBuilder<'a>,
        quantize: Option<GgmlDType>,
    },
    /// Block-quantized GGUF tensors. Non-projection tensors are dequantized to `dtype`.
    Gguf { vb: QVarBuilder, dtype: DType },
}

impl<'a> WeightSource<'a> {
    pub fn full(vb: VarBuilder<'a>) -> Self {
        Self::Full { vb, quantize: None }
    }

    pub fn pp(&self, prefix: impl ToString) -> Self {
        match self {
            Self::Full { vb, quantize } => Self::Full {
                vb: vb.pp(prefix.to_string()),
                quantize: *quantize,
            },
            Self::Gguf { vb, dtype } => Self::Gguf {
                vb: vb.pp(prefix.to_string()),
                dtype: *dtype,
            },
        }
    }

    pub fn device(&self) -> &Device {
        match self {
            Self::Full { vb, .. } => vb.device(),
            Self::Gguf { vb, .. } => vb.device(),
        }
    }

    /// Compute dtype of the non-quantized tensors.
    pub fn dtype(&self) -> DType {
        match self {
            Self::Full { vb, .. } => vb.dtype(),
            Self::Gguf { dtype, .. } => *dtype,
        }
    }

    /// A plain tensor (norm weights, embeddings, biases).
    pub fn tensor<S: Into<Shape>>(&self, shape: S, name: &str) -> Result<Tensor> {
        match self {
            Self::Full { vb, .. } => Ok(vb.get(shape, name)?),
            Self::Gguf { vb, dtype } => {
                let q = vb.get(shape, name)?;
                Ok(q.dequantize(vb.device())?.to_dtype(*dtype)?)
            }
        }
    }

    /// A `[out, in]` projection, quantized when the source is.
    pub fn linear(&self, in_dim: usize, out_dim: usize, with_bias: bool) -> Result<PatchableLinear> {
        let bias = if with_bias {
            Some(self.tensor(out_dim, "bias")?)
        } else {
            None
        };
        match self {
            Self::Full { vb, quantize: None } => {
                let weight = vb.get((out_dim, in_dim), "weight")?;
                Ok(PatchableLinear::dense(weight, bias))
            }
            Self::Full {
                vb,
                quantize: Some(qdtype),
            } => {
                let weight = vb.get((out_dim, in_dim), "weight")?.to_dtype(DType::F32)?;
                let qtensor = QTensor::quantize(&weight, *qdtype)?;
                PatchableLinear::quantized(Arc::new(qtensor), bias)
            }
            Self::Gguf { vb, .. } => {
                let qtensor = vb.get((out_dim, in_dim), "weight")?;
                PatchableLinear::quantized(qtensor, bias)
            }
        }
    }

    pub fn embedding(&self, vocab: usize, hidden: usize) -> Result<Embedding> {
        let weight = self.tensor((vocab, hidden), "weight")?;
        Ok(Embedding::new(weight, hidden))
    }

    pub fn layer_norm(&self, dim: usize, eps: f64) -> Result<LayerNorm> {
        let weight = self.tensor(dim, "weight")?;
        let bias = self.tensor(dim, "bias")?;
        Ok(LayerNorm::new(weight, bias, eps))
    }
}
