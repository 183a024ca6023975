//! Linear projection whose weights can be patched with LoRA deltas.
//!
//! Two patch paths:
//! - **Fusion**: the weight tensor is replaced by `W + s · (up · down)`; the
//!   caller keeps the original and hands it back through [`PatchableLinear::restore_weight`].
//! - **Sidecar**: the low-rank pair is kept next to the base weights and added
//!   at forward time:
//!
//! ```text
//! output = base(x) + s · (x @ down.T @ up.T)
//! ```
//!
//! Quantized layers (ggml `QTensor` behind `QMatMul`) only take the sidecar path.

use std::sync::Arc;

use candle_core::quantized::{QMatMul, QTensor};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;

use crate::{Error, Result};

/// Base weights of a [`PatchableLinear`].
#[derive(Debug, Clone)]
pub enum LinearWeight {
    /// Full-precision `[out, in]` weight.
    Dense(Linear),
    /// Packed ggml weight. The `QTensor` is kept so it can be inspected and dequantized.
    Quantized { qtensor: Arc<QTensor>, matmul: QMatMul },
}

/// A LoRA pair attached at forward time.
#[derive(Debug, Clone)]
pub struct Sidecar {
    /// `[rank, in]`
    pub down: Tensor,
    /// `[out, rank]`
    pub up: Tensor,
    /// Combined `alpha / rank × patch weight`.
    pub scale: f64,
}

/// Linear layer with optional bias, patchable by fusion or sidecar.
#[derive(Debug, Clone)]
pub struct PatchableLinear {
    weight: LinearWeight,
    /// Kept outside of `Linear` so the quantized path can share it.
    bias: Option<Tensor>,
    sidecars: Vec<Sidecar>,
}

impl PatchableLinear {
    pub fn dense(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            weight: LinearWeight::Dense(Linear::new(weight, None)),
            bias,
            sidecars: Vec::new(),
        }
    }

    pub fn quantized(qtensor: Arc<QTensor>, bias: Option<Tensor>) -> Result<Self> {
        let matmul = QMatMul::from_arc(qtensor.clone())?;
        Ok(Self {
            weight: LinearWeight::Quantized { qtensor, matmul },
            bias,
            sidecars: Vec::new(),
        })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, LinearWeight::Quantized { .. })
    }

    /// Dense weight tensor, `None` for quantized layers.
    pub fn dense_weight(&self) -> Option<&Tensor> {
        match &self.weight {
            LinearWeight::Dense(linear) => Some(linear.weight()),
            LinearWeight::Quantized { .. } => None,
        }
    }

    pub fn qtensor(&self) -> Option<&Arc<QTensor>> {
        match &self.weight {
            LinearWeight::Dense(_) => None,
            LinearWeight::Quantized { qtensor, .. } => Some(qtensor),
        }
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// `(out_features, in_features)`.
    pub fn shape(&self) -> Result<(usize, usize)> {
        match &self.weight {
            LinearWeight::Dense(linear) => Ok(linear.weight().dims2()?),
            LinearWeight::Quantized { qtensor, .. } => Ok(qtensor.shape().dims2()?),
        }
    }

    pub fn device(&self) -> Device {
        match &self.weight {
            LinearWeight::Dense(linear) => linear.weight().device().clone(),
            LinearWeight::Quantized { qtensor, .. } => qtensor.device(),
        }
    }

    /// Fuse `scale · (up · down)` into the dense weight.
    ///
    /// The delta is accumulated in f32 and cast back to the weight dtype.
    /// Returns the pre-fusion weight so the caller can restore it.
    pub fn fuse_lora(&mut self, down: &Tensor, up: &Tensor, scale: f64) -> Result<Tensor> {
        let LinearWeight::Dense(linear) = &self.weight else {
            return Err(Error::Invariant(
                "cannot fuse a LoRA delta into quantized weights".into(),
            ));
        };
        let original = linear.weight().clone();
        let delta = up
            .to_dtype(DType::F32)?
            .matmul(&down.to_dtype(DType::F32)?)?;
        if delta.dims() != original.dims() {
            return Err(Error::Invariant(format!(
                "LoRA delta shape {:?} does not match weight shape {:?}",
                delta.dims(),
                original.dims()
            )));
        }
        let fused = (original.to_dtype(DType::F32)? + (delta * scale)?)?.to_dtype(original.dtype())?;
        self.weight = LinearWeight::Dense(Linear::new(fused, None));
        Ok(original)
    }

    /// Put back a weight captured before fusion.
    pub fn restore_weight(&mut self, weight: Tensor) {
        self.weight = LinearWeight::Dense(Linear::new(weight, None));
    }

    pub fn push_sidecar(&mut self, sidecar: Sidecar) {
        self.sidecars.push(sidecar);
    }

    pub fn num_sidecars(&self) -> usize {
        self.sidecars.len()
    }

    /// Drop sidecars registered after the first `len`.
    pub fn truncate_sidecars(&mut self, len: usize) {
        self.sidecars.truncate(len);
    }
}

impl Module for PatchableLinear {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let out = match &self.weight {
            LinearWeight::Dense(linear) => linear.forward(x)?,
            LinearWeight::Quantized { matmul, .. } => {
                // ggml kernels take contiguous f32 activations.
                let xs = x.to_dtype(DType::F32)?.contiguous()?;
                matmul.forward(&xs)?.to_dtype(x.dtype())?
            }
        };
        let mut out = match &self.bias {
            Some(bias) => out.broadcast_add(bias)?,
            None => out,
        };
        for sidecar in &self.sidecars {
            let lora = x
                .broadcast_matmul(&sidecar.down.t()?)?
                .broadcast_matmul(&sidecar.up.t()?)?;
            out = (out + lora.affine(sidecar.scale, 0.0)?)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::quantized::GgmlDType;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_dense_forward_with_bias() {
        let dev = Device::Cpu;
        let w = Tensor::ones((4, 8), DType::F32, &dev).unwrap();
        let b = Tensor::new(&[1f32, 2., 3., 4.], &dev).unwrap();
        let layer = PatchableLinear::dense(w, Some(b));

        let x = Tensor::ones((1, 3, 8), DType::F32, &dev).unwrap();
        let out = layer.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 3, 4]);
        let row: Vec<f32> = out.get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        assert_eq!(row, vec![9., 10., 11., 12.]);
    }

    #[test]
    fn test_fusion_matches_sidecar() {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 1.0, (16, 32), &dev).unwrap();
        let down = Tensor::randn(0f32, 0.1, (4, 32), &dev).unwrap();
        let up = Tensor::randn(0f32, 0.1, (16, 4), &dev).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 32), &dev).unwrap();

        let mut fused = PatchableLinear::dense(w.clone(), None);
        fused.fuse_lora(&down, &up, 0.8).unwrap();

        let mut sidecar = PatchableLinear::dense(w, None);
        sidecar.push_sidecar(Sidecar {
            down,
            up,
            scale: 0.8,
        });

        let a = fused.forward(&x).unwrap();
        let b = sidecar.forward(&x).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-4);
    }

    #[test]
    fn test_fuse_then_restore_is_bit_exact() {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 1.0, (8, 32), &dev).unwrap();
        let before: Vec<f32> = w.flatten_all().unwrap().to_vec1().unwrap();

        let mut layer = PatchableLinear::dense(w, None);
        let down = Tensor::ones((2, 32), DType::F32, &dev).unwrap();
        let up = Tensor::ones((8, 2), DType::F32, &dev).unwrap();
        let original = layer.fuse_lora(&down, &up, 0.5).unwrap();
        assert_ne!(
            layer.dense_weight().unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            before
        );

        layer.restore_weight(original);
        let after: Vec<f32> = layer
            .dense_weight()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_fuse_rejects_shape_mismatch() {
        let dev = Device::Cpu;
        let mut layer = PatchableLinear::dense(Tensor::zeros((8, 32), DType::F32, &dev).unwrap(), None);
        let down = Tensor::zeros((2, 16), DType::F32, &dev).unwrap();
        let up = Tensor::zeros((8, 2), DType::F32, &dev).unwrap();
        assert!(matches!(
            layer.fuse_lora(&down, &up, 1.0),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_quantized_layer_refuses_fusion_but_takes_sidecar() {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 1.0, (8, 32), &dev).unwrap();
        let q = QTensor::quantize(&w, GgmlDType::Q8_0).unwrap();
        let mut layer = PatchableLinear::quantized(Arc::new(q), None).unwrap();
        assert!(layer.is_quantized());
        assert_eq!(layer.shape().unwrap(), (8, 32));

        let down = Tensor::ones((2, 32), DType::F32, &dev).unwrap();
        let up = Tensor::ones((8, 2), DType::F32, &dev).unwrap();
        assert!(layer.fuse_lora(&down, &up, 1.0).is_err());

        let x = Tensor::randn(0f32, 1.0, (1, 3, 32), &dev).unwrap();
        let base = layer.forward(&x).unwrap();
        layer.push_sidecar(Sidecar {
            down,
            up,
            scale: 1.0,
        });
        let patched = layer.forward(&x).unwrap();
        assert_eq!(patched.dims(), &[1, 3, 8]);
        assert!(max_abs_diff(&base, &patched) > 0.0);

        layer.truncate_sidecars(0);
        let reverted = layer.forward(&x).unwrap();
        assert_eq!(max_abs_diff(&base, &reverted), 0.0);
    }
}
