//! LoRA patch data.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::{Error, Result};

/// Key prefix of FLUX LoRA entries that target the T5 encoder.
pub const FLUX_LORA_T5_PREFIX: &str = "lora_te2-";
/// Key prefix of FLUX LoRA entries that target the CLIP text encoder.
pub const FLUX_LORA_CLIP_PREFIX: &str = "lora_te1-";

/// Low-rank delta for one linear layer.
///
/// ```text
/// ΔW = (alpha / rank) · up · down
/// ```
///
/// - down: `[rank, in_features]`
/// - up: `[out_features, rank]`
#[derive(Debug, Clone)]
pub struct LoraLayer {
    pub down: Tensor,
    pub up: Tensor,
    /// Defaults to `rank` (scale 1.0) when the checkpoint has no alpha.
    pub alpha: Option<f64>,
}

impl LoraLayer {
    pub fn new(down: Tensor, up: Tensor, alpha: Option<f64>) -> Result<Self> {
        let (rank, _) = down.dims2()?;
        let (_, up_rank) = up.dims2()?;
        if rank != up_rank {
            return Err(Error::Invariant(format!(
                "LoRA rank mismatch: down {:?}, up {:?}",
                down.dims(),
                up.dims()
            )));
        }
        Ok(Self { down, up, alpha })
    }

    pub fn rank(&self) -> usize {
        self.down.dims()[0]
    }

    pub fn in_features(&self) -> usize {
        self.down.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.up.dims()[0]
    }

    /// `alpha / rank`.
    pub fn scale(&self) -> f64 {
        let rank = self.rank() as f64;
        self.alpha.unwrap_or(rank) / rank
    }
}

/// A named, immutable bundle of LoRA layers keyed by `prefix + module path`.
///
/// One patch may carry entries for both encoders; [`ModelPatch::layers_with_prefix`]
/// selects the ones meant for a given model.
#[derive(Debug)]
pub struct ModelPatch {
    name: String,
    layers: BTreeMap<String, LoraLayer>,
}

impl ModelPatch {
    pub fn new(name: impl Into<String>, layers: BTreeMap<String, LoraLayer>) -> Self {
        Self {
            name: name.into(),
            layers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn get(&self, key: &str) -> Option<&LoraLayer> {
        self.layers.get(key)
    }

    /// Entries whose key starts with `prefix`, yielded as `(module_path, layer)`.
    pub fn layers_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a LoraLayer)> + 'a {
        self.layers
            .iter()
            .filter_map(move |(key, layer)| key.strip_prefix(prefix).map(|path| (path, layer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn layer(rank: usize, alpha: Option<f64>) -> LoraLayer {
        let dev = Device::Cpu;
        LoraLayer::new(
            Tensor::zeros((rank, 32), DType::F32, &dev).unwrap(),
            Tensor::zeros((16, rank), DType::F32, &dev).unwrap(),
            alpha,
        )
        .unwrap()
    }

    #[test]
    fn test_scale() {
        assert!((layer(4, Some(8.0)).scale() - 2.0).abs() < f64::EPSILON);
        assert!((layer(4, None).scale() - 1.0).abs() < f64::EPSILON);
        let l = layer(4, None);
        assert_eq!((l.in_features(), l.out_features()), (32, 16));
    }

    #[test]
    fn test_rank_mismatch_rejected() {
        let dev = Device::Cpu;
        let result = LoraLayer::new(
            Tensor::zeros((4, 32), DType::F32, &dev).unwrap(),
            Tensor::zeros((16, 8), DType::F32, &dev).unwrap(),
            None,
        );
        assert!(matches!(result, Err(Error::Invariant(_))));
    }

    #[test]
    fn test_prefix_selection_is_disjoint() {
        let mut layers = BTreeMap::new();
        layers.insert(
            format!("{FLUX_LORA_T5_PREFIX}encoder.block.0.layer.0.SelfAttention.q"),
            layer(4, None),
        );
        layers.insert(
            format!("{FLUX_LORA_CLIP_PREFIX}text_model.encoder.layers.0.self_attn.q_proj"),
            layer(4, None),
        );
        let patch = ModelPatch::new("style", layers);

        let t5: Vec<&str> = patch
            .layers_with_prefix(FLUX_LORA_T5_PREFIX)
            .map(|(path, _)| path)
            .collect();
        assert_eq!(t5, vec!["encoder.block.0.layer.0.SelfAttention.q"]);

        let clip: Vec<&str> = patch
            .layers_with_prefix(FLUX_LORA_CLIP_PREFIX)
            .map(|(path, _)| path)
            .collect();
        assert_eq!(clip, vec!["text_model.encoder.layers.0.self_attn.q_proj"]);
    }
}
