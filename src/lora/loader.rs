//! LoRA patch loading from safetensors.
//!
//! Accepted key layouts per layer:
//! - `<layer>.lora_down.weight`, `<layer>.lora_up.weight`, optional `<layer>.alpha`
//! - `<layer>.lora_A.weight`, `<layer>.lora_B.weight` (PEFT)
//!
//! `<layer>` is the full patch key, family prefix included
//! (e.g. `lora_te1-text_model.encoder.layers.0.self_attn.q_proj`). Kohya
//! exports flatten the path with underscores
//! (`lora_te1_text_model_encoder_layers_0_self_attn_q_proj`); those are
//! rewritten to the dotted form on load.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use super::types::{FLUX_LORA_CLIP_PREFIX, FLUX_LORA_T5_PREFIX, LoraLayer, ModelPatch};
use crate::{Error, Result};

#[derive(Default)]
struct LayerParts {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

/// Load a patch from one or more safetensors files onto `device`.
pub fn load_patch(name: &str, paths: &[impl AsRef<Path>], device: &Device) -> Result<ModelPatch> {
    let mut tensors = HashMap::new();
    for path in paths {
        let path = path.as_ref();
        let loaded = candle_core::safetensors::load(path, device).map_err(|e| {
            Error::ResourceAcquisition(format!("LoRA weights {}: {e}", path.display()))
        })?;
        tensors.extend(loaded);
    }
    patch_from_tensors(name, tensors)
}

/// Group raw tensors into [`LoraLayer`]s.
pub fn patch_from_tensors(name: &str, tensors: HashMap<String, Tensor>) -> Result<ModelPatch> {
    let mut parts: BTreeMap<String, LayerParts> = BTreeMap::new();

    for (key, tensor) in tensors {
        let key = normalize_kohya_key(&key).unwrap_or(key);
        if let Some(layer) = key
            .strip_suffix(".lora_down.weight")
            .or_else(|| key.strip_suffix(".lora_A.weight"))
        {
            parts.entry(layer.to_string()).or_default().down = Some(tensor);
        } else if let Some(layer) = key
            .strip_suffix(".lora_up.weight")
            .or_else(|| key.strip_suffix(".lora_B.weight"))
        {
            parts.entry(layer.to_string()).or_default().up = Some(tensor);
        } else if let Some(layer) = key.strip_suffix(".alpha") {
            let alpha = tensor
                .to_dtype(DType::F64)?
                .flatten_all()?
                .get(0)?
                .to_scalar::<f64>()?;
            parts.entry(layer.to_string()).or_default().alpha = Some(alpha);
        } else {
            tracing::debug!(patch = name, key, "ignoring unrecognized LoRA tensor");
        }
    }

    let mut layers = BTreeMap::new();
    for (key, part) in parts {
        let (Some(down), Some(up)) = (part.down, part.up) else {
            return Err(Error::Invariant(format!(
                "LoRA {name}: layer {key} is missing its down or up matrix"
            )));
        };
        layers.insert(key, LoraLayer::new(down, up, part.alpha)?);
    }

    tracing::debug!(patch = name, layers = layers.len(), "LoRA patch loaded");
    Ok(ModelPatch::new(name, layers))
}

/// Underscore-joined names that are single segments of a module path.
const COMPOUND_SEGMENTS: &[&str] = &[
    "text_model",
    "self_attn",
    "q_proj",
    "k_proj",
    "v_proj",
    "out_proj",
    "wi_0",
    "wi_1",
];

/// `lora_te1_text_model_..._q_proj.lora_down.weight` →
/// `lora_te1-text_model.....q_proj.lora_down.weight`.
///
/// `None` for keys that are not kohya-flattened encoder keys.
fn normalize_kohya_key(key: &str) -> Option<String> {
    let (flat, suffix) = key.split_once('.')?;
    let (prefix, path) = [FLUX_LORA_CLIP_PREFIX, FLUX_LORA_T5_PREFIX]
        .into_iter()
        .find_map(|prefix| {
            let kohya = format!("{}_", prefix.trim_end_matches('-'));
            flat.strip_prefix(kohya.as_str()).map(|path| (prefix, path))
        })?;

    let parts: Vec<&str> = path.split('_').collect();
    let mut segments: Vec<String> = Vec::with_capacity(parts.len());
    let mut i = 0;
    while i < parts.len() {
        let pair = parts.get(i + 1).map(|next| format!("{}_{next}", parts[i]));
        match pair {
            Some(pair) if COMPOUND_SEGMENTS.contains(&pair.as_str()) => {
                segments.push(pair);
                i += 2;
            }
            _ => {
                segments.push(parts[i].to_string());
                i += 1;
            }
        }
    }
    Some(format!("{prefix}{}.{suffix}", segments.join(".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros(shape: (usize, usize)) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_kohya_and_peft_names() {
        let mut tensors = HashMap::new();
        tensors.insert("lora_te1-a.lora_down.weight".to_string(), zeros((4, 32)));
        tensors.insert("lora_te1-a.lora_up.weight".to_string(), zeros((16, 4)));
        tensors.insert(
            "lora_te1-a.alpha".to_string(),
            Tensor::new(8f32, &Device::Cpu).unwrap(),
        );
        tensors.insert("lora_te2-b.lora_A.weight".to_string(), zeros((2, 32)));
        tensors.insert("lora_te2-b.lora_B.weight".to_string(), zeros((32, 2)));

        let patch = patch_from_tensors("mixed", tensors).unwrap();
        assert_eq!(patch.num_layers(), 2);
        assert!((patch.get("lora_te1-a").unwrap().scale() - 2.0).abs() < 1e-9);
        assert_eq!(patch.get("lora_te2-b").unwrap().rank(), 2);
    }

    #[test]
    fn test_kohya_flattened_names() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "lora_te1_text_model_encoder_layers_0_self_attn_q_proj.lora_down.weight".to_string(),
            zeros((4, 32)),
        );
        tensors.insert(
            "lora_te1_text_model_encoder_layers_0_self_attn_q_proj.lora_up.weight".to_string(),
            zeros((32, 4)),
        );
        tensors.insert(
            "lora_te1_text_model_encoder_layers_11_mlp_fc1.lora_down.weight".to_string(),
            zeros((4, 32)),
        );
        tensors.insert(
            "lora_te1_text_model_encoder_layers_11_mlp_fc1.lora_up.weight".to_string(),
            zeros((64, 4)),
        );
        tensors.insert(
            "lora_te2_encoder_block_3_layer_1_DenseReluDense_wi_0.lora_down.weight".to_string(),
            zeros((4, 64)),
        );
        tensors.insert(
            "lora_te2_encoder_block_3_layer_1_DenseReluDense_wi_0.lora_up.weight".to_string(),
            zeros((64, 4)),
        );
        tensors.insert(
            "lora_te2_encoder_block_3_layer_1_DenseReluDense_wi_0.alpha".to_string(),
            Tensor::new(2f32, &Device::Cpu).unwrap(),
        );

        let patch = patch_from_tensors("kohya", tensors).unwrap();
        assert_eq!(patch.num_layers(), 3);
        assert!(patch
            .get("lora_te1-text_model.encoder.layers.0.self_attn.q_proj")
            .is_some());
        assert!(patch.get("lora_te1-text_model.encoder.layers.11.mlp.fc1").is_some());
        let wi_0 = patch
            .get("lora_te2-encoder.block.3.layer.1.DenseReluDense.wi_0")
            .unwrap();
        assert!((wi_0.scale() - 0.5).abs() < 1e-9);

        let clip_paths: Vec<&str> = patch
            .layers_with_prefix(FLUX_LORA_CLIP_PREFIX)
            .map(|(path, _)| path)
            .collect();
        assert_eq!(
            clip_paths,
            vec![
                "text_model.encoder.layers.0.self_attn.q_proj",
                "text_model.encoder.layers.11.mlp.fc1",
            ]
        );
    }

    #[test]
    fn test_dotted_and_foreign_keys_are_not_rewritten() {
        assert_eq!(normalize_kohya_key("lora_te1-a.lora_up.weight"), None);
        assert_eq!(normalize_kohya_key("lora_unet_x.lora_up.weight"), None);
        assert_eq!(normalize_kohya_key("no_suffix"), None);
    }

    #[test]
    fn test_missing_half_is_invariant_error() {
        let mut tensors = HashMap::new();
        tensors.insert("lora_te1-a.lora_down.weight".to_string(), zeros((4, 32)));
        assert!(matches!(
            patch_from_tensors("broken", tensors),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_load_from_safetensors_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("style.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("lora_te1-a.lora_down.weight".to_string(), zeros((4, 32)));
        tensors.insert("lora_te1-a.lora_up.weight".to_string(), zeros((16, 4)));
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let patch = load_patch("style", &[&path], &Device::Cpu).unwrap();
        assert_eq!(patch.name(), "style");
        assert_eq!(patch.num_layers(), 1);
    }

    #[test]
    fn test_missing_file_is_resource_error() {
        let result = load_patch("ghost", &["/nonexistent/ghost.safetensors"], &Device::Cpu);
        assert!(matches!(result, Err(Error::ResourceAcquisition(_))));
    }
}
