//! Test doubles shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use candle_core::quantized::GgmlDType;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;

use crate::config::{EncoderFamily, EncoderFormat};
use crate::loader::{EncoderConfig, ModelKey, ModelLoader, OnDevice, quantize_on_load};
use crate::lora::{FLUX_LORA_CLIP_PREFIX, FLUX_LORA_T5_PREFIX, LoraLayer, ModelPatch};
use crate::model::clip::{self, ClipTextModel};
use crate::model::t5::{self, T5EncoderModel};
use crate::model::weights::WeightSource;
use crate::{Error, Result};

/// Word-level tokenizer over `vocab`, ids in order. Needs `<unk>` in the vocab.
pub(crate) fn word_level_tokenizer(vocab: &[&str]) -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = vocab
        .iter()
        .enumerate()
        .map(|(id, token)| (token.to_string(), serde_json::json!(id)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "WhitespaceSplit"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"},
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
}

const WORDS: [&str; 5] = ["a", "red", "fox", "sun", "set"];

pub(crate) fn t5_tokenizer() -> Tokenizer {
    let mut vocab = vec!["<pad>", "</s>", "<unk>"];
    vocab.extend(WORDS);
    word_level_tokenizer(&vocab)
}

pub(crate) fn clip_tokenizer() -> Tokenizer {
    let mut vocab = vec!["<|startoftext|>", "<|endoftext|>", "<unk>"];
    vocab.extend(WORDS);
    word_level_tokenizer(&vocab)
}

fn lora(out_dim: usize, in_dim: usize) -> LoraLayer {
    let dev = Device::Cpu;
    LoraLayer::new(
        Tensor::randn(0f32, 0.1, (4, in_dim), &dev).unwrap(),
        Tensor::randn(0f32, 0.1, (out_dim, 4), &dev).unwrap(),
        Some(4.0),
    )
    .unwrap()
}

/// Patch for the tiny T5: one attention and one feed-forward projection.
pub(crate) fn t5_patch() -> ModelPatch {
    let cfg = t5::tests::tiny_config();
    let inner = cfg.inner_dim();
    let mut layers = BTreeMap::new();
    layers.insert(
        format!("{FLUX_LORA_T5_PREFIX}encoder.block.0.layer.0.SelfAttention.q"),
        lora(inner, cfg.d_model),
    );
    layers.insert(
        format!("{FLUX_LORA_T5_PREFIX}encoder.block.1.layer.1.DenseReluDense.wo"),
        lora(cfg.d_model, cfg.d_ff),
    );
    ModelPatch::new("t5_style", layers)
}

/// Patch for the tiny CLIP, plus one T5 entry it must ignore.
pub(crate) fn clip_patch() -> ModelPatch {
    let cfg = clip::tests::tiny_config();
    let h = cfg.hidden_size;
    let mut layers = BTreeMap::new();
    layers.insert(
        format!("{FLUX_LORA_CLIP_PREFIX}text_model.encoder.layers.0.self_attn.q_proj"),
        lora(h, h),
    );
    layers.insert(
        format!("{FLUX_LORA_CLIP_PREFIX}text_model.encoder.layers.1.mlp.fc1"),
        lora(cfg.intermediate_size, h),
    );
    layers.insert(
        format!("{FLUX_LORA_T5_PREFIX}encoder.block.0.layer.0.SelfAttention.q"),
        lora(32, 64),
    );
    ModelPatch::new("clip_style", layers)
}

/// In-memory [`ModelLoader`] over tiny zero-initialized encoders.
///
/// Records `acquire:<key>`, `release:<key>`, `tokenizer:<key>` and
/// `patch:<key>` events in call order.
pub(crate) struct FakeModelLoader {
    formats: HashMap<ModelKey, (EncoderFamily, EncoderFormat)>,
    patches: Mutex<HashMap<ModelKey, Arc<ModelPatch>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl FakeModelLoader {
    /// Encoders `t5` and `clip`, tokenizers `t5_tokenizer` and `clip_tokenizer`.
    pub(crate) fn new(t5_format: EncoderFormat, clip_format: EncoderFormat) -> Self {
        let mut formats = HashMap::new();
        formats.insert(ModelKey::from("t5"), (EncoderFamily::T5, t5_format));
        formats.insert(ModelKey::from("clip"), (EncoderFamily::Clip, clip_format));
        Self {
            formats,
            patches: Mutex::new(HashMap::new()),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn add_patch(&self, key: &str, patch: ModelPatch) {
        self.patches
            .lock()
            .unwrap()
            .insert(ModelKey::from(key), Arc::new(patch));
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn on_device<M>(&self, config: &EncoderConfig, model: M) -> OnDevice<M> {
        self.record(format!("acquire:{}", config.key));
        let events = self.events.clone();
        let release = format!("release:{}", config.key);
        OnDevice::new(config.key.clone(), model, None, move || {
            events.lock().unwrap().push(release)
        })
    }

    fn source(config: &EncoderConfig) -> WeightSource<'static> {
        WeightSource::Full {
            vb: VarBuilder::zeros(config.dtype, &Device::Cpu),
            // GGUF has no loader-side packing; stand in with Q4_0.
            quantize: match config.format {
                EncoderFormat::GgufQuantized => Some(GgmlDType::Q4_0),
                format => quantize_on_load(format),
            },
        }
    }
}

impl ModelLoader for FakeModelLoader {
    fn encoder_config(&self, key: &ModelKey) -> Result<EncoderConfig> {
        let (family, format) = self
            .formats
            .get(key)
            .copied()
            .ok_or_else(|| Error::ResourceAcquisition(format!("unknown model {key}")))?;
        Ok(EncoderConfig {
            key: key.clone(),
            family,
            format,
            dtype: DType::F32,
        })
    }

    fn t5_on_device(&self, config: &EncoderConfig) -> Result<OnDevice<T5EncoderModel>> {
        let model = T5EncoderModel::load(&Self::source(config), &t5::tests::tiny_config())?;
        Ok(self.on_device(config, model))
    }

    fn clip_on_device(&self, config: &EncoderConfig) -> Result<OnDevice<ClipTextModel>> {
        let model = ClipTextModel::load(&Self::source(config), &clip::tests::tiny_config())?;
        Ok(self.on_device(config, model))
    }

    fn load_tokenizer(&self, key: &ModelKey) -> Result<Tokenizer> {
        self.record(format!("tokenizer:{key}"));
        match key.as_str() {
            "t5_tokenizer" => Ok(t5_tokenizer()),
            "clip_tokenizer" => Ok(clip_tokenizer()),
            _ => Err(Error::ResourceAcquisition(format!("unknown tokenizer {key}"))),
        }
    }

    fn load_patch(&self, key: &ModelKey) -> Result<Arc<ModelPatch>> {
        let patch = self
            .patches
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ResourceAcquisition(format!("unknown LoRA {key}")))?;
        self.record(format!("patch:{key}"));
        Ok(patch)
    }
}
