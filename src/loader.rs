//! Model loading and device residency.
//!
//! ```text
//! ModelKey ──manifest──→ ModelRecord ──resolve──→ local files
//!                                                   │
//!                 encoder_config()  (no file access)│
//!                 t5_on_device() / clip_on_device() ←┘
//!                          │
//!                          ↓
//!                    OnDevice<M>   baseline + model, released on drop
//! ```
//!
//! Full-precision weights are read once into host memory and cached; every
//! acquisition builds a fresh device copy from that cache, and the cache doubles
//! as the baseline the patch engine restores from. Quantized formats are
//! rebuilt from disk each time and have no baseline.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use candle_core::quantized::GgmlDType;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::quantized_var_builder::VarBuilder as QVarBuilder;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::config::{EncoderFamily, EncoderFormat};
use crate::lora::{self, BaselineWeights, ModelPatch};
use crate::model::clip::{ClipTextConfig, ClipTextModel};
use crate::model::t5::{T5Config, T5EncoderModel};
use crate::model::weights::WeightSource;
use crate::{Error, Result};

/// Name of a model in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelKey(pub String);

impl ModelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Static configuration of an encoder, known without touching its weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub key: ModelKey,
    pub family: EncoderFamily,
    pub format: EncoderFormat,
    /// Compute dtype of full-precision tensors.
    pub dtype: DType,
}

/// Storage formats that are packed to a ggml block type while loading.
pub fn quantize_on_load(format: EncoderFormat) -> Option<GgmlDType> {
    match format {
        EncoderFormat::BnbQuantizedLlmInt8b => Some(GgmlDType::Q8_0),
        EncoderFormat::BnbQuantizedNf4b => Some(GgmlDType::Q4_0),
        EncoderFormat::T5Encoder
        | EncoderFormat::Diffusers
        | EncoderFormat::GgufQuantized
        | EncoderFormat::Checkpoint => None,
    }
}

/// Source of encoders, tokenizers and LoRA patches.
pub trait ModelLoader: Send + Sync {
    /// Static configuration. Must not load weights or touch the device.
    fn encoder_config(&self, key: &ModelKey) -> Result<EncoderConfig>;

    fn t5_on_device(&self, config: &EncoderConfig) -> Result<OnDevice<T5EncoderModel>>;

    fn clip_on_device(&self, config: &EncoderConfig) -> Result<OnDevice<ClipTextModel>>;

    fn load_tokenizer(&self, key: &ModelKey) -> Result<Tokenizer>;

    fn load_patch(&self, key: &ModelKey) -> Result<Arc<ModelPatch>>;
}

struct ReleaseOnDrop(Option<Box<dyn FnOnce() + Send>>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// A model resident on its device for as long as this value lives.
///
/// Fields drop in declaration order, so the model's tensors are gone before
/// the release callback runs.
pub struct OnDevice<M> {
    model: M,
    baseline: Option<Arc<BaselineWeights>>,
    key: ModelKey,
    _release: ReleaseOnDrop,
}

impl<M> OnDevice<M> {
    pub fn new(
        key: ModelKey,
        model: M,
        baseline: Option<Arc<BaselineWeights>>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            model,
            baseline,
            key,
            _release: ReleaseOnDrop(Some(Box::new(release))),
        }
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Unpatched weights (if cached) and the live model.
    pub fn parts_mut(&mut self) -> (Option<&BaselineWeights>, &mut M) {
        (self.baseline.as_deref(), &mut self.model)
    }
}

/// Which models are currently resident on a device.
#[derive(Debug, Clone, Default)]
pub struct ResidencyTracker {
    resident: Arc<Mutex<Vec<ModelKey>>>,
}

impl ResidencyTracker {
    pub fn acquire(&self, key: &ModelKey) {
        let mut resident = self.resident.lock().unwrap_or_else(|e| e.into_inner());
        resident.push(key.clone());
        tracing::debug!(model = %key, resident = resident.len(), "model on device");
    }

    pub fn release(&self, key: &ModelKey) {
        let mut resident = self.resident.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = resident.iter().position(|k| k == key) {
            resident.remove(index);
        }
        tracing::debug!(model = %key, resident = resident.len(), "model released");
    }

    pub fn resident(&self) -> Vec<ModelKey> {
        self.resident
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wrap `model` so that dropping it releases `key`.
    pub fn on_device<M>(
        &self,
        key: &ModelKey,
        model: M,
        baseline: Option<Arc<BaselineWeights>>,
    ) -> OnDevice<M> {
        self.acquire(key);
        let tracker = self.clone();
        let released = key.clone();
        OnDevice::new(key.clone(), model, baseline, move || {
            tracker.release(&released)
        })
    }
}

// ── Manifest ────────────────────────────────────────────────────────────────

/// Where a model's files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSource {
    /// A file or a directory on disk.
    Local { path: PathBuf },
    /// Files in a HuggingFace Hub model repo.
    Hub {
        repo: String,
        #[serde(default)]
        revision: Option<String>,
        /// Repo paths to fetch. Empty means the defaults for the model kind.
        #[serde(default)]
        files: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    T5Encoder,
    ClipTextEncoder,
    Tokenizer,
    Lora,
}

impl ModelKind {
    fn default_hub_files(self) -> &'static [&'static str] {
        match self {
            Self::T5Encoder | Self::ClipTextEncoder => &["config.json", "model.safetensors"],
            Self::Tokenizer => &["tokenizer.json"],
            Self::Lora => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub kind: ModelKind,
    pub source: ModelSource,
    /// Required for encoders.
    #[serde(default)]
    pub format: Option<EncoderFormat>,
}

/// `{"models": {"<key>": ModelRecord, ...}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelManifest {
    pub models: HashMap<String, ModelRecord>,
}

impl ModelManifest {
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn record(&self, key: &ModelKey) -> Result<&ModelRecord> {
        self.models
            .get(key.as_str())
            .ok_or_else(|| Error::ResourceAcquisition(format!("unknown model {key}")))
    }
}

// ── Disk loader ─────────────────────────────────────────────────────────────

/// [`ModelLoader`] over a [`ModelManifest`] of local and Hub models.
pub struct DiskModelLoader {
    manifest: ModelManifest,
    device: Device,
    dtype: DType,
    host_cache: Mutex<HashMap<ModelKey, Arc<BaselineWeights>>>,
    residency: ResidencyTracker,
}

impl DiskModelLoader {
    pub fn new(manifest: ModelManifest, device: Device, dtype: DType) -> Self {
        Self {
            manifest,
            device,
            dtype,
            host_cache: Mutex::new(HashMap::new()),
            residency: ResidencyTracker::default(),
        }
    }

    pub fn residency(&self) -> &ResidencyTracker {
        &self.residency
    }

    fn resolve(&self, key: &ModelKey, expected: ModelKind) -> Result<Vec<PathBuf>> {
        let record = self.manifest.record(key)?;
        if record.kind != expected {
            return Err(Error::Invariant(format!(
                "model {key} is a {:?}, expected a {expected:?}",
                record.kind
            )));
        }
        let files = match &record.source {
            ModelSource::Local { path } => local_files(path)?,
            ModelSource::Hub {
                repo,
                revision,
                files,
            } => {
                let wanted: Vec<&str> = if files.is_empty() {
                    record.kind.default_hub_files().to_vec()
                } else {
                    files.iter().map(String::as_str).collect()
                };
                fetch_hub_files(repo, revision.as_deref(), &wanted)?
            }
        };
        tracing::debug!(model = %key, files = files.len(), "model files resolved");
        Ok(files)
    }

    /// Host copy of a full-precision checkpoint, read once per key.
    fn host_weights(&self, key: &ModelKey, files: &[PathBuf]) -> Result<Arc<BaselineWeights>> {
        let mut cache = self.host_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(weights) = cache.get(key) {
            return Ok(weights.clone());
        }
        let mut weights = BaselineWeights::new();
        for path in files.iter().filter(|p| has_extension(p, "safetensors")) {
            weights.extend(candle_core::safetensors::load(path, &Device::Cpu)?);
        }
        if weights.is_empty() {
            return Err(Error::ResourceAcquisition(format!(
                "model {key} has no safetensors weights"
            )));
        }
        tracing::info!(model = %key, tensors = weights.len(), "weights cached in host memory");
        let weights = Arc::new(weights);
        cache.insert(key.clone(), weights.clone());
        Ok(weights)
    }

    /// Weight source on the target device, plus the baseline for patch restore.
    fn weight_source(
        &self,
        config: &EncoderConfig,
        files: &[PathBuf],
    ) -> Result<(WeightSource<'static>, Option<Arc<BaselineWeights>>)> {
        match config.format {
            EncoderFormat::GgufQuantized => {
                let path = files
                    .iter()
                    .find(|p| has_extension(p, "gguf"))
                    .ok_or_else(|| {
                        Error::ResourceAcquisition(format!("model {} has no .gguf file", config.key))
                    })?;
                let vb = QVarBuilder::from_gguf(path, &self.device)?;
                Ok((
                    WeightSource::Gguf {
                        vb,
                        dtype: config.dtype,
                    },
                    None,
                ))
            }
            EncoderFormat::Checkpoint => Err(Error::UnsupportedFormat {
                family: config.family,
                format: config.format,
            }),
            EncoderFormat::T5Encoder
            | EncoderFormat::Diffusers
            | EncoderFormat::BnbQuantizedLlmInt8b
            | EncoderFormat::BnbQuantizedNf4b => {
                let mut host = self.host_weights(&config.key, files)?;
                if config.family == EncoderFamily::T5 {
                    host = with_shared_embedding(host);
                }
                let vb = VarBuilder::from_tensors((*host).clone(), config.dtype, &self.device);
                let quantize = quantize_on_load(config.format);
                let baseline = quantize.is_none().then_some(host);
                Ok((WeightSource::Full { vb, quantize }, baseline))
            }
        }
    }

    fn acquire<M>(
        &self,
        config: &EncoderConfig,
        kind: ModelKind,
        build: impl FnOnce(&WeightSource<'static>, &[PathBuf]) -> Result<M>,
    ) -> Result<OnDevice<M>> {
        let files = self.resolve(&config.key, kind)?;
        let (source, baseline) = self.weight_source(config, &files)?;
        let model = build(&source, &files)
            .map_err(|e| Error::ResourceAcquisition(format!("model {}: {e}", config.key)))?;
        Ok(self.residency.on_device(&config.key, model, baseline))
    }
}

impl ModelLoader for DiskModelLoader {
    fn encoder_config(&self, key: &ModelKey) -> Result<EncoderConfig> {
        let record = self.manifest.record(key)?;
        let family = match record.kind {
            ModelKind::T5Encoder => EncoderFamily::T5,
            ModelKind::ClipTextEncoder => EncoderFamily::Clip,
            other => {
                return Err(Error::Invariant(format!(
                    "model {key} is a {other:?}, not a text encoder"
                )));
            }
        };
        let format = record
            .format
            .ok_or_else(|| Error::Config(format!("model {key} has no format in the manifest")))?;
        Ok(EncoderConfig {
            key: key.clone(),
            family,
            format,
            dtype: self.dtype,
        })
    }

    fn t5_on_device(&self, config: &EncoderConfig) -> Result<OnDevice<T5EncoderModel>> {
        self.acquire(config, ModelKind::T5Encoder, |source, files| {
            let cfg: T5Config = read_model_config(files)?;
            T5EncoderModel::load(source, &cfg)
        })
    }

    fn clip_on_device(&self, config: &EncoderConfig) -> Result<OnDevice<ClipTextModel>> {
        if config.format != EncoderFormat::Diffusers {
            return Err(Error::UnsupportedFormat {
                family: EncoderFamily::Clip,
                format: config.format,
            });
        }
        self.acquire(config, ModelKind::ClipTextEncoder, |source, files| {
            let cfg: ClipTextConfig = read_model_config(files)?;
            ClipTextModel::load(source, &cfg)
        })
    }

    fn load_tokenizer(&self, key: &ModelKey) -> Result<Tokenizer> {
        let files = self.resolve(key, ModelKind::Tokenizer)?;
        let path = files
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n == "tokenizer.json"))
            .or_else(|| files.iter().find(|p| has_extension(p, "json")))
            .ok_or_else(|| Error::ResourceAcquisition(format!("tokenizer {key} has no tokenizer.json")))?;
        Tokenizer::from_file(path)
            .map_err(|e| Error::ResourceAcquisition(format!("tokenizer {key}: {e}")))
    }

    fn load_patch(&self, key: &ModelKey) -> Result<Arc<ModelPatch>> {
        let files = self.resolve(key, ModelKind::Lora)?;
        let weights: Vec<&PathBuf> = files
            .iter()
            .filter(|p| has_extension(p, "safetensors"))
            .collect();
        if weights.is_empty() {
            return Err(Error::ResourceAcquisition(format!(
                "LoRA {key} has no safetensors file"
            )));
        }
        // Patches stay on the host; the patcher moves each delta next to its layer.
        let patch = lora::loader::load_patch(key.as_str(), &weights, &Device::Cpu)?;
        Ok(Arc::new(patch))
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|e| e == extension)
}

fn local_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Err(Error::ResourceAcquisition(format!(
            "{} does not exist",
            path.display()
        )));
    }
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = std::fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    files.retain(|p| p.is_file());
    files.sort();
    Ok(files)
}

fn fetch_hub_files(repo: &str, revision: Option<&str>, files: &[&str]) -> Result<Vec<PathBuf>> {
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        repo.to_string(),
        RepoType::Model,
        revision.unwrap_or("main").to_string(),
    ));
    files
        .iter()
        .map(|file| {
            tracing::info!(file, "fetching from hub");
            repo.get(file).map_err(Into::into)
        })
        .collect()
}

/// Parse `config.json` when present, defaults otherwise.
fn read_model_config<T: DeserializeOwned + Default>(files: &[PathBuf]) -> Result<T> {
    match files
        .iter()
        .find(|p| p.file_name().is_some_and(|n| n == "config.json"))
    {
        Some(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => {
            tracing::warn!("no config.json next to the weights, using default architecture");
            Ok(T::default())
        }
    }
}

/// Some T5 exports only carry the tied `encoder.embed_tokens.weight`.
fn with_shared_embedding(weights: Arc<BaselineWeights>) -> Arc<BaselineWeights> {
    if weights.contains_key("shared.weight") {
        return weights;
    }
    let Some(embed) = weights.get("encoder.embed_tokens.weight").cloned() else {
        return weights;
    };
    let mut aliased: HashMap<String, Tensor> = (*weights).clone();
    aliased.insert("shared.weight".to_string(), embed);
    Arc::new(aliased)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::PatchableModel;
    use crate::model::t5::tests::tiny_config;

    fn write_tiny_t5(dir: &Path) {
        let cfg = tiny_config();
        let dev = Device::Cpu;
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        let mut put = |name: String, shape: &[usize]| {
            tensors.insert(name, Tensor::randn(0f32, 0.02, shape, &dev).unwrap());
        };
        let inner = cfg.inner_dim();
        put("encoder.embed_tokens.weight".into(), &[cfg.vocab_size, cfg.d_model]);
        for i in 0..cfg.num_layers {
            let attn = format!("encoder.block.{i}.layer.0.SelfAttention");
            for name in ["q", "k", "v"] {
                put(format!("{attn}.{name}.weight"), &[inner, cfg.d_model]);
            }
            put(format!("{attn}.o.weight"), &[cfg.d_model, inner]);
            if i == 0 {
                put(
                    format!("{attn}.relative_attention_bias.weight"),
                    &[cfg.relative_attention_num_buckets, cfg.num_heads],
                );
            }
            put(format!("encoder.block.{i}.layer.0.layer_norm.weight"), &[cfg.d_model]);
            let ff = format!("encoder.block.{i}.layer.1.DenseReluDense");
            put(format!("{ff}.wi_0.weight"), &[cfg.d_ff, cfg.d_model]);
            put(format!("{ff}.wi_1.weight"), &[cfg.d_ff, cfg.d_model]);
            put(format!("{ff}.wo.weight"), &[cfg.d_model, cfg.d_ff]);
            put(format!("encoder.block.{i}.layer.1.layer_norm.weight"), &[cfg.d_model]);
        }
        put("encoder.final_layer_norm.weight".into(), &[cfg.d_model]);
        candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
        std::fs::write(
            dir.join("config.json"),
            serde_json::json!({
                "vocab_size": cfg.vocab_size,
                "d_model": cfg.d_model,
                "d_kv": cfg.d_kv,
                "d_ff": cfg.d_ff,
                "num_layers": cfg.num_layers,
                "num_heads": cfg.num_heads,
            })
            .to_string(),
        )
        .unwrap();
    }

    fn manifest(path: &Path, format: EncoderFormat) -> ModelManifest {
        let json = serde_json::json!({
            "models": {
                "t5": {
                    "kind": "t5_encoder",
                    "format": format,
                    "source": {"type": "local", "path": path},
                },
                "tok": {
                    "kind": "tokenizer",
                    "source": {"type": "hub", "repo": "black-forest-labs/FLUX.1-schnell"},
                },
            }
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_manifest_parsing() {
        let m = manifest(Path::new("/models/t5"), EncoderFormat::T5Encoder);
        let record = m.record(&ModelKey::from("t5")).unwrap();
        assert_eq!(record.kind, ModelKind::T5Encoder);
        assert_eq!(record.format, Some(EncoderFormat::T5Encoder));
        let tok = m.record(&ModelKey::from("tok")).unwrap();
        assert!(matches!(&tok.source, ModelSource::Hub { files, .. } if files.is_empty()));
        assert!(matches!(
            m.record(&ModelKey::from("missing")),
            Err(Error::ResourceAcquisition(_))
        ));
    }

    #[test]
    fn test_encoder_config_needs_no_files() {
        let loader = DiskModelLoader::new(
            manifest(Path::new("/does/not/exist"), EncoderFormat::BnbQuantizedNf4b),
            Device::Cpu,
            DType::F32,
        );
        let config = loader.encoder_config(&ModelKey::from("t5")).unwrap();
        assert_eq!(config.family, EncoderFamily::T5);
        assert_eq!(config.format, EncoderFormat::BnbQuantizedNf4b);
        assert!(matches!(
            loader.encoder_config(&ModelKey::from("tok")),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_load_local_t5_tracks_residency() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_t5(dir.path());
        let loader = DiskModelLoader::new(
            manifest(dir.path(), EncoderFormat::T5Encoder),
            Device::Cpu,
            DType::F32,
        );
        let config = loader.encoder_config(&ModelKey::from("t5")).unwrap();

        {
            let mut encoder = loader.t5_on_device(&config).unwrap();
            assert_eq!(loader.residency().resident(), vec![ModelKey::from("t5")]);
            let (baseline, model) = encoder.parts_mut();
            let baseline = baseline.unwrap();
            assert!(baseline.contains_key("encoder.block.0.layer.0.SelfAttention.q.weight"));
            assert!(baseline.contains_key("shared.weight"));
            assert!(model.linear_mut("encoder.block.1.layer.0.SelfAttention.q").is_some());

            let ids = Tensor::zeros((1, 8), DType::U32, &Device::Cpu).unwrap();
            let out = encoder.model().forward(&ids).unwrap();
            assert_eq!(out.dims(), &[1, 8, 64]);
        }
        assert!(loader.residency().resident().is_empty());
    }

    #[test]
    fn test_bnb_format_quantizes_without_baseline() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_t5(dir.path());
        let loader = DiskModelLoader::new(
            manifest(dir.path(), EncoderFormat::BnbQuantizedLlmInt8b),
            Device::Cpu,
            DType::F32,
        );
        let config = loader.encoder_config(&ModelKey::from("t5")).unwrap();
        let mut encoder = loader.t5_on_device(&config).unwrap();
        let (baseline, model) = encoder.parts_mut();
        assert!(baseline.is_none());
        let q = model.linear_mut("encoder.block.0.layer.0.SelfAttention.q").unwrap();
        assert_eq!(q.qtensor().unwrap().dtype(), GgmlDType::Q8_0);
    }

    #[test]
    fn test_missing_local_path_is_resource_error() {
        let loader = DiskModelLoader::new(
            manifest(Path::new("/does/not/exist"), EncoderFormat::T5Encoder),
            Device::Cpu,
            DType::F32,
        );
        let config = loader.encoder_config(&ModelKey::from("t5")).unwrap();
        assert!(matches!(
            loader.t5_on_device(&config),
            Err(Error::ResourceAcquisition(_))
        ));
        assert!(loader.residency().resident().is_empty());
    }

    #[test]
    fn test_quantize_on_load_table() {
        assert_eq!(
            quantize_on_load(EncoderFormat::BnbQuantizedLlmInt8b),
            Some(GgmlDType::Q8_0)
        );
        assert_eq!(
            quantize_on_load(EncoderFormat::BnbQuantizedNf4b),
            Some(GgmlDType::Q4_0)
        );
        assert_eq!(quantize_on_load(EncoderFormat::Diffusers), None);
        assert_eq!(quantize_on_load(EncoderFormat::GgufQuantized), None);
    }
}
