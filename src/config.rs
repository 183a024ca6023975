//! Runtime configuration and the format → patch-strategy tables.
//!
//! The tables are exhaustive matches over [`EncoderFamily`] × [`EncoderFormat`]:
//! adding a storage format does not compile until every family says how (or
//! whether) it can be patched.

use std::fmt;
use std::path::Path;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable that force-enables tokenization logging.
pub const LOG_TOKENIZATION_ENV: &str = "FLUX_ENCODE_LOG_TOKENIZATION";

/// Text encoder family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderFamily {
    /// T5 v1.1 encoder: full per-token hidden states.
    T5,
    /// CLIP text transformer: pooled embedding.
    Clip,
}

impl fmt::Display for EncoderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::T5 => write!(f, "t5"),
            Self::Clip => write!(f, "clip"),
        }
    }
}

/// Storage format of a text encoder's weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderFormat {
    /// Standalone T5 encoder safetensors, full precision.
    T5Encoder,
    /// Diffusers-layout safetensors, full precision.
    Diffusers,
    /// bitsandbytes LLM.int8 (8-bit).
    BnbQuantizedLlmInt8b,
    /// bitsandbytes NF4 (4-bit).
    BnbQuantizedNf4b,
    /// GGUF block-wise quantized.
    GgufQuantized,
    /// Single-file checkpoint. Recognized but not loadable as a text encoder.
    Checkpoint,
}

impl EncoderFormat {
    /// True when weights are stored in a packed/quantized representation.
    pub fn is_quantized(self) -> bool {
        match self {
            Self::T5Encoder | Self::Diffusers | Self::Checkpoint => false,
            Self::BnbQuantizedLlmInt8b | Self::BnbQuantizedNf4b | Self::GgufQuantized => true,
        }
    }
}

impl fmt::Display for EncoderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::T5Encoder => "t5_encoder",
            Self::Diffusers => "diffusers",
            Self::BnbQuantizedLlmInt8b => "bnb_quantized_llm_int8b",
            Self::BnbQuantizedNf4b => "bnb_quantized_nf4b",
            Self::GgufQuantized => "gguf_quantized",
            Self::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// How LoRA patches are applied to an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// Fuse the low-rank delta into the base weights in place.
    DirectFusion,
    /// Leave base weights untouched and add `scale * up(down(x))` at forward time.
    Sidecar,
}

impl PatchStrategy {
    /// Value for the patch engine's `force_sidecar` flag.
    pub fn force_sidecar(self) -> bool {
        matches!(self, Self::Sidecar)
    }
}

impl EncoderFamily {
    /// Resolve the patch strategy for `format`, or fail with
    /// [`Error::UnsupportedFormat`].
    pub fn patch_strategy(self, format: EncoderFormat) -> Result<PatchStrategy> {
        use EncoderFormat::*;

        let strategy = match (self, format) {
            (Self::T5, T5Encoder | Diffusers) => Some(PatchStrategy::DirectFusion),
            (Self::T5, BnbQuantizedLlmInt8b | BnbQuantizedNf4b | GgufQuantized) => {
                Some(PatchStrategy::Sidecar)
            }
            (Self::T5, Checkpoint) => None,
            (Self::Clip, Diffusers) => Some(PatchStrategy::DirectFusion),
            // No quantized CLIP encoders are supported, so there is no sidecar row here.
            (
                Self::Clip,
                T5Encoder | BnbQuantizedLlmInt8b | BnbQuantizedNf4b | GgufQuantized | Checkpoint,
            ) => None,
        };

        strategy.ok_or(Error::UnsupportedFormat {
            family: self,
            format,
        })
    }
}

/// Maximum T5 sequence length.
///
/// 256 for FLUX schnell, 512 for FLUX dev.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub enum T5MaxSeqLen {
    Schnell256,
    Dev512,
}

impl T5MaxSeqLen {
    pub fn tokens(self) -> usize {
        match self {
            Self::Schnell256 => 256,
            Self::Dev512 => 512,
        }
    }
}

impl TryFrom<usize> for T5MaxSeqLen {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            256 => Ok(Self::Schnell256),
            512 => Ok(Self::Dev512),
            other => Err(Error::Config(format!(
                "t5 max sequence length must be 256 or 512, got {other}"
            ))),
        }
    }
}

impl From<T5MaxSeqLen> for usize {
    fn from(value: T5MaxSeqLen) -> Self {
        value.tokens()
    }
}

/// Where to place encoder weights while they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// CUDA device 0 when available, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    Cuda { ordinal: usize },
}

impl DevicePreference {
    pub fn device(self) -> Result<Device> {
        match self {
            Self::Auto => Ok(Device::cuda_if_available(0).unwrap_or(Device::Cpu)),
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda { ordinal } => Ok(Device::new_cuda(ordinal)?),
        }
    }
}

/// Compute dtype for full-precision encoder weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightDtype {
    #[default]
    F32,
    F16,
    Bf16,
}

impl From<WeightDtype> for DType {
    fn from(value: WeightDtype) -> Self {
        match value {
            WeightDtype::F32 => DType::F32,
            WeightDtype::F16 => DType::F16,
            WeightDtype::Bf16 => DType::BF16,
        }
    }
}

/// Process-wide settings read by the encoder pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Log a colorized breakdown of how each encoder tokenized the prompt.
    pub log_tokenization: bool,
    pub device: DevicePreference,
    pub dtype: WeightDtype,
}

impl RuntimeConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config.with_env_overrides())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(LOG_TOKENIZATION_ENV) {
            self.log_tokenization = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_FORMATS: [EncoderFormat; 6] = [
        EncoderFormat::T5Encoder,
        EncoderFormat::Diffusers,
        EncoderFormat::BnbQuantizedLlmInt8b,
        EncoderFormat::BnbQuantizedNf4b,
        EncoderFormat::GgufQuantized,
        EncoderFormat::Checkpoint,
    ];

    #[test]
    fn test_t5_strategy_table() {
        let t5 = EncoderFamily::T5;
        assert_eq!(
            t5.patch_strategy(EncoderFormat::T5Encoder).unwrap(),
            PatchStrategy::DirectFusion
        );
        assert_eq!(
            t5.patch_strategy(EncoderFormat::Diffusers).unwrap(),
            PatchStrategy::DirectFusion
        );
        for format in ALL_FORMATS.iter().filter(|f| f.is_quantized()) {
            assert_eq!(t5.patch_strategy(*format).unwrap(), PatchStrategy::Sidecar);
        }
        assert!(t5.patch_strategy(EncoderFormat::Checkpoint).is_err());
    }

    #[test]
    fn test_clip_only_supports_diffusers() {
        for format in ALL_FORMATS {
            let result = EncoderFamily::Clip.patch_strategy(format);
            if format == EncoderFormat::Diffusers {
                assert_eq!(result.unwrap(), PatchStrategy::DirectFusion);
            } else {
                assert!(matches!(
                    result,
                    Err(Error::UnsupportedFormat {
                        family: EncoderFamily::Clip,
                        ..
                    })
                ));
            }
        }
    }

    #[test]
    fn test_quantized_formats_force_sidecar() {
        assert!(PatchStrategy::Sidecar.force_sidecar());
        assert!(!PatchStrategy::DirectFusion.force_sidecar());
    }

    #[test]
    fn test_t5_max_seq_len() {
        assert_eq!(T5MaxSeqLen::try_from(256).unwrap(), T5MaxSeqLen::Schnell256);
        assert_eq!(T5MaxSeqLen::try_from(512).unwrap().tokens(), 512);
        assert!(T5MaxSeqLen::try_from(77).is_err());

        let parsed: T5MaxSeqLen = serde_json::from_str("512").unwrap();
        assert_eq!(parsed, T5MaxSeqLen::Dev512);
        assert!(serde_json::from_str::<T5MaxSeqLen>("300").is_err());
    }

    #[test]
    fn test_format_serde_names_match_display() {
        for format in ALL_FORMATS {
            let json = serde_json::to_string(&format).unwrap();
            assert_eq!(json, format!("\"{format}\""));
        }
    }

    #[test]
    fn test_runtime_config_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, r#"{"device": "cpu", "dtype": "bf16"}"#).unwrap();

        let config = RuntimeConfig::load_from(&path).unwrap();
        assert_eq!(config.device, DevicePreference::Cpu);
        assert_eq!(DType::from(config.dtype), DType::BF16);
    }
}
