//! FLUX prompt encoder CLI.
//!
//! Encodes a prompt with the T5 and CLIP text encoders named in a model
//! manifest, applies any LoRAs, and writes the conditioning to
//! `<out-dir>/<conditioning_name>.safetensors`.
//!
//! # Output
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"conditioning":{"conditioning_name":"flux_cond_…","mask":null},"path":"/tmp/conditioning/flux_cond_….safetensors"}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use flux_text_encoder_rs::{
    conditioning::SafetensorsConditioningStore,
    config::{DevicePreference, RuntimeConfig, T5MaxSeqLen},
    context::InvocationContext,
    loader::{DiskModelLoader, ModelKey, ModelManifest},
    pipeline::{ClipField, FluxTextEncoderInvocation, LoraField, T5EncoderField},
};

#[derive(Parser, Debug)]
#[command(
    name = "flux-text-encode",
    about = "Encode a prompt into FLUX conditioning (T5 + CLIP)",
    long_about = "Encode a prompt with the T5 and CLIP text encoders from a model manifest.\n\
                  The conditioning is written to --out-dir; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Model manifest (JSON) naming encoders, tokenizers and LoRAs.
    #[arg(long, short = 'm')]
    manifest: PathBuf,

    /// Text prompt to encode.
    #[arg(long, short = 'p', conflicts_with = "invocation")]
    prompt: Option<String>,

    /// Full invocation as JSON. Replaces the prompt/model flags.
    #[arg(long)]
    invocation: Option<PathBuf>,

    /// Manifest key of the T5 encoder.
    #[arg(long, default_value = "t5_encoder")]
    t5: String,

    #[arg(long, default_value = "t5_tokenizer")]
    t5_tokenizer: String,

    /// Manifest key of the CLIP text encoder.
    #[arg(long, default_value = "clip_encoder")]
    clip: String,

    #[arg(long, default_value = "clip_tokenizer")]
    clip_tokenizer: String,

    /// LoRA for the T5 encoder as KEY=WEIGHT. Repeatable.
    #[arg(long = "t5-lora", value_parser = parse_lora)]
    t5_loras: Vec<LoraField>,

    /// LoRA for the CLIP encoder as KEY=WEIGHT. Repeatable.
    #[arg(long = "clip-lora", value_parser = parse_lora)]
    clip_loras: Vec<LoraField>,

    /// T5 sequence length: 256 (schnell) or 512 (dev).
    #[arg(long, default_value_t = 512)]
    max_seq_len: usize,

    /// Directory for conditioning files.
    #[arg(long, short = 'o', default_value = "conditioning")]
    out_dir: PathBuf,

    /// Runtime config (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force CPU even when CUDA is available.
    #[arg(long, default_value_t = false)]
    cpu: bool,

    /// Log how each encoder tokenized the prompt.
    #[arg(long, default_value_t = false)]
    log_tokenization: bool,
}

fn parse_lora(value: &str) -> Result<LoraField, String> {
    let (key, weight) = value
        .rsplit_once('=')
        .ok_or_else(|| format!("expected KEY=WEIGHT, got '{value}'"))?;
    let weight = weight
        .parse::<f64>()
        .map_err(|e| format!("invalid LoRA weight '{weight}': {e}"))?;
    Ok(LoraField {
        lora: ModelKey::new(key),
        weight,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load_from(path)?,
        None => RuntimeConfig::from_env(),
    };
    if args.log_tokenization {
        config.log_tokenization = true;
    }
    if args.cpu {
        config.device = DevicePreference::Cpu;
    }

    let invocation = match &args.invocation {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<FluxTextEncoderInvocation>(&raw)?
        }
        None => {
            let Some(prompt) = args.prompt.clone() else {
                anyhow::bail!("either --prompt or --invocation is required");
            };
            FluxTextEncoderInvocation {
                prompt,
                clip: ClipField {
                    text_encoder: ModelKey::new(&args.clip),
                    tokenizer: ModelKey::new(&args.clip_tokenizer),
                    loras: args.clip_loras.clone(),
                },
                t5_encoder: T5EncoderField {
                    text_encoder: ModelKey::new(&args.t5),
                    tokenizer: ModelKey::new(&args.t5_tokenizer),
                    loras: args.t5_loras.clone(),
                },
                t5_max_seq_len: T5MaxSeqLen::try_from(args.max_seq_len)?,
                mask: None,
            }
        }
    };

    let device = config.device.device()?;
    tracing::info!("Using device: {:?}", device);

    let manifest = ModelManifest::load_from(&args.manifest)?;
    let loader = DiskModelLoader::new(manifest, device, config.dtype.into());
    let store = SafetensorsConditioningStore::new(&args.out_dir)?;
    let ctx = InvocationContext::new(Arc::new(loader), Arc::new(store.clone()), config);

    let output = invocation
        .invoke(&ctx)
        .map_err(|e| anyhow::anyhow!("encoding failed: {e}"))?;

    // Print machine-readable summary to stdout for the caller
    let path = store.path_for(&output.conditioning.conditioning_name);
    println!(
        "{}",
        serde_json::json!({
            "conditioning": output.conditioning,
            "path": path,
        })
    );

    Ok(())
}
