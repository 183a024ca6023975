//! Encode manager: a single worker that runs invocations off the async runtime.
//!
//! Callers submit [`FluxTextEncoderInvocation`]s which are processed one at a
//! time on a blocking thread, so only one invocation's encoders are ever
//! resident at once.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use candle_core::{DType, Device};
//! use flux_text_encoder_rs::conditioning::InMemoryConditioningStore;
//! use flux_text_encoder_rs::config::RuntimeConfig;
//! use flux_text_encoder_rs::context::InvocationContext;
//! use flux_text_encoder_rs::loader::{DiskModelLoader, ModelManifest};
//! use flux_text_encoder_rs::manager::{EncodeManager, ManagerConfig};
//! # use flux_text_encoder_rs::pipeline::FluxTextEncoderInvocation;
//! # fn invocation() -> FluxTextEncoderInvocation { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() {
//!     let manifest = ModelManifest::load_from("models.json".as_ref()).unwrap();
//!     let loader = DiskModelLoader::new(manifest, Device::Cpu, DType::F32);
//!     let ctx = InvocationContext::new(
//!         Arc::new(loader),
//!         Arc::new(InMemoryConditioningStore::new()),
//!         RuntimeConfig::from_env(),
//!     );
//!     let manager = EncodeManager::start(ctx, ManagerConfig::default()).await;
//!     let output = manager.encode(invocation()).await.unwrap();
//!     println!("{}", output.conditioning.conditioning_name);
//! }
//! ```

use tokio::sync::{mpsc, oneshot};

use crate::context::InvocationContext;
use crate::pipeline::{FluxConditioningOutput, FluxTextEncoderInvocation};
use crate::{Error, Result};

/// Configuration for the encode manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pending invocations accepted before `encode` starts waiting.
    pub queue_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

/// A submitted invocation.
struct PendingRequest {
    invocation: FluxTextEncoderInvocation,
    reply: oneshot::Sender<Result<FluxConditioningOutput>>,
}

/// Handle for submitting invocations to a running manager.
#[derive(Clone)]
pub struct EncodeManager {
    tx: mpsc::Sender<PendingRequest>,
}

impl EncodeManager {
    /// Start the worker and return a handle for submitting invocations.
    pub async fn start(context: InvocationContext, config: ManagerConfig) -> Self {
        let (tx, rx) = mpsc::channel::<PendingRequest>(config.queue_depth.max(1));
        tokio::task::spawn_blocking(move || run_manager(context, rx));
        Self { tx }
    }

    /// Submit an invocation and wait for its conditioning.
    pub async fn encode(&self, invocation: FluxTextEncoderInvocation) -> Result<FluxConditioningOutput> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<FluxConditioningOutput>>();
        self.tx
            .send(PendingRequest {
                invocation,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }
}

/// The manager loop, run on a dedicated blocking thread.
fn run_manager(context: InvocationContext, mut rx: mpsc::Receiver<PendingRequest>) {
    while let Some(request) = rx.blocking_recv() {
        let result = request.invocation.invoke(&context);
        if let Err(error) = &result {
            if is_oom_error(error) {
                tracing::warn!(%error, "device out of memory while encoding");
            } else {
                tracing::warn!(%error, "invocation failed");
            }
        }
        // Ignore send errors, the caller may have gone away.
        let _ = request.reply.send(result);
    }
    tracing::info!("encode manager shut down");
}

/// Return true if the error looks like a CUDA out-of-memory condition.
///
/// Candle surfaces CUDA errors as strings, so this matches on the message.
pub fn is_oom_error(error: &Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("out of memory")
        || msg.contains("cudaerrormemorya") // cudaErrorMemoryAllocation
        || msg.contains("cuda_error_out_of_memory")
        || msg.contains("cublas_status_alloc_failed")
        || msg.contains("alloc failed")
}
