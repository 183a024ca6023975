//! Services an invocation runs against.

use std::sync::Arc;

use crate::conditioning::ConditioningStore;
use crate::config::RuntimeConfig;
use crate::loader::ModelLoader;

/// Fire-and-forget stage notifications.
///
/// Implementations must not block and cannot fail the invocation.
pub trait ProgressSink: Send + Sync {
    fn signal_progress(&self, message: &str);
}

/// Reports progress as `info` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn signal_progress(&self, message: &str) {
        tracing::info!("{message}");
    }
}

/// Everything an invocation needs from its host.
#[derive(Clone)]
pub struct InvocationContext {
    pub models: Arc<dyn ModelLoader>,
    pub conditioning: Arc<dyn ConditioningStore>,
    pub progress: Arc<dyn ProgressSink>,
    pub config: RuntimeConfig,
}

impl InvocationContext {
    pub fn new(
        models: Arc<dyn ModelLoader>,
        conditioning: Arc<dyn ConditioningStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            models,
            conditioning,
            progress: Arc::new(TracingProgress),
            config,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }
}
