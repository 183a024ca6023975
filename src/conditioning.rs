//! Conditioning records and where they are kept.
//!
//! A record is written once per invocation and referred to by name afterwards.
//! Names are `flux_cond_<uuid>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use candle_core::{Device, Tensor};
use uuid::Uuid;

use crate::{Error, Result};

/// Both embeddings for one prompt.
#[derive(Debug, Clone)]
pub struct FluxConditioningInfo {
    /// Pooled CLIP embedding, `[1, H']`.
    pub clip_embeds: Tensor,
    /// T5 hidden states, `[1, max_seq_len, H]`.
    pub t5_embeds: Tensor,
}

impl FluxConditioningInfo {
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            clip_embeds: self.clip_embeds.to_device(device)?,
            t5_embeds: self.t5_embeds.to_device(device)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConditioningFieldData {
    pub conditionings: Vec<FluxConditioningInfo>,
}

/// Persists conditioning records and hands back their names.
pub trait ConditioningStore: Send + Sync {
    fn save(&self, data: ConditioningFieldData) -> Result<String>;
}

pub fn new_conditioning_name() -> String {
    format!("flux_cond_{}", Uuid::new_v4().simple())
}

/// Records kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryConditioningStore {
    records: Mutex<HashMap<String, ConditioningFieldData>>,
}

impl InMemoryConditioningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<ConditioningFieldData> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConditioningStore for InMemoryConditioningStore {
    fn save(&self, data: ConditioningFieldData) -> Result<String> {
        let name = new_conditioning_name();
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), data);
        Ok(name)
    }
}

/// One `<name>.safetensors` file per record, tensors moved to the host.
///
/// Keys are `t5_embeds.<i>` and `clip_embeds.<i>` for the i-th conditioning.
#[derive(Debug, Clone)]
pub struct SafetensorsConditioningStore {
    dir: PathBuf,
}

impl SafetensorsConditioningStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.safetensors"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, name: &str, device: &Device) -> Result<ConditioningFieldData> {
        let path = self.path_for(name);
        let mut tensors = candle_core::safetensors::load(&path, device)?;
        let mut conditionings = Vec::new();
        for i in 0.. {
            let (Some(t5_embeds), Some(clip_embeds)) = (
                tensors.remove(&format!("t5_embeds.{i}")),
                tensors.remove(&format!("clip_embeds.{i}")),
            ) else {
                break;
            };
            conditionings.push(FluxConditioningInfo {
                clip_embeds,
                t5_embeds,
            });
        }
        if conditionings.is_empty() {
            return Err(Error::Invariant(format!(
                "{} holds no conditioning",
                path.display()
            )));
        }
        Ok(ConditioningFieldData { conditionings })
    }
}

impl ConditioningStore for SafetensorsConditioningStore {
    fn save(&self, data: ConditioningFieldData) -> Result<String> {
        let name = new_conditioning_name();
        let mut tensors = HashMap::new();
        for (i, info) in data.conditionings.iter().enumerate() {
            let host = info.to_device(&Device::Cpu)?;
            tensors.insert(format!("t5_embeds.{i}"), host.t5_embeds);
            tensors.insert(format!("clip_embeds.{i}"), host.clip_embeds);
        }
        let path = self.path_for(&name);
        candle_core::safetensors::save(&tensors, &path)?;
        tracing::debug!(path = %path.display(), "conditioning saved");
        Ok(name)
    }
}
