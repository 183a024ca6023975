//! Scoped application of LoRA patches to a model.
//!
//! ```text
//! apply_smart_model_patches(model, patches, prefix, ..)
//!        │
//!        ├─ per matching layer:
//!        │     quantized or force_sidecar ──→ attach sidecar
//!        │     otherwise                 ──→ fuse into weight, remember original
//!        ↓
//!   PatchScope  (derefs to the patched model)
//!        │
//!        └─ Drop: put back original weights, drop added sidecars
//! ```
//!
//! The scope restores the model whether it ends normally, through `?`, or by
//! unwinding. Each patch is only held while it is being applied.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use candle_core::{DType, Tensor};

use super::types::{LoraLayer, ModelPatch};
use crate::model::linear::{PatchableLinear, Sidecar};
use crate::{Error, Result};

/// Unpatched weights keyed `"{module_path}.weight"`, usually a host-memory
/// copy kept by the model cache.
pub type BaselineWeights = HashMap<String, Tensor>;

/// A model whose linear layers can be addressed by module path.
pub trait PatchableModel {
    /// `None` when the path names no linear layer of this model.
    fn linear_mut(&mut self, module_path: &str) -> Option<&mut PatchableLinear>;

    /// Compute dtype of the model's dense weights.
    fn dtype(&self) -> DType;
}

/// What a scope did to its model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub patches: usize,
    pub fused: usize,
    pub sidecars: usize,
    pub skipped: usize,
}

pub struct LayerPatcher;

impl LayerPatcher {
    /// Apply `patches` to the layers of `model` whose patch key starts with `prefix`.
    ///
    /// Layers are fused in place unless `force_sidecar` is set or the layer's
    /// weights are quantized, in which case the delta rides along as a sidecar.
    /// `baseline`, when given, is preferred over the live weight as the restore
    /// source. Patch keys with no matching layer are skipped.
    ///
    /// On error every change made so far is reverted before returning.
    pub fn apply_smart_model_patches<'m, M, I>(
        model: &'m mut M,
        patches: I,
        prefix: &str,
        dtype: DType,
        baseline: Option<&BaselineWeights>,
        force_sidecar: bool,
    ) -> Result<PatchScope<'m, M>>
    where
        M: PatchableModel,
        I: IntoIterator<Item = Result<(Arc<ModelPatch>, f64)>>,
    {
        let mut scope = PatchScope {
            model,
            originals: Vec::new(),
            sidecar_marks: Vec::new(),
            stats: PatchStats::default(),
        };
        for item in patches {
            let (patch, weight) = item?;
            scope.apply(&patch, weight, prefix, dtype, baseline, force_sidecar)?;
        }
        tracing::debug!(
            prefix,
            patches = scope.stats.patches,
            fused = scope.stats.fused,
            sidecars = scope.stats.sidecars,
            skipped = scope.stats.skipped,
            "LoRA patches applied"
        );
        Ok(scope)
    }
}

/// A model with patches applied. Dropping it restores the model.
pub struct PatchScope<'m, M: PatchableModel> {
    model: &'m mut M,
    /// First-touch weights of fused layers.
    originals: Vec<(String, Tensor)>,
    /// Sidecar count of each touched layer before this scope.
    sidecar_marks: Vec<(String, usize)>,
    stats: PatchStats,
}

impl<M: PatchableModel> PatchScope<'_, M> {
    pub fn stats(&self) -> PatchStats {
        self.stats
    }

    fn apply(
        &mut self,
        patch: &ModelPatch,
        weight: f64,
        prefix: &str,
        dtype: DType,
        baseline: Option<&BaselineWeights>,
        force_sidecar: bool,
    ) -> Result<()> {
        self.stats.patches += 1;
        for (module_path, layer) in patch.layers_with_prefix(prefix) {
            let Some(linear) = self.model.linear_mut(module_path) else {
                tracing::debug!(patch = patch.name(), module_path, "no such layer, skipping");
                self.stats.skipped += 1;
                continue;
            };
            let scale = layer.scale() * weight;

            if force_sidecar || linear.is_quantized() {
                if !self.sidecar_marks.iter().any(|(path, _)| path == module_path) {
                    self.sidecar_marks
                        .push((module_path.to_string(), linear.num_sidecars()));
                }
                let sidecar = sidecar(linear, layer, scale, dtype)?;
                linear.push_sidecar(sidecar);
                self.stats.sidecars += 1;
                continue;
            }

            let first_touch = !self.originals.iter().any(|(path, _)| path == module_path);
            let restore_from = match baseline.filter(|_| first_touch) {
                Some(weights) => match (weights.get(&format!("{module_path}.weight")), linear.dense_weight()) {
                    (Some(saved), Some(live)) => {
                        Some(saved.to_device(live.device())?.to_dtype(live.dtype())?)
                    }
                    _ => None,
                },
                None => None,
            };
            let device = linear.device();
            let down = layer.down.to_device(&device)?;
            let up = layer.up.to_device(&device)?;
            let live = linear.fuse_lora(&down, &up, scale)?;
            if first_touch {
                self.originals
                    .push((module_path.to_string(), restore_from.unwrap_or(live)));
            }
            self.stats.fused += 1;
        }
        Ok(())
    }

    fn restore(&mut self) {
        for (path, weight) in self.originals.drain(..).rev() {
            if let Some(linear) = self.model.linear_mut(&path) {
                linear.restore_weight(weight);
            }
        }
        for (path, len) in self.sidecar_marks.drain(..).rev() {
            if let Some(linear) = self.model.linear_mut(&path) {
                linear.truncate_sidecars(len);
            }
        }
    }
}

fn sidecar(linear: &PatchableLinear, layer: &LoraLayer, scale: f64, dtype: DType) -> Result<Sidecar> {
    let (out_features, in_features) = linear.shape()?;
    if (layer.out_features(), layer.in_features()) != (out_features, in_features) {
        return Err(Error::Invariant(format!(
            "LoRA delta shape [{}, {}] does not match layer shape [{out_features}, {in_features}]",
            layer.out_features(),
            layer.in_features()
        )));
    }
    let device = linear.device();
    // Quantized layers compute in the activation dtype, which is the model dtype.
    Ok(Sidecar {
        down: layer.down.to_device(&device)?.to_dtype(dtype)?,
        up: layer.up.to_device(&device)?.to_dtype(dtype)?,
        scale,
    })
}

impl<M: PatchableModel> Deref for PatchScope<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: PatchableModel> DerefMut for PatchScope<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: PatchableModel> Drop for PatchScope<'_, M> {
    fn drop(&mut self) {
        if !self.originals.is_empty() || !self.sidecar_marks.is_empty() {
            tracing::debug!(
                fused = self.originals.len(),
                sidecar_layers = self.sidecar_marks.len(),
                "restoring patched layers"
            );
        }
        self.restore();
    }
}
