//! Frozen genre subsystem: an independently trained encoder/denoiser/process
//! over the genre vocabulary whose one-step denoised output conditions the
//! primary item model.
//!
//! Parameters are loaded once, pre-training, and never optimized; the
//! conditioning tensor is detached so no gradient can flow back into them.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use diffrec_core::{DiffRecError, DiffRecResult, DiffusionProcess, ModelConfig};

use crate::model::RecModel;

/// A read-only {encoder, denoiser, diffusion process} triple over the genre
/// vocabulary.
#[derive(Debug)]
pub struct GenreSubsystem {
    model: RecModel,
    process: DiffusionProcess,
}

impl GenreSubsystem {
    /// Load the two checkpoint artifacts (weights + diffusion snapshot).
    ///
    /// A weight file whose tensor shapes disagree with `config` (wrong
    /// embedding size, wrong vocabulary) is fatal here, before training
    /// starts.
    pub fn load(
        config: &ModelConfig,
        weights_path: impl AsRef<std::path::Path>,
        snapshot_path: impl AsRef<std::path::Path>,
        device: &Device,
    ) -> DiffRecResult<Self> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = RecModel::new(config, false, vb)?;
        varmap.load(weights_path.as_ref()).map_err(|e| {
            DiffRecError::checkpoint(format!(
                "genre weights at {} are incompatible with the configured dimensions: {e}",
                weights_path.as_ref().display()
            ))
        })?;
        let process = DiffusionProcess::load(snapshot_path.as_ref(), device)?;
        tracing::info!(
            weights = %weights_path.as_ref().display(),
            snapshot = %snapshot_path.as_ref().display(),
            "loaded frozen genre subsystem"
        );
        Ok(Self { model, process })
    }

    /// Wrap an already constructed model/process pair (used by tests and by
    /// pre-training of the genre model itself).
    pub fn from_parts(model: RecModel, process: DiffusionProcess) -> Self {
        Self { model, process }
    }

    pub fn model(&self) -> &RecModel {
        &self.model
    }

    pub fn process(&self) -> &DiffusionProcess {
        &self.process
    }

    /// Produce the secondary conditioning tensor for one batch.
    ///
    /// Runs the genre encoder, then exactly one `p_losses` pass (one
    /// q_sample plus one conditional denoise) with the supplied per-example
    /// timesteps. Recomputed per batch, never cached. The result is detached:
    /// the frozen parameters must not receive gradient flow.
    pub fn condition(
        &self,
        genre_states: &Tensor,
        genre_lengths: &[usize],
        genre_targets: &Tensor,
        conditioning_dropout: f32,
        t: &Tensor,
    ) -> DiffRecResult<Tensor> {
        let h = self
            .model
            .encoder()
            .encode(genre_states, genre_lengths, conditioning_dropout, false)?;
        let x_start = self.model.encoder().embed_items(genre_targets)?;
        let (_, predicted) = self
            .process
            .p_losses(&self.model, &x_start, &h, t, None, None)?;
        Ok(predicted.detach())
    }
}
