//! Per-batch training step: joint diffusion + classification loss, with the
//! frozen genre subsystem supplying secondary conditioning.
//!
//! Epoch iteration and batch sourcing belong to the caller; this module owns
//! exactly one optimizer step per call, and the matching evaluation pass for
//! one batch.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::{rngs::StdRng, Rng, SeedableRng};

use diffrec_core::{
    DiffRecResult, DiffusionConfig, DiffusionProcess, ModelConfig, TrainingConfig,
};

use crate::checkpoint::{self, CheckpointPaths};
use crate::data::InteractionBatch;
use crate::eval::RankingMetrics;
use crate::genre::GenreSubsystem;
use crate::model::RecModel;
use crate::scorer::top_k_batch;

/// Owns the primary model, its optimizer state, and the frozen genre
/// subsystem. The genre parameters live in their own `VarMap` and are never
/// handed to the optimizer.
pub struct Trainer {
    varmap: VarMap,
    model: RecModel,
    process: DiffusionProcess,
    genre: GenreSubsystem,
    optimizer: AdamW,
    config: TrainingConfig,
    conditioning_dropout: f32,
    timesteps: usize,
    rng: StdRng,
    device: Device,
}

impl Trainer {
    /// Build a fresh primary model and seed both RNG streams (device and
    /// host) from the explicit config seed.
    pub fn new(
        model_config: &ModelConfig,
        diffusion_config: DiffusionConfig,
        training: TrainingConfig,
        genre: GenreSubsystem,
        device: &Device,
    ) -> DiffRecResult<Self> {
        device.set_seed(training.seed)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = RecModel::new(model_config, true, vb)?;
        let process = DiffusionProcess::new(diffusion_config, device)?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: training.learning_rate,
                weight_decay: training.weight_decay,
                ..Default::default()
            },
        )?;
        let timesteps = process.timesteps();
        Ok(Self {
            varmap,
            model,
            process,
            genre,
            optimizer,
            rng: StdRng::seed_from_u64(training.seed),
            config: training,
            conditioning_dropout: model_config.conditioning_dropout,
            timesteps,
            device: device.clone(),
        })
    }

    pub fn model(&self) -> &RecModel {
        &self.model
    }

    pub fn process(&self) -> &DiffusionProcess {
        &self.process
    }

    pub fn genre(&self) -> &GenreSubsystem {
        &self.genre
    }

    /// Uniform per-example timestep draw in [0, T).
    fn draw_timesteps(&mut self, batch: usize) -> DiffRecResult<Tensor> {
        let draws: Vec<u32> = (0..batch)
            .map(|_| self.rng.gen_range(0..self.timesteps as u32))
            .collect();
        Ok(Tensor::from_vec(draws, (batch,), &self.device)?)
    }

    /// One optimizer step over one batch. Returns the combined loss value.
    pub fn train_batch(&mut self, batch: &InteractionBatch) -> DiffRecResult<f32> {
        let t = self.draw_timesteps(batch.len())?;
        let genre_t = if self.config.shared_genre_timestep {
            t.clone()
        } else {
            self.draw_timesteps(batch.len())?
        };
        let aux = self.genre.condition(
            &batch.genre_states,
            &batch.genre_lengths,
            &batch.genre_targets,
            self.conditioning_dropout,
            &genre_t,
        )?;

        let x_start = self.model.encoder().embed_items(&batch.targets)?;
        let h = self.model.encoder().encode(
            &batch.states,
            &batch.lengths,
            self.conditioning_dropout,
            true,
        )?;
        let (diffusion_loss, predicted_x) =
            self.process
                .p_losses(&self.model, &x_start, &h, &t, Some(&aux), None)?;

        // Joint objective: reconstruction plus decoder-head classification.
        let logits = self.model.decoder()?.forward(&predicted_x)?;
        let classification_loss = candle_nn::loss::cross_entropy(&logits, &batch.targets)?;
        let loss = (&diffusion_loss + &classification_loss)?;

        self.optimizer.backward_step(&loss)?;

        let value = loss.to_scalar::<f32>()?;
        tracing::debug!(
            loss = value,
            diffusion_loss = diffusion_loss.to_scalar::<f32>()?,
            "training step"
        );
        Ok(value)
    }

    /// Evaluation pass over one batch: compute the joint loss (no optimizer
    /// step) and accumulate decoder-head rankings into `metrics`.
    ///
    /// A ranking failure is logged and skipped; the loss computation itself
    /// is never relaxed.
    pub fn evaluate_batch(
        &mut self,
        batch: &InteractionBatch,
        metrics: &mut RankingMetrics,
    ) -> DiffRecResult<f32> {
        let t = self.draw_timesteps(batch.len())?;
        let genre_t = if self.config.shared_genre_timestep {
            t.clone()
        } else {
            self.draw_timesteps(batch.len())?
        };
        let aux = self.genre.condition(
            &batch.genre_states,
            &batch.genre_lengths,
            &batch.genre_targets,
            self.conditioning_dropout,
            &genre_t,
        )?;

        let x_start = self.model.encoder().embed_items(&batch.targets)?;
        let h = self.model.encoder().encode(
            &batch.states,
            &batch.lengths,
            self.conditioning_dropout,
            false,
        )?;
        let (loss, predicted_x) =
            self.process
                .p_losses(&self.model, &x_start, &h, &t, Some(&aux), None)?;

        let ranking = self
            .model
            .decoder()?
            .forward(&predicted_x)
            .and_then(|logits| {
                let probs = candle_nn::ops::softmax(&logits, candle_core::D::Minus1)?;
                top_k_batch(&probs, metrics.max_k())
            });
        metrics.accumulate_checked(ranking, &batch.target_ids);

        Ok(loss.to_scalar::<f32>()?)
    }

    /// Write the two-artifact snapshot for the primary model.
    pub fn save_checkpoint(&self, paths: &CheckpointPaths) -> DiffRecResult<()> {
        checkpoint::save(&self.varmap, &self.process, paths)
    }
}
