//! The full recommender model: encoder + denoiser (+ optional decoder head)
//! over one shared weight store.
//!
//! The same component serves the primary item model and the genre subsystem;
//! the two differ only in configuration (`with_aux`) and in whether a decoder
//! head is attached. No subclass-style duplication.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use diffrec_core::{Denoiser, DiffRecError, DiffRecResult, DiffusionProcess, ModelConfig};

use crate::denoiser::DenoiserNetwork;
use crate::encoder::SequenceEncoder;
use crate::scorer::{similarity_scores, DecoderHead};

/// Sequence encoder, denoiser network, and optional decoder head built over a
/// single `VarBuilder` prefix.
#[derive(Debug)]
pub struct RecModel {
    config: ModelConfig,
    encoder: SequenceEncoder,
    denoiser: DenoiserNetwork,
    decoder: Option<DecoderHead>,
}

impl RecModel {
    /// Build the model. `with_decoder` attaches the jointly trained
    /// classification head; the genre subsystem runs without one.
    pub fn new(config: &ModelConfig, with_decoder: bool, vb: VarBuilder) -> DiffRecResult<Self> {
        config.validate()?;
        let encoder = SequenceEncoder::new(config, vb.pp("encoder"))?;
        // The denoiser shares the encoder's null embedding storage.
        let denoiser =
            DenoiserNetwork::new(config, encoder.null_embedding().clone(), vb.pp("denoiser"))?;
        let decoder = if with_decoder {
            Some(DecoderHead::new(config, vb.pp("decoder"))?)
        } else {
            None
        };
        Ok(Self { config: config.clone(), encoder, denoiser, decoder })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &SequenceEncoder {
        &self.encoder
    }

    /// The decoder head, if this model was built with one.
    pub fn decoder(&self) -> DiffRecResult<&DecoderHead> {
        self.decoder
            .as_ref()
            .ok_or_else(|| DiffRecError::config("model was built without a decoder head"))
    }

    /// Rank the catalog for a batch of histories: encode, run the full
    /// reverse chain, score by cosine similarity against the item table.
    ///
    /// Returns `(batch, item_num)` scores.
    pub fn predict(
        &self,
        states: &Tensor,
        len_states: &[usize],
        process: &DiffusionProcess,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        let h = self.encoder.encode(states, len_states, 0.0, false)?;
        let x = process.sample(self, &h, aux)?;
        similarity_scores(&x, self.encoder.item_table(), self.config.item_num)
    }
}

impl Denoiser for RecModel {
    fn denoise(
        &self,
        x_noisy: &Tensor,
        h: &Tensor,
        t: &Tensor,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        self.denoiser.denoise(x_noisy, h, t, aux)
    }

    fn denoise_uncond(
        &self,
        x_noisy: &Tensor,
        t: &Tensor,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        self.denoiser.denoise_uncond(x_noisy, t, aux)
    }
}
