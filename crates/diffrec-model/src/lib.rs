//! Learned components of the diffusion recommender.
//!
//! Built on candle, over the numerics in `diffrec-core`:
//!
//! - **[`SequenceEncoder`]**: padded interaction history -> conditioning
//!   vector h, with classifier-free-guidance conditioning dropout.
//! - **[`DenoiserNetwork`]**: (noisy embedding, h, timestep[, genre aux]) ->
//!   predicted clean embedding; conditional and unconditional forms share
//!   weights through the learned null embedding.
//! - **[`RecModel`]**: encoder + denoiser (+ optional decoder head) over one
//!   weight store; implements the core `Denoiser` seam.
//! - **[`GenreSubsystem`]**: a frozen second model whose one-step denoised
//!   output conditions the primary denoiser.
//! - **[`scorer`]**: decoder-head logits or cosine similarity against the
//!   item table, plus stable top-K selection.
//! - **[`Trainer`]**: one optimizer step per batch (diffusion loss + decoder
//!   cross-entropy), and the matching evaluation pass.

pub mod checkpoint;
pub mod data;
pub mod denoiser;
pub mod encoder;
pub mod eval;
pub mod genre;
pub mod model;
pub mod scorer;
pub mod training;

pub use checkpoint::CheckpointPaths;
pub use data::{InteractionBatch, InteractionRow};
pub use denoiser::DenoiserNetwork;
pub use encoder::SequenceEncoder;
pub use eval::RankingMetrics;
pub use genre::GenreSubsystem;
pub use model::RecModel;
pub use training::Trainer;
