//! Diffusion numerics for sequential recommendation.
//!
//! This crate holds the pure, weight-free half of the recommender: noise
//! schedule construction, per-timestep coefficient lookup, and the
//! [`DiffusionProcess`] state machine that drives forward corruption,
//! the training loss, and guided reverse sampling.
//!
//! # Architecture
//!
//! - **[`NoiseSchedule`]**: immutable per-timestep coefficients, computed once
//!   from a [`BetaSchedule`] family and materialized on the compute device.
//! - **[`Denoiser`]**: the seam between numerics and learned networks. The
//!   primary item model and the frozen genre subsystem both implement it.
//! - **[`DiffusionProcess`]**: q_sample / p_losses / p_sample / sample over a
//!   schedule and a denoiser, with classifier-free guidance at sampling time.
//!
//! The learned components (sequence encoder, denoiser networks, scorer) live
//! in `diffrec-model`.

pub mod config;
pub mod error;
pub mod process;
pub mod schedule;

pub use config::{
    BetaSchedule, DiffuserDepth, DiffusionConfig, LossType, ModelConfig, TrainingConfig,
};
pub use error::{DiffRecError, DiffRecResult};
pub use process::{Denoiser, DiffusionProcess, DiffusionSnapshot};
pub use schedule::{NoiseSchedule, ScheduleTable};
