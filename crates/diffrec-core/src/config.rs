//! Configuration surface for the diffusion recommender.
//!
//! All configs are plain serde structs with fail-fast `validate()` methods.
//! Invalid values are construction-time errors, never silent defaults: an
//! unknown schedule or loss name must abort rather than fall back.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DiffRecError, DiffRecResult};

/// Beta schedule family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetaSchedule {
    /// Betas linearly spaced between `beta_start` and `beta_end`.
    Linear,
    /// Exponential-decay closed form parameterized by the step count.
    Exp,
    /// Cosine-squared cumulative-product curve with a small offset.
    Cosine,
    /// Discretized `1 - sqrt(t + eps)` cumulative-alpha curve.
    Sqrt,
}

impl FromStr for BetaSchedule {
    type Err = DiffRecError;

    fn from_str(s: &str) -> DiffRecResult<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "exp" => Ok(Self::Exp),
            "cosine" => Ok(Self::Cosine),
            "sqrt" => Ok(Self::Sqrt),
            other => Err(DiffRecError::config(format!(
                "unknown beta schedule '{other}' (expected linear, exp, cosine, or sqrt)"
            ))),
        }
    }
}

/// Reconstruction loss selector for the denoising objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    /// Mean absolute error.
    L1,
    /// Mean squared error (default).
    L2,
    /// Smooth-L1 with unit transition point.
    Huber,
}

impl FromStr for LossType {
    type Err = DiffRecError;

    fn from_str(s: &str) -> DiffRecResult<Self> {
        match s {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            "huber" => Ok(Self::Huber),
            other => Err(DiffRecError::config(format!(
                "unknown loss type '{other}' (expected l1, l2, or huber)"
            ))),
        }
    }
}

/// Depth variant of the denoiser's diffuser MLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffuserDepth {
    /// Single linear layer over the concatenated inputs.
    Mlp1,
    /// Two-layer MLP with a GELU nonlinearity.
    Mlp2,
}

/// Configuration of the diffusion process itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Number of diffusion steps T.
    pub timesteps: usize,
    /// Beta at t = 0 (linear family only).
    pub beta_start: f64,
    /// Beta at t = T-1 (linear family only).
    pub beta_end: f64,
    /// Schedule family.
    pub schedule: BetaSchedule,
    /// Classifier-free guidance scale w.
    pub guidance_scale: f64,
    /// Reconstruction loss for `p_losses`.
    pub loss_type: LossType,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            timesteps: 200,
            beta_start: 1e-4,
            beta_end: 0.02,
            schedule: BetaSchedule::Exp,
            guidance_scale: 2.0,
            loss_type: LossType::L2,
        }
    }
}

impl DiffusionConfig {
    /// Reject degenerate diffusion parameters.
    pub fn validate(&self) -> DiffRecResult<()> {
        if self.timesteps == 0 {
            return Err(DiffRecError::config("timesteps must be >= 1"));
        }
        if !(self.beta_start > 0.0 && self.beta_start < 1.0) {
            return Err(DiffRecError::config(format!(
                "beta_start must lie in (0, 1), got {}",
                self.beta_start
            )));
        }
        if !(self.beta_end > 0.0 && self.beta_end < 1.0) {
            return Err(DiffRecError::config(format!(
                "beta_end must lie in (0, 1), got {}",
                self.beta_end
            )));
        }
        if self.beta_end < self.beta_start {
            return Err(DiffRecError::config(format!(
                "beta_end ({}) must be >= beta_start ({})",
                self.beta_end, self.beta_start
            )));
        }
        if !self.guidance_scale.is_finite() {
            return Err(DiffRecError::config("guidance_scale must be finite"));
        }
        Ok(())
    }
}

/// Configuration of the sequence encoder / denoiser pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden dimension D of embeddings and conditioning vectors.
    pub hidden_size: usize,
    /// Catalog size; `item_num` itself is the padding sentinel id.
    pub item_num: usize,
    /// Fixed (padded) sequence capacity.
    pub state_size: usize,
    /// Attention heads inside the sequence encoder.
    pub num_heads: usize,
    /// Dropout rate applied to combined embeddings.
    pub dropout: f32,
    /// Conditioning-dropout probability p for classifier-free guidance.
    pub conditioning_dropout: f32,
    /// Diffuser MLP depth.
    pub diffuser_depth: DiffuserDepth,
    /// Whether the denoiser accepts a secondary (genre) conditioning slot.
    pub with_aux: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 64,
            item_num: 0,
            state_size: 10,
            num_heads: 1,
            dropout: 0.1,
            conditioning_dropout: 0.1,
            diffuser_depth: DiffuserDepth::Mlp1,
            with_aux: false,
        }
    }
}

impl ModelConfig {
    /// Reject dimensionally impossible model shapes.
    pub fn validate(&self) -> DiffRecResult<()> {
        if self.hidden_size == 0 {
            return Err(DiffRecError::config("hidden_size must be >= 1"));
        }
        if self.hidden_size % 2 != 0 {
            // The sinusoidal timestep embedding splits the dimension into
            // sin/cos halves.
            return Err(DiffRecError::config(format!(
                "hidden_size must be even, got {}",
                self.hidden_size
            )));
        }
        if self.item_num == 0 {
            return Err(DiffRecError::config("item_num must be >= 1"));
        }
        if self.state_size == 0 {
            return Err(DiffRecError::config("state_size must be >= 1"));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(DiffRecError::config(format!(
                "num_heads ({}) must be >= 1 and divide hidden_size ({})",
                self.num_heads, self.hidden_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(DiffRecError::config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(0.0..=1.0).contains(&self.conditioning_dropout) {
            return Err(DiffRecError::config(format!(
                "conditioning_dropout must lie in [0, 1], got {}",
                self.conditioning_dropout
            )));
        }
        Ok(())
    }
}

/// Knobs for the per-batch training step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// AdamW learning rate.
    pub learning_rate: f64,
    /// AdamW weight decay (l2 regularization).
    pub weight_decay: f64,
    /// Seed threaded through device RNG and host-side timestep draws.
    pub seed: u64,
    /// Whether the frozen genre subsystem reuses the primary model's
    /// per-example timestep draw instead of drawing its own.
    pub shared_genre_timestep: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.005,
            weight_decay: 0.0,
            seed: 100,
            shared_genre_timestep: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_names_parse() {
        assert_eq!("linear".parse::<BetaSchedule>().unwrap(), BetaSchedule::Linear);
        assert_eq!("exp".parse::<BetaSchedule>().unwrap(), BetaSchedule::Exp);
        assert_eq!("cosine".parse::<BetaSchedule>().unwrap(), BetaSchedule::Cosine);
        assert_eq!("sqrt".parse::<BetaSchedule>().unwrap(), BetaSchedule::Sqrt);
    }

    #[test]
    fn unknown_schedule_name_is_fatal() {
        let err = "quadratic".parse::<BetaSchedule>().unwrap_err();
        assert!(
            matches!(err, DiffRecError::Config { .. }),
            "unknown schedule must be a config error, got {err:?}"
        );
    }

    #[test]
    fn unknown_loss_name_is_fatal() {
        assert!("l3".parse::<LossType>().is_err());
        assert_eq!("huber".parse::<LossType>().unwrap(), LossType::Huber);
    }

    #[test]
    fn default_diffusion_config_is_valid() {
        DiffusionConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_timesteps_rejected() {
        let cfg = DiffusionConfig { timesteps: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn model_config_rejects_indivisible_heads() {
        let cfg = ModelConfig {
            hidden_size: 64,
            item_num: 10,
            num_heads: 3,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
