//! Noise schedule construction and per-timestep coefficient lookup.
//!
//! A [`NoiseSchedule`] is computed once at construction and immutable
//! afterwards. Coefficients are derived in `f64` on the host (the recurrences
//! are cheap and precision-sensitive), kept as a serializable
//! [`ScheduleTable`], and materialized as `f32` tensors on the target device
//! for batched gather-and-broadcast via [`NoiseSchedule::extract`].

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{BetaSchedule, DiffusionConfig};
use crate::error::{DiffRecError, DiffRecResult};

/// Offset constant for the cosine schedule.
const COSINE_S: f64 = 0.008;
/// Decay bounds for the exponential schedule.
const EXP_BETA_MIN: f64 = 0.1;
const EXP_BETA_MAX: f64 = 10.0;
/// Epsilon inside the sqrt cumulative-alpha curve.
const SQRT_EPS: f64 = 1e-4;

/// Betas linearly spaced between `beta_start` and `beta_end`.
fn linear_betas(timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
    if timesteps == 1 {
        return vec![beta_start];
    }
    let step = (beta_end - beta_start) / (timesteps - 1) as f64;
    (0..timesteps).map(|i| beta_start + step * i as f64).collect()
}

/// Betas from an exponential-decay closed form over x = linspace(1, 2T+1, T).
fn exp_betas(timesteps: usize) -> Vec<f64> {
    let t = timesteps as f64;
    let xs: Vec<f64> = if timesteps == 1 {
        vec![1.0]
    } else {
        let step = 2.0 * t / (timesteps - 1) as f64;
        (0..timesteps).map(|i| 1.0 + step * i as f64).collect()
    };
    xs.iter()
        .map(|x| 1.0 - (-EXP_BETA_MIN / t - x * 0.5 * (EXP_BETA_MAX - EXP_BETA_MIN) / (t * t)).exp())
        .collect()
}

/// Betas from the cosine-squared cumulative-product curve, clipped to
/// [1e-4, 0.9999].
fn cosine_betas(timesteps: usize) -> Vec<f64> {
    let t = timesteps as f64;
    let f = |i: f64| {
        let inner = ((i / t + COSINE_S) / (1.0 + COSINE_S)) * std::f64::consts::FRAC_PI_2;
        inner.cos().powi(2)
    };
    let f0 = f(0.0);
    let cumprod: Vec<f64> = (0..=timesteps).map(|i| f(i as f64) / f0).collect();
    (0..timesteps)
        .map(|i| (1.0 - cumprod[i + 1] / cumprod[i]).clamp(1e-4, 0.9999))
        .collect()
}

/// Betas discretizing `alpha_bar(u) = 1 - sqrt(u + eps)`, capped at 0.999.
fn sqrt_betas(timesteps: usize) -> Vec<f64> {
    let t = timesteps as f64;
    let alpha_bar = |u: f64| 1.0 - (u + SQRT_EPS).sqrt();
    (0..timesteps)
        .map(|i| {
            let t1 = i as f64 / t;
            let t2 = (i + 1) as f64 / t;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
        })
        .collect()
}

/// All per-timestep coefficient families derived from a beta schedule.
///
/// Serializable so a diffusion snapshot can be written to disk and reloaded
/// independently of model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTable {
    pub betas: Vec<f64>,
    pub alphas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_alphas_cumprod: Vec<f64>,
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub sqrt_recip_alphas: Vec<f64>,
    pub sqrt_recip_alphas_cumprod: Vec<f64>,
    pub sqrt_recipm1_alphas_cumprod: Vec<f64>,
    pub posterior_mean_coef1: Vec<f64>,
    pub posterior_mean_coef2: Vec<f64>,
    pub posterior_variance: Vec<f64>,
}

impl ScheduleTable {
    /// Derive every coefficient family from raw betas.
    fn from_betas(betas: Vec<f64>) -> Self {
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(alphas.len());
        let mut acc = 1.0;
        for a in &alphas {
            acc *= a;
            alphas_cumprod.push(acc);
        }

        let mut alphas_cumprod_prev = Vec::with_capacity(alphas.len());
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..alphas_cumprod.len() - 1]);

        let sqrt_alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let sqrt_recip_alphas: Vec<f64> = alphas.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recip_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect();

        let posterior_mean_coef1: Vec<f64> = (0..betas.len())
            .map(|t| betas[t] * alphas_cumprod_prev[t].sqrt() / (1.0 - alphas_cumprod[t]))
            .collect();
        let posterior_mean_coef2: Vec<f64> = (0..betas.len())
            .map(|t| (1.0 - alphas_cumprod_prev[t]) * alphas[t].sqrt() / (1.0 - alphas_cumprod[t]))
            .collect();
        let posterior_variance: Vec<f64> = (0..betas.len())
            .map(|t| betas[t] * (1.0 - alphas_cumprod_prev[t]) / (1.0 - alphas_cumprod[t]))
            .collect();

        Self {
            betas,
            alphas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_mean_coef1,
            posterior_mean_coef2,
            posterior_variance,
        }
    }
}

/// Immutable per-timestep coefficients on a compute device.
///
/// Lookup by a per-example timestep tensor goes through [`Self::extract`],
/// which reshapes the gathered scalars for broadcasting against a batch of
/// arbitrary-rank tensors with the batch dimension first.
#[derive(Debug)]
pub struct NoiseSchedule {
    timesteps: usize,
    table: ScheduleTable,
    device: Device,
    pub(crate) sqrt_alphas_cumprod: Tensor,
    pub(crate) sqrt_one_minus_alphas_cumprod: Tensor,
    pub(crate) sqrt_recip_alphas_cumprod: Tensor,
    pub(crate) sqrt_recipm1_alphas_cumprod: Tensor,
    pub(crate) posterior_mean_coef1: Tensor,
    pub(crate) posterior_mean_coef2: Tensor,
    pub(crate) posterior_variance: Tensor,
}

impl NoiseSchedule {
    /// Build a schedule from a validated diffusion config.
    pub fn new(config: &DiffusionConfig, device: &Device) -> DiffRecResult<Self> {
        config.validate()?;
        let betas = match config.schedule {
            BetaSchedule::Linear => {
                linear_betas(config.timesteps, config.beta_start, config.beta_end)
            }
            BetaSchedule::Exp => exp_betas(config.timesteps),
            BetaSchedule::Cosine => cosine_betas(config.timesteps),
            BetaSchedule::Sqrt => sqrt_betas(config.timesteps),
        };
        Self::from_table(ScheduleTable::from_betas(betas), device)
    }

    /// Rebuild device tensors from a previously serialized table.
    pub fn from_table(table: ScheduleTable, device: &Device) -> DiffRecResult<Self> {
        let timesteps = table.betas.len();
        if timesteps == 0 {
            return Err(DiffRecError::config("schedule table is empty"));
        }
        let to_tensor = |v: &[f64]| -> DiffRecResult<Tensor> {
            let data: Vec<f32> = v.iter().map(|x| *x as f32).collect();
            Ok(Tensor::from_vec(data, (timesteps,), device)?.to_dtype(DType::F32)?)
        };
        Ok(Self {
            timesteps,
            device: device.clone(),
            sqrt_alphas_cumprod: to_tensor(&table.sqrt_alphas_cumprod)?,
            sqrt_one_minus_alphas_cumprod: to_tensor(&table.sqrt_one_minus_alphas_cumprod)?,
            sqrt_recip_alphas_cumprod: to_tensor(&table.sqrt_recip_alphas_cumprod)?,
            sqrt_recipm1_alphas_cumprod: to_tensor(&table.sqrt_recipm1_alphas_cumprod)?,
            posterior_mean_coef1: to_tensor(&table.posterior_mean_coef1)?,
            posterior_mean_coef2: to_tensor(&table.posterior_mean_coef2)?,
            posterior_variance: to_tensor(&table.posterior_variance)?,
            table,
        })
    }

    /// Number of diffusion steps T.
    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    /// Host-side coefficient table (for serialization and inspection).
    pub fn table(&self) -> &ScheduleTable {
        &self.table
    }

    /// Device the coefficient tensors live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Gather `coeff[t]` per example and reshape to `(batch, 1, ..., 1)` so
    /// it broadcasts against `like` (batch dimension first).
    ///
    /// `t` is a `(batch,)` tensor of u32 timestep indices.
    pub fn extract(coeff: &Tensor, t: &Tensor, like: &Tensor) -> DiffRecResult<Tensor> {
        let batch = t.dim(0)?;
        let gathered = coeff.index_select(t, 0)?;
        let mut shape = vec![batch];
        shape.extend(std::iter::repeat(1).take(like.rank().saturating_sub(1)));
        Ok(gathered.reshape(shape)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossType;

    fn config(schedule: BetaSchedule, timesteps: usize) -> DiffusionConfig {
        DiffusionConfig {
            timesteps,
            beta_start: 1e-4,
            beta_end: 0.02,
            schedule,
            guidance_scale: 2.0,
            loss_type: LossType::L2,
        }
    }

    #[test]
    fn cumprod_is_monotone_and_bounded_for_all_families() {
        for family in [
            BetaSchedule::Linear,
            BetaSchedule::Exp,
            BetaSchedule::Cosine,
            BetaSchedule::Sqrt,
        ] {
            let schedule = NoiseSchedule::new(&config(family, 50), &Device::Cpu).unwrap();
            let table = schedule.table();
            assert_eq!(table.alphas_cumprod_prev[0], 1.0, "{family:?}: prev[0] must be 1.0");
            let mut prev = 1.0f64;
            for (t, ac) in table.alphas_cumprod.iter().enumerate() {
                assert!(
                    *ac > 0.0 && *ac <= 1.0,
                    "{family:?}: alphas_cumprod[{t}] = {ac} out of (0, 1]"
                );
                assert!(
                    *ac <= prev + 1e-12,
                    "{family:?}: alphas_cumprod must be non-increasing at t = {t}"
                );
                prev = *ac;
            }
        }
    }

    #[test]
    fn linear_endpoints_match_bounds() {
        let schedule = NoiseSchedule::new(&config(BetaSchedule::Linear, 10), &Device::Cpu).unwrap();
        let betas = &schedule.table().betas;
        assert!((betas[0] - 1e-4).abs() < 1e-12);
        assert!((betas[9] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn cosine_betas_are_clipped() {
        let schedule = NoiseSchedule::new(&config(BetaSchedule::Cosine, 200), &Device::Cpu).unwrap();
        for b in &schedule.table().betas {
            assert!(*b >= 1e-4 && *b <= 0.9999);
        }
    }

    #[test]
    fn sqrt_betas_are_capped() {
        let schedule = NoiseSchedule::new(&config(BetaSchedule::Sqrt, 100), &Device::Cpu).unwrap();
        for b in &schedule.table().betas {
            assert!(*b <= 0.999);
        }
    }

    #[test]
    fn posterior_coefficients_match_closed_form() {
        let schedule = NoiseSchedule::new(&config(BetaSchedule::Linear, 20), &Device::Cpu).unwrap();
        let table = schedule.table();
        for t in 0..20 {
            let c1 = table.betas[t] * table.alphas_cumprod_prev[t].sqrt()
                / (1.0 - table.alphas_cumprod[t]);
            let c2 = (1.0 - table.alphas_cumprod_prev[t]) * table.alphas[t].sqrt()
                / (1.0 - table.alphas_cumprod[t]);
            assert!((table.posterior_mean_coef1[t] - c1).abs() < 1e-12);
            assert!((table.posterior_mean_coef2[t] - c2).abs() < 1e-12);
        }
    }

    #[test]
    fn extract_broadcasts_per_example() {
        let device = Device::Cpu;
        let schedule = NoiseSchedule::new(&config(BetaSchedule::Linear, 5), &device).unwrap();
        let t = Tensor::from_vec(vec![0u32, 4u32], (2,), &device).unwrap();
        let like = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let out = NoiseSchedule::extract(&schedule.sqrt_alphas_cumprod, &t, &like).unwrap();
        assert_eq!(out.dims(), &[2, 1]);
        let vals = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] as f64 - schedule.table().sqrt_alphas_cumprod[0]).abs() < 1e-6);
        assert!((vals[1] as f64 - schedule.table().sqrt_alphas_cumprod[4]).abs() < 1e-6);
    }

    #[test]
    fn table_round_trips_through_serde() {
        let schedule = NoiseSchedule::new(&config(BetaSchedule::Exp, 8), &Device::Cpu).unwrap();
        let json = serde_json::to_string(schedule.table()).unwrap();
        let table: ScheduleTable = serde_json::from_str(&json).unwrap();
        let rebuilt = NoiseSchedule::from_table(table, &Device::Cpu).unwrap();
        assert_eq!(rebuilt.timesteps(), 8);
        assert_eq!(rebuilt.table().betas, schedule.table().betas);
    }
}
