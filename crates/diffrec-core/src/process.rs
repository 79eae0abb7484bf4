//! The diffusion process: forward corruption, training loss, and the guided
//! reverse sampling chain.
//!
//! [`DiffusionProcess`] is generic over the [`Denoiser`] seam so the same
//! numerics drive both the primary item model and the frozen genre subsystem.
//! The reverse chain is a strict countdown over t_index = T-1 ..= 0; each step
//! consumes the previous step's output, so the loop is inherently serial.

use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{DiffusionConfig, LossType};
use crate::error::{DiffRecError, DiffRecResult};
use crate::schedule::{NoiseSchedule, ScheduleTable};

/// A denoising network: predicts the clean embedding from a noisy one.
///
/// Both forms are deterministic functions of their inputs for fixed weights.
/// `aux` carries the optional secondary (genre) conditioning slot.
pub trait Denoiser {
    /// Conditional prediction given the conditioning vector `h`.
    fn denoise(
        &self,
        x_noisy: &Tensor,
        h: &Tensor,
        t: &Tensor,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor>;

    /// Unconditional prediction; the implementation substitutes its learned
    /// null embedding for `h`.
    fn denoise_uncond(
        &self,
        x_noisy: &Tensor,
        t: &Tensor,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor>;
}

/// On-disk snapshot of a diffusion process (config plus coefficient table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionSnapshot {
    pub config: DiffusionConfig,
    pub table: ScheduleTable,
}

/// Orchestrates q_sample, p_losses, and the reverse sampling loop over a
/// fixed [`NoiseSchedule`].
#[derive(Debug)]
pub struct DiffusionProcess {
    config: DiffusionConfig,
    schedule: NoiseSchedule,
}

/// Require two tensors to agree in shape exactly before a broadcast op.
fn ensure_same_shape(lhs: &Tensor, rhs: &Tensor, what: &str) -> DiffRecResult<()> {
    if lhs.dims() != rhs.dims() {
        return Err(DiffRecError::ShapeMismatch {
            expected: format!("{what}: {:?}", lhs.dims()),
            actual: format!("{:?}", rhs.dims()),
        });
    }
    Ok(())
}

impl DiffusionProcess {
    /// Build a process from a validated config, materializing the schedule
    /// on `device`.
    pub fn new(config: DiffusionConfig, device: &Device) -> DiffRecResult<Self> {
        let schedule = NoiseSchedule::new(&config, device)?;
        Ok(Self { config, schedule })
    }

    /// Number of diffusion steps T.
    pub fn timesteps(&self) -> usize {
        self.schedule.timesteps()
    }

    /// Guidance scale w.
    pub fn guidance_scale(&self) -> f64 {
        self.config.guidance_scale
    }

    /// The immutable schedule backing this process.
    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Forward corruption: `x_t = sqrt(ac[t])·x_0 + sqrt(1-ac[t])·ε`.
    ///
    /// `noise` defaults to a standard-normal draw of `x_start`'s shape.
    pub fn q_sample(
        &self,
        x_start: &Tensor,
        t: &Tensor,
        noise: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        let noise = match noise {
            Some(n) => {
                ensure_same_shape(x_start, n, "q_sample noise")?;
                n.clone()
            }
            None => x_start.randn_like(0.0, 1.0)?,
        };
        let sqrt_ac = NoiseSchedule::extract(&self.schedule.sqrt_alphas_cumprod, t, x_start)?;
        let sqrt_om = NoiseSchedule::extract(
            &self.schedule.sqrt_one_minus_alphas_cumprod,
            t,
            x_start,
        )?;
        let signal = x_start.broadcast_mul(&sqrt_ac)?;
        let corruption = noise.broadcast_mul(&sqrt_om)?;
        Ok((signal + corruption)?)
    }

    /// Reconstruction loss between the clean target and the denoiser's
    /// prediction from a freshly corrupted sample.
    ///
    /// Returns `(loss, predicted_x)`; the prediction is reused downstream by
    /// the item scorer so it is never recomputed.
    pub fn p_losses<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        x_start: &Tensor,
        h: &Tensor,
        t: &Tensor,
        aux: Option<&Tensor>,
        noise: Option<&Tensor>,
    ) -> DiffRecResult<(Tensor, Tensor)> {
        ensure_same_shape(x_start, h, "p_losses conditioning h")?;
        if let Some(a) = aux {
            ensure_same_shape(x_start, a, "p_losses aux conditioning")?;
        }
        let x_noisy = self.q_sample(x_start, t, noise)?;
        let predicted_x = denoiser.denoise(&x_noisy, h, t, aux)?;
        let loss = reconstruction_loss(self.config.loss_type, x_start, &predicted_x)?;
        Ok((loss, predicted_x))
    }

    /// Classifier-free-guidance estimate of the clean embedding:
    /// `(1+w)·cond − w·uncond`. At w = 0 this is exactly the conditional
    /// prediction.
    pub fn guided_x_start<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        x: &Tensor,
        h: &Tensor,
        t: &Tensor,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        let w = self.config.guidance_scale;
        let cond = denoiser.denoise(x, h, t, aux)?;
        if w == 0.0 {
            return Ok(cond);
        }
        let uncond = denoiser.denoise_uncond(x, t, aux)?;
        Ok((cond.affine(1.0 + w, 0.0)? - uncond.affine(w, 0.0)?)?)
    }

    /// One reverse step. `t` holds the timestep per example; `t_index` is the
    /// loop counter. The terminal step (`t_index == 0`) returns the posterior
    /// mean with no added noise.
    pub fn p_sample<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        x: &Tensor,
        h: &Tensor,
        t: &Tensor,
        t_index: usize,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        ensure_same_shape(x, h, "p_sample conditioning h")?;
        let x_start_hat = self.guided_x_start(denoiser, x, h, t, aux)?;
        let coef1 = NoiseSchedule::extract(&self.schedule.posterior_mean_coef1, t, x)?;
        let coef2 = NoiseSchedule::extract(&self.schedule.posterior_mean_coef2, t, x)?;
        let mean =
            (x_start_hat.broadcast_mul(&coef1)? + x.broadcast_mul(&coef2)?)?;
        if t_index == 0 {
            return Ok(mean);
        }
        let variance = NoiseSchedule::extract(&self.schedule.posterior_variance, t, x)?;
        let noise = x.randn_like(0.0, 1.0)?;
        Ok((mean + noise.broadcast_mul(&variance.sqrt()?)?)?)
    }

    /// Full reverse Markov chain: start from pure noise shaped like `h`,
    /// count t_index down from T-1 to 0, return the final clean embedding.
    pub fn sample<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        h: &Tensor,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        let batch = h.dim(0)?;
        let mut x = h.randn_like(0.0, 1.0)?;
        for t_index in (0..self.timesteps()).rev() {
            let t = Tensor::full(t_index as u32, (batch,), h.device())?;
            x = self.p_sample(denoiser, &x, h, &t, t_index, aux)?;
        }
        Ok(x)
    }

    /// Invert the forward process: recover the noise that would map `x0` to
    /// `x_t` at timestep `t`.
    pub fn predict_noise_from_start(
        &self,
        x_t: &Tensor,
        t: &Tensor,
        x0: &Tensor,
    ) -> DiffRecResult<Tensor> {
        ensure_same_shape(x_t, x0, "predict_noise_from_start x0")?;
        let recip = NoiseSchedule::extract(&self.schedule.sqrt_recip_alphas_cumprod, t, x_t)?;
        let recipm1 =
            NoiseSchedule::extract(&self.schedule.sqrt_recipm1_alphas_cumprod, t, x_t)?;
        let scaled = (x_t.broadcast_mul(&recip)? - x0)?;
        Ok(scaled.broadcast_div(&recipm1)?)
    }

    /// Write the full snapshot (config + coefficient table) as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> DiffRecResult<()> {
        let snapshot = DiffusionSnapshot {
            config: self.config.clone(),
            table: self.schedule.table().clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path.as_ref(), json)?;
        tracing::info!(path = %path.as_ref().display(), "saved diffusion snapshot");
        Ok(())
    }

    /// Reload a snapshot, rebuilding coefficient tensors on `device`.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> DiffRecResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let snapshot: DiffusionSnapshot = serde_json::from_str(&json)?;
        snapshot.config.validate()?;
        if snapshot.table.betas.len() != snapshot.config.timesteps {
            return Err(DiffRecError::checkpoint(format!(
                "snapshot table has {} steps but config declares {}",
                snapshot.table.betas.len(),
                snapshot.config.timesteps
            )));
        }
        let schedule = NoiseSchedule::from_table(snapshot.table, device)?;
        tracing::info!(
            path = %path.as_ref().display(),
            timesteps = snapshot.config.timesteps,
            "loaded diffusion snapshot"
        );
        Ok(Self { config: snapshot.config, schedule })
    }
}

/// Elementwise reconstruction loss reduced to a scalar.
fn reconstruction_loss(
    loss_type: LossType,
    target: &Tensor,
    predicted: &Tensor,
) -> DiffRecResult<Tensor> {
    ensure_same_shape(target, predicted, "reconstruction target")?;
    let diff = (target - predicted)?;
    let loss = match loss_type {
        LossType::L1 => diff.abs()?.mean_all()?,
        LossType::L2 => diff.sqr()?.mean_all()?,
        LossType::Huber => {
            // Smooth-L1 with unit transition: 0.5·d² for |d| < 1, |d| − 0.5 otherwise.
            let abs = diff.abs()?;
            let quadratic = diff.sqr()?.affine(0.5, 0.0)?;
            let linear = abs.affine(1.0, -0.5)?;
            let small = abs.lt(1.0)?;
            small.where_cond(&quadratic, &linear)?.mean_all()?
        }
    };
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BetaSchedule;
    use candle_core::{DType, Device};

    /// Denoiser stub with fixed, input-determined outputs.
    struct StubDenoiser;

    impl Denoiser for StubDenoiser {
        fn denoise(
            &self,
            x_noisy: &Tensor,
            h: &Tensor,
            _t: &Tensor,
            _aux: Option<&Tensor>,
        ) -> DiffRecResult<Tensor> {
            Ok(((x_noisy * 0.25)? + h)?)
        }

        fn denoise_uncond(
            &self,
            x_noisy: &Tensor,
            _t: &Tensor,
            _aux: Option<&Tensor>,
        ) -> DiffRecResult<Tensor> {
            Ok((x_noisy * 0.5)?)
        }
    }

    fn process(w: f64, loss_type: LossType) -> DiffusionProcess {
        let config = DiffusionConfig {
            timesteps: 5,
            beta_start: 1e-4,
            beta_end: 0.02,
            schedule: BetaSchedule::Linear,
            guidance_scale: w,
            loss_type,
        };
        DiffusionProcess::new(config, &Device::Cpu).unwrap()
    }

    fn t_tensor(indices: &[u32]) -> Tensor {
        Tensor::from_vec(indices.to_vec(), (indices.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn q_sample_with_zero_noise_scales_by_sqrt_cumprod() {
        let proc = process(0.0, LossType::L2);
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu).unwrap();
        let zero = x.zeros_like().unwrap();
        let t = t_tensor(&[0, 3]);
        let out = proc.q_sample(&x, &t, Some(&zero)).unwrap();
        let vals = out.to_vec2::<f32>().unwrap();
        let table = proc.schedule().table();
        let expect0 = table.sqrt_alphas_cumprod[0] as f32;
        let expect3 = table.sqrt_alphas_cumprod[3] as f32;
        assert!((vals[0][0] - expect0).abs() < 1e-6);
        assert!((vals[0][1] - 2.0 * expect0).abs() < 1e-6);
        assert!((vals[1][0] - 3.0 * expect3).abs() < 1e-6);
        assert!((vals[1][1] - 4.0 * expect3).abs() < 1e-6);
    }

    #[test]
    fn q_sample_rejects_mismatched_noise_shape() {
        let proc = process(0.0, LossType::L2);
        let x = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let bad = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = proc.q_sample(&x, &t_tensor(&[0, 1]), Some(&bad)).unwrap_err();
        assert!(matches!(err, DiffRecError::ShapeMismatch { .. }));
    }

    #[test]
    fn guidance_at_zero_reduces_to_conditional_output() {
        let proc = process(0.0, LossType::L2);
        let x = Tensor::from_vec(vec![0.5f32, -1.0, 2.0, 0.0], (2, 2), &Device::Cpu).unwrap();
        let h = Tensor::from_vec(vec![1.0f32, 1.0, -2.0, 3.0], (2, 2), &Device::Cpu).unwrap();
        let t = t_tensor(&[1, 1]);
        let guided = proc.guided_x_start(&StubDenoiser, &x, &h, &t, None).unwrap();
        let cond = StubDenoiser.denoise(&x, &h, &t, None).unwrap();
        assert_eq!(
            guided.to_vec2::<f32>().unwrap(),
            cond.to_vec2::<f32>().unwrap(),
            "w = 0 must reproduce the conditional prediction exactly"
        );
    }

    #[test]
    fn terminal_step_adds_no_noise() {
        let proc = process(2.0, LossType::L2);
        let x = Tensor::from_vec(vec![0.1f32, 0.2, 0.3, 0.4], (2, 2), &Device::Cpu).unwrap();
        let h = Tensor::from_vec(vec![1.0f32, -1.0, 0.5, 0.0], (2, 2), &Device::Cpu).unwrap();
        let t = t_tensor(&[0, 0]);
        let a = proc.p_sample(&StubDenoiser, &x, &h, &t, 0, None).unwrap();
        let b = proc.p_sample(&StubDenoiser, &x, &h, &t, 0, None).unwrap();
        assert_eq!(
            a.to_vec2::<f32>().unwrap(),
            b.to_vec2::<f32>().unwrap(),
            "t_index = 0 is deterministic: the posterior mean with no noise"
        );
    }

    #[test]
    fn non_terminal_step_is_stochastic() {
        let proc = process(2.0, LossType::L2);
        let x = Tensor::from_vec(vec![0.1f32, 0.2, 0.3, 0.4], (2, 2), &Device::Cpu).unwrap();
        let h = x.zeros_like().unwrap();
        let t = t_tensor(&[3, 3]);
        let a = proc.p_sample(&StubDenoiser, &x, &h, &t, 3, None).unwrap();
        let b = proc.p_sample(&StubDenoiser, &x, &h, &t, 3, None).unwrap();
        assert_ne!(
            a.to_vec2::<f32>().unwrap(),
            b.to_vec2::<f32>().unwrap(),
            "non-terminal steps add posterior noise"
        );
    }

    #[test]
    fn sample_runs_the_full_countdown_and_keeps_shape() {
        let proc = process(2.0, LossType::L2);
        let h = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let out = proc.sample(&StubDenoiser, &h, None).unwrap();
        assert_eq!(out.dims(), &[3, 4]);
    }

    #[test]
    fn p_losses_returns_scalar_loss_and_prediction() {
        let proc = process(0.0, LossType::L2);
        let x = Tensor::from_vec(vec![1.0f32, 0.0, -1.0, 0.5], (2, 2), &Device::Cpu).unwrap();
        let h = x.zeros_like().unwrap();
        let t = t_tensor(&[2, 4]);
        let zero = x.zeros_like().unwrap();
        let (loss, predicted) = proc
            .p_losses(&StubDenoiser, &x, &h, &t, None, Some(&zero))
            .unwrap();
        assert_eq!(loss.rank(), 0);
        assert_eq!(predicted.dims(), x.dims());
        assert!(loss.to_scalar::<f32>().unwrap() >= 0.0);
    }

    #[test]
    fn p_losses_rejects_mismatched_conditioning() {
        let proc = process(0.0, LossType::L2);
        let x = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let h = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = proc
            .p_losses(&StubDenoiser, &x, &h, &t_tensor(&[0, 1]), None, None)
            .unwrap_err();
        assert!(matches!(err, DiffRecError::ShapeMismatch { .. }));
    }

    #[test]
    fn loss_variants_agree_on_zero_error() {
        let x = Tensor::from_vec(vec![1.0f32, -2.0, 0.5, 3.0], (2, 2), &Device::Cpu).unwrap();
        for loss_type in [LossType::L1, LossType::L2, LossType::Huber] {
            let loss = reconstruction_loss(loss_type, &x, &x).unwrap();
            assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0, "{loss_type:?}");
        }
    }

    #[test]
    fn huber_matches_piecewise_definition() {
        let target = Tensor::from_vec(vec![0.0f32, 0.0], (1, 2), &Device::Cpu).unwrap();
        let predicted = Tensor::from_vec(vec![0.5f32, 3.0], (1, 2), &Device::Cpu).unwrap();
        let loss = reconstruction_loss(LossType::Huber, &target, &predicted).unwrap();
        // 0.5·0.5² = 0.125 and 3 − 0.5 = 2.5, mean = 1.3125
        assert!((loss.to_scalar::<f32>().unwrap() - 1.3125).abs() < 1e-6);
    }

    #[test]
    fn predict_noise_from_start_inverts_q_sample() {
        let proc = process(0.0, LossType::L2);
        let x0 = Tensor::from_vec(vec![1.0f32, -1.0, 0.5, 2.0], (2, 2), &Device::Cpu).unwrap();
        let noise = Tensor::from_vec(vec![0.3f32, -0.7, 1.1, 0.0], (2, 2), &Device::Cpu).unwrap();
        let t = t_tensor(&[2, 3]);
        let x_t = proc.q_sample(&x0, &t, Some(&noise)).unwrap();
        let recovered = proc.predict_noise_from_start(&x_t, &t, &x0).unwrap();
        let got = recovered.to_vec2::<f32>().unwrap();
        let want = noise.to_vec2::<f32>().unwrap();
        for (row_got, row_want) in got.iter().zip(want.iter()) {
            for (g, w) in row_got.iter().zip(row_want.iter()) {
                assert!((g - w).abs() < 1e-4, "recovered {g} vs injected {w}");
            }
        }
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = std::env::temp_dir().join("diffrec-core-snapshot-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("diffusion.json");
        let proc = process(2.0, LossType::Huber);
        proc.save(&path).unwrap();
        let reloaded = DiffusionProcess::load(&path, &Device::Cpu).unwrap();
        assert_eq!(reloaded.timesteps(), proc.timesteps());
        assert_eq!(reloaded.guidance_scale(), proc.guidance_scale());
        assert_eq!(
            reloaded.schedule().table().posterior_variance,
            proc.schedule().table().posterior_variance
        );
        std::fs::remove_file(&path).ok();
    }
}
