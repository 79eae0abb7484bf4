//! Denoiser network: (noisy embedding, conditioning, timestep[, aux]) ->
//! predicted clean embedding.
//!
//! The timestep enters through a sinusoidal embedding refined by a small MLP;
//! all inputs are concatenated and passed through the "diffuser" MLP. The
//! unconditional path substitutes the learned null embedding for h, which is
//! shared with the sequence encoder. Both paths are deterministic for fixed
//! weights.

use candle_core::{DType, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use diffrec_core::{Denoiser, DiffRecError, DiffRecResult, DiffuserDepth, ModelConfig};

/// The diffuser MLP, at one of the two configured depths.
#[derive(Debug)]
enum DiffuserMlp {
    /// Single linear layer over the concatenated inputs.
    Mlp1(Linear),
    /// Linear -> GELU -> Linear.
    Mlp2(Linear, Linear),
}

impl DiffuserMlp {
    fn forward(&self, x: &Tensor) -> DiffRecResult<Tensor> {
        match self {
            Self::Mlp1(fc) => Ok(fc.forward(x)?),
            Self::Mlp2(fc1, fc2) => Ok(fc2.forward(&fc1.forward(x)?.gelu()?)?),
        }
    }
}

/// Sinusoidal timestep embedding: log-10000 frequency ladder, sin/cos halves.
fn sinusoidal_embedding(t: &Tensor, dim: usize) -> DiffRecResult<Tensor> {
    let half = dim / 2;
    let device = t.device();
    let scale = (10000f64).ln() / (half.saturating_sub(1).max(1)) as f64;
    let freqs = Tensor::arange(0u32, half as u32, device)?
        .to_dtype(DType::F32)?
        .affine(-scale, 0.0)?
        .exp()?;
    let args = t
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    Ok(Tensor::cat(&[&args.sin()?, &args.cos()?], 1)?)
}

/// Predicts the clean target embedding from a corrupted one.
///
/// Built with or without the secondary-conditioning slot (`with_aux`); the
/// slot widens the diffuser input from 3·D to 4·D. The same weights serve the
/// conditional and unconditional forms via the shared null embedding.
#[derive(Debug)]
pub struct DenoiserNetwork {
    step_fc1: Linear,
    step_fc2: Linear,
    diffuser: DiffuserMlp,
    null_embedding: Tensor,
    hidden_size: usize,
    with_aux: bool,
}

impl DenoiserNetwork {
    /// `null_embedding` is the encoder's `(1, D)` learned null vector; the
    /// handle shares storage so gradient updates stay coupled.
    pub fn new(
        config: &ModelConfig,
        null_embedding: Tensor,
        vb: VarBuilder,
    ) -> DiffRecResult<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        if null_embedding.dims() != [1, hidden] {
            return Err(DiffRecError::ShapeMismatch {
                expected: format!("null embedding of shape [1, {hidden}]"),
                actual: format!("{:?}", null_embedding.dims()),
            });
        }
        let slots = if config.with_aux { 4 } else { 3 };
        let diffuser = match config.diffuser_depth {
            DiffuserDepth::Mlp1 => {
                DiffuserMlp::Mlp1(linear(hidden * slots, hidden, vb.pp("diffuser.fc"))?)
            }
            DiffuserDepth::Mlp2 => DiffuserMlp::Mlp2(
                linear(hidden * slots, hidden * 2, vb.pp("diffuser.fc1"))?,
                linear(hidden * 2, hidden, vb.pp("diffuser.fc2"))?,
            ),
        };
        Ok(Self {
            step_fc1: linear(hidden, hidden * 2, vb.pp("step_mlp.fc1"))?,
            step_fc2: linear(hidden * 2, hidden, vb.pp("step_mlp.fc2"))?,
            diffuser,
            null_embedding,
            hidden_size: hidden,
            with_aux: config.with_aux,
        })
    }

    /// Timestep indices `(batch,)` -> refined embedding `(batch, D)`.
    fn step_embedding(&self, t: &Tensor) -> DiffRecResult<Tensor> {
        let sinusoid = sinusoidal_embedding(t, self.hidden_size)?;
        Ok(self
            .step_fc2
            .forward(&self.step_fc1.forward(&sinusoid)?.gelu()?)?)
    }

    /// Validate the aux slot against the configured width.
    fn check_aux(&self, aux: Option<&Tensor>) -> DiffRecResult<()> {
        match (self.with_aux, aux) {
            (true, None) => Err(DiffRecError::config(
                "denoiser was built with a secondary conditioning slot but none was provided",
            )),
            (false, Some(_)) => Err(DiffRecError::config(
                "denoiser was built without a secondary conditioning slot",
            )),
            _ => Ok(()),
        }
    }

    fn run(&self, parts: Vec<&Tensor>) -> DiffRecResult<Tensor> {
        let joined = Tensor::cat(&parts, 1)?;
        self.diffuser.forward(&joined)
    }
}

impl Denoiser for DenoiserNetwork {
    fn denoise(
        &self,
        x_noisy: &Tensor,
        h: &Tensor,
        t: &Tensor,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        self.check_aux(aux)?;
        let step = self.step_embedding(t)?;
        let mut parts = vec![x_noisy, h, &step];
        if let Some(a) = aux {
            parts.push(a);
        }
        self.run(parts)
    }

    fn denoise_uncond(
        &self,
        x_noisy: &Tensor,
        t: &Tensor,
        aux: Option<&Tensor>,
    ) -> DiffRecResult<Tensor> {
        self.check_aux(aux)?;
        let batch = x_noisy.dim(0)?;
        let null = self
            .null_embedding
            .broadcast_as((batch, self.hidden_size))?
            .contiguous()?;
        let step = self.step_embedding(t)?;
        let mut parts = vec![x_noisy, &null, &step];
        if let Some(a) = aux {
            parts.push(a);
        }
        self.run(parts)
    }
}
