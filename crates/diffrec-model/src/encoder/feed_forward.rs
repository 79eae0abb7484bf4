//! Position-wise feed-forward refinement applied after self-attention.

use candle_core::Tensor;
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder};
use diffrec_core::DiffRecResult;

/// Two-layer position-wise feed-forward block with a residual connection.
#[derive(Debug)]
pub struct PositionwiseFeedForward {
    inner: Linear,
    outer: Linear,
    dropout: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(hidden_size: usize, dropout: f32, vb: VarBuilder) -> DiffRecResult<Self> {
        Ok(Self {
            inner: linear(hidden_size, hidden_size, vb.pp("inner"))?,
            outer: linear(hidden_size, hidden_size, vb.pp("outer"))?,
            dropout: Dropout::new(dropout),
        })
    }

    /// `(batch, seq_len, hidden)` in and out.
    pub fn forward(&self, x: &Tensor, train: bool) -> DiffRecResult<Tensor> {
        let refined = self.inner.forward(x)?.relu()?;
        let refined = self.dropout.forward(&refined, train)?;
        let refined = self.outer.forward(&refined)?;
        let refined = self.dropout.forward(&refined, train)?;
        Ok((refined + x)?)
    }
}
