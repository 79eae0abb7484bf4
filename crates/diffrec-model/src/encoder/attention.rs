//! Multi-head self-attention over interaction sequences.
//!
//! Queries come from the pre-normalized sequence, keys and values from the
//! masked raw sequence. Padding positions carry zeroed inputs, so their value
//! contributions are input-independent and the extracted hidden state never
//! depends on padding content.

use candle_core::Tensor;
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder};
use diffrec_core::DiffRecResult;

/// Scaled dot-product multi-head attention with learned Q/K/V/output
/// projections.
#[derive(Debug)]
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> DiffRecResult<Self> {
        Ok(Self {
            query: linear(hidden_size, hidden_size, vb.pp("query"))?,
            key: linear(hidden_size, hidden_size, vb.pp("key"))?,
            value: linear(hidden_size, hidden_size, vb.pp("value"))?,
            output: linear(hidden_size, hidden_size, vb.pp("output"))?,
            dropout: Dropout::new(dropout),
            num_heads,
            head_dim: hidden_size / num_heads,
        })
    }

    /// Attend `queries` over `keys` (values are projected from `keys`).
    ///
    /// Both inputs are `(batch, seq_len, hidden)`.
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        train: bool,
    ) -> DiffRecResult<Tensor> {
        let (batch, seq_len, hidden) = queries.dims3()?;

        let q = self.split_heads(&self.query.forward(queries)?, batch, seq_len)?;
        let k = self.split_heads(&self.key.forward(keys)?, batch, seq_len)?;
        let v = self.split_heads(&self.value.forward(keys)?, batch, seq_len)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .affine(scale, 0.0)?;
        let probs = candle_nn::ops::softmax(&scores, candle_core::D::Minus1)?;
        let probs = self.dropout.forward(&probs, train)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden))?;
        Ok(self.output.forward(&context)?)
    }

    /// `(batch, seq, hidden)` -> `(batch, heads, seq, head_dim)`, contiguous.
    fn split_heads(&self, t: &Tensor, batch: usize, seq_len: usize) -> DiffRecResult<Tensor> {
        Ok(t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}
