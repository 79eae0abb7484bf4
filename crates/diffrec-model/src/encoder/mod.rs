//! Sequence encoder: padded interaction history -> conditioning vector h.
//!
//! Items are embedded, augmented with learned absolute-position embeddings,
//! masked at padding positions, refined by self-attention and a feed-forward
//! block, and the hidden state at the last real position is extracted per
//! example. During training the extracted vector is replaced by the learned
//! null embedding with probability `p` (classifier-free guidance dropout).

mod attention;
mod feed_forward;


pub use attention::MultiHeadAttention;
pub use feed_forward::PositionwiseFeedForward;

use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, layer_norm, Dropout, Embedding, LayerNorm, Module, VarBuilder};
use diffrec_core::{DiffRecError, DiffRecResult, ModelConfig};

/// Masked self-attentive encoder over fixed-capacity item sequences.
///
/// Owns the item embedding table (catalog + padding sentinel row), the
/// positional table, and the null embedding shared with the denoiser.
#[derive(Debug)]
pub struct SequenceEncoder {
    item_embeddings: Embedding,
    positional_embeddings: Embedding,
    null_embedding: Embedding,
    emb_dropout: Dropout,
    ln_1: LayerNorm,
    ln_2: LayerNorm,
    ln_3: LayerNorm,
    attention: MultiHeadAttention,
    feed_forward: PositionwiseFeedForward,
    item_num: usize,
    state_size: usize,
    hidden_size: usize,
    device: Device,
}

impl SequenceEncoder {
    /// Build all learned tables and sub-layers under `vb`'s prefix.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> DiffRecResult<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        Ok(Self {
            // item_num + 1 rows: the last row is the padding sentinel.
            item_embeddings: embedding(config.item_num + 1, hidden, vb.pp("item_embeddings"))?,
            positional_embeddings: embedding(
                config.state_size,
                hidden,
                vb.pp("positional_embeddings"),
            )?,
            null_embedding: embedding(1, hidden, vb.pp("null_embedding"))?,
            emb_dropout: Dropout::new(config.dropout),
            ln_1: layer_norm(hidden, candle_nn::LayerNormConfig::default(), vb.pp("ln_1"))?,
            ln_2: layer_norm(hidden, candle_nn::LayerNormConfig::default(), vb.pp("ln_2"))?,
            ln_3: layer_norm(hidden, candle_nn::LayerNormConfig::default(), vb.pp("ln_3"))?,
            attention: MultiHeadAttention::new(
                hidden,
                config.num_heads,
                config.dropout,
                vb.pp("attention"),
            )?,
            feed_forward: PositionwiseFeedForward::new(
                hidden,
                config.dropout,
                vb.pp("feed_forward"),
            )?,
            item_num: config.item_num,
            state_size: config.state_size,
            hidden_size: hidden,
            device: vb.device().clone(),
        })
    }

    /// Embedding lookup for target items: `(batch,)` ids -> `(batch, D)`.
    pub fn embed_items(&self, ids: &Tensor) -> DiffRecResult<Tensor> {
        Ok(self.item_embeddings.forward(ids)?)
    }

    /// Full item embedding table, `(item_num + 1, D)`; the last row is the
    /// padding sentinel.
    pub fn item_table(&self) -> &Tensor {
        self.item_embeddings.embeddings()
    }

    /// The learned "no conditioning" vector, `(1, D)`.
    pub fn null_embedding(&self) -> &Tensor {
        self.null_embedding.embeddings()
    }

    /// Hidden dimension D.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Padding sentinel id (equals the catalog size).
    pub fn padding_id(&self) -> usize {
        self.item_num
    }

    /// Encode a batch of padded sequences into conditioning vectors h.
    ///
    /// `states` is `(batch, state_size)` of u32 ids, `len_states` the count of
    /// real entries per row (each in `1..=state_size`). With probability `p`
    /// per example the extracted vector is replaced by the null embedding;
    /// pass `p = 0.0` for deterministic inference encoding.
    pub fn encode(
        &self,
        states: &Tensor,
        len_states: &[usize],
        p: f32,
        train: bool,
    ) -> DiffRecResult<Tensor> {
        let (batch, seq_len) = states.dims2()?;
        if seq_len != self.state_size {
            return Err(DiffRecError::ShapeMismatch {
                expected: format!("states with sequence capacity {}", self.state_size),
                actual: format!("{:?}", states.dims()),
            });
        }
        if len_states.len() != batch {
            return Err(DiffRecError::ShapeMismatch {
                expected: format!("{batch} sequence lengths"),
                actual: format!("{}", len_states.len()),
            });
        }
        for (i, len) in len_states.iter().enumerate() {
            if *len == 0 || *len > self.state_size {
                return Err(DiffRecError::config(format!(
                    "len_states[{i}] = {len} outside 1..={}",
                    self.state_size
                )));
            }
        }

        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let inputs = self
            .item_embeddings
            .forward(states)?
            .broadcast_add(&self.positional_embeddings.forward(&positions)?)?;
        let seq = self.emb_dropout.forward(&inputs, train)?;

        // Zero out padding positions before and after the attention block so
        // padding content can never leak into the extracted state. The mask
        // is length-based: everything at or beyond len_states is padding,
        // whatever id it carries.
        let mask = self.padding_mask(len_states, seq_len)?;
        let seq = seq.broadcast_mul(&mask)?;

        let normalized = self.ln_1.forward(&seq)?;
        let attended = self.attention.forward(&normalized, &seq, train)?;
        let refined = self
            .feed_forward
            .forward(&self.ln_2.forward(&attended)?, train)?;
        let refined = refined.broadcast_mul(&mask)?;
        let hidden = self.ln_3.forward(&refined)?;

        let h = self.extract_last_valid(&hidden, len_states)?;
        self.conditioning_dropout(h, p)
    }

    /// Binary `(batch, seq_len, 1)` mask: 1 at real positions, 0 at padding.
    fn padding_mask(&self, len_states: &[usize], seq_len: usize) -> DiffRecResult<Tensor> {
        let mut mask = Vec::with_capacity(len_states.len() * seq_len);
        for len in len_states {
            for position in 0..seq_len {
                mask.push(if position < *len { 1f32 } else { 0f32 });
            }
        }
        Ok(Tensor::from_vec(mask, (len_states.len(), seq_len, 1), &self.device)?)
    }

    /// Gather the hidden vector at position `len - 1` for each example.
    fn extract_last_valid(&self, hidden: &Tensor, len_states: &[usize]) -> DiffRecResult<Tensor> {
        let batch = len_states.len();
        let index: Vec<u32> = len_states.iter().map(|len| (len - 1) as u32).collect();
        let index = Tensor::from_vec(index, (batch, 1, 1), &self.device)?
            .broadcast_as((batch, 1, self.hidden_size))?
            .contiguous()?;
        Ok(hidden.gather(&index, 1)?.squeeze(1)?)
    }

    /// Per-example Bernoulli substitution of the null embedding.
    ///
    /// Draws u ~ U[0, 1) per example and keeps the real vector iff u >= p, so
    /// p = 0 always keeps and p = 1 always substitutes.
    fn conditioning_dropout(&self, h: Tensor, p: f32) -> DiffRecResult<Tensor> {
        if p <= 0.0 {
            return Ok(h);
        }
        let batch = h.dim(0)?;
        let u = Tensor::rand(0f32, 1f32, (batch, 1), &self.device)?;
        let keep = u.ge(p)?.to_dtype(DType::F32)?;
        let substitute = keep.affine(-1.0, 1.0)?;
        let null = self
            .null_embedding
            .embeddings()
            .broadcast_as((batch, self.hidden_size))?;
        Ok((h.broadcast_mul(&keep)? + null.broadcast_mul(&substitute)?)?)
    }
}
