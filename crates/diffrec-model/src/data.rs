//! Batch contract with the dataset collaborator.
//!
//! Each row carries a padded item sequence with its true length and next-item
//! target, plus the parallel genre fields over the secondary vocabulary.
//! Validation happens here, once per batch, so the encoder can assume
//! well-formed input.

use candle_core::{Device, Tensor};
use diffrec_core::{DiffRecError, DiffRecResult, ModelConfig};

/// One dataset row, host-side.
#[derive(Debug, Clone)]
pub struct InteractionRow {
    /// Item ids padded with the sentinel (= item_num) to the fixed capacity.
    pub seq: Vec<u32>,
    /// Count of real entries in `seq`.
    pub len_seq: usize,
    /// Next-item target id.
    pub next: u32,
    /// Genre ids padded with the genre sentinel.
    pub genre_seq: Vec<u32>,
    /// Count of real entries in `genre_seq`.
    pub genre_len_seq: usize,
    /// Next-genre target id.
    pub genre_next: u32,
}

/// A batch of rows moved to the compute device as u32 tensors.
pub struct InteractionBatch {
    /// `(batch, state_size)` item ids.
    pub states: Tensor,
    /// True sequence lengths, host-side for per-example gathers.
    pub lengths: Vec<usize>,
    /// `(batch,)` target item ids.
    pub targets: Tensor,
    /// Host copy of targets for metric bookkeeping.
    pub target_ids: Vec<u32>,
    /// `(batch, genre_state_size)` genre ids.
    pub genre_states: Tensor,
    pub genre_lengths: Vec<usize>,
    /// `(batch,)` target genre ids.
    pub genre_targets: Tensor,
}

impl InteractionBatch {
    /// Validate rows against both vocabularies and move them to `device`.
    pub fn from_rows(
        rows: &[InteractionRow],
        item_config: &ModelConfig,
        genre_config: &ModelConfig,
        device: &Device,
    ) -> DiffRecResult<Self> {
        if rows.is_empty() {
            return Err(DiffRecError::config("batch must contain at least one row"));
        }
        let batch = rows.len();

        let mut states = Vec::with_capacity(batch * item_config.state_size);
        let mut lengths = Vec::with_capacity(batch);
        let mut target_ids = Vec::with_capacity(batch);
        let mut genre_states = Vec::with_capacity(batch * genre_config.state_size);
        let mut genre_lengths = Vec::with_capacity(batch);
        let mut genre_target_ids = Vec::with_capacity(batch);

        for (i, row) in rows.iter().enumerate() {
            validate_side(
                i,
                "item",
                &row.seq,
                row.len_seq,
                row.next,
                item_config,
            )?;
            validate_side(
                i,
                "genre",
                &row.genre_seq,
                row.genre_len_seq,
                row.genre_next,
                genre_config,
            )?;
            states.extend_from_slice(&row.seq);
            lengths.push(row.len_seq);
            target_ids.push(row.next);
            genre_states.extend_from_slice(&row.genre_seq);
            genre_lengths.push(row.genre_len_seq);
            genre_target_ids.push(row.genre_next);
        }

        Ok(Self {
            states: Tensor::from_vec(states, (batch, item_config.state_size), device)?,
            lengths,
            targets: Tensor::from_vec(target_ids.clone(), (batch,), device)?,
            target_ids,
            genre_states: Tensor::from_vec(
                genre_states,
                (batch, genre_config.state_size),
                device,
            )?,
            genre_lengths,
            genre_targets: Tensor::from_vec(genre_target_ids, (batch,), device)?,
        })
    }

    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

fn validate_side(
    row: usize,
    side: &str,
    seq: &[u32],
    len_seq: usize,
    target: u32,
    config: &ModelConfig,
) -> DiffRecResult<()> {
    if seq.len() != config.state_size {
        return Err(DiffRecError::config(format!(
            "row {row}: {side} sequence has {} entries, capacity is {}",
            seq.len(),
            config.state_size
        )));
    }
    if len_seq == 0 || len_seq > config.state_size {
        return Err(DiffRecError::config(format!(
            "row {row}: {side} len_seq = {len_seq} outside 1..={}",
            config.state_size
        )));
    }
    // Ids may include the padding sentinel (== item_num); targets may not.
    if let Some(bad) = seq.iter().find(|id| **id > config.item_num as u32) {
        return Err(DiffRecError::config(format!(
            "row {row}: {side} id {bad} exceeds sentinel {}",
            config.item_num
        )));
    }
    if target >= config.item_num as u32 {
        return Err(DiffRecError::config(format!(
            "row {row}: {side} target {target} outside the catalog of {}",
            config.item_num
        )));
    }
    Ok(())
}
