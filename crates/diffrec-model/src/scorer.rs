//! Scoring a predicted embedding against the item catalog.
//!
//! Two interchangeable strategies: a trained decoder head producing logits
//! per catalog item, and a training-free cosine-similarity head against the
//! item embedding table. Top-K selection is a stable descending sort, so ties
//! keep catalog index order.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use diffrec_core::{DiffRecResult, DiffuserDepth, ModelConfig};

/// Feed-forward decoder mapping a predicted embedding to per-item logits.
///
/// Depth follows the diffuser variant: the shallow diffuser pairs with the
/// three-layer decoder, the deep one with the five-layer stack.
#[derive(Debug)]
pub struct DecoderHead {
    layers: Vec<Linear>,
}

impl DecoderHead {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> DiffRecResult<Self> {
        let d = config.hidden_size;
        let n = config.item_num;
        let dims: Vec<(usize, usize)> = match config.diffuser_depth {
            DiffuserDepth::Mlp1 => vec![(d, d * 4), (d * 4, d), (d, n)],
            DiffuserDepth::Mlp2 => {
                vec![(d, d * 2), (d * 2, d * 4), (d * 4, d * 2), (d * 2, d), (d, n)]
            }
        };
        let layers = dims
            .iter()
            .enumerate()
            .map(|(i, (input, output))| linear(*input, *output, vb.pp(format!("fc{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// `(batch, D)` -> `(batch, item_num)` logits. ReLU between layers, raw
    /// logits at the end.
    pub fn forward(&self, predicted: &Tensor) -> DiffRecResult<Tensor> {
        let mut x = predicted.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i != last {
                x = x.relu()?;
            }
        }
        Ok(x)
    }
}

/// Cosine-similarity scores of `predicted` `(batch, D)` against the first
/// `item_num` rows of the embedding table (the sentinel row is excluded).
pub fn similarity_scores(
    predicted: &Tensor,
    item_table: &Tensor,
    item_num: usize,
) -> DiffRecResult<Tensor> {
    let catalog = item_table.narrow(0, 0, item_num)?;
    let predicted = l2_normalize(predicted)?;
    let catalog = l2_normalize(&catalog)?;
    Ok(predicted.matmul(&catalog.t()?.contiguous()?)?)
}

fn l2_normalize(x: &Tensor) -> DiffRecResult<Tensor> {
    let norm = x
        .sqr()?
        .sum_keepdim(candle_core::D::Minus1)?
        .sqrt()?;
    Ok(x.broadcast_div(&norm)?)
}

/// Indices of the `k` highest scores, descending; ties resolve to the lower
/// catalog index (stable sort).
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|a, b| {
        scores[*b]
            .partial_cmp(&scores[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    indices.truncate(k);
    indices
}

/// Row-wise [`top_k`] over a `(batch, item_num)` score tensor.
pub fn top_k_batch(scores: &Tensor, k: usize) -> DiffRecResult<Vec<Vec<usize>>> {
    let rows = scores.to_vec2::<f32>()?;
    Ok(rows.iter().map(|row| top_k(row, k)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn top_k_orders_descending() {
        let scores = [0.9f32, 0.1, 0.95, 0.2];
        assert_eq!(top_k(&scores, 2), vec![2, 0]);
        assert_eq!(top_k(&scores, 4), vec![2, 0, 3, 1]);
    }

    #[test]
    fn top_k_breaks_ties_by_catalog_order() {
        let scores = [0.5f32, 0.9, 0.9, 0.5];
        assert_eq!(top_k(&scores, 4), vec![1, 2, 0, 3]);
    }

    #[test]
    fn top_k_handles_short_catalogs() {
        assert_eq!(top_k(&[0.3f32], 5), vec![0]);
    }

    #[test]
    fn similarity_scores_are_cosine() {
        let device = Device::Cpu;
        // Catalog: e0, e1, and a sentinel row that must be excluded.
        let table = Tensor::from_vec(
            vec![2.0f32, 0.0, 0.0, 3.0, 9.0, 9.0],
            (3, 2),
            &device,
        )
        .unwrap();
        let predicted = Tensor::from_vec(vec![1.0f32, 0.0], (1, 2), &device).unwrap();
        let scores = similarity_scores(&predicted, &table, 2).unwrap();
        assert_eq!(scores.dims(), &[1, 2]);
        let row = scores.to_vec2::<f32>().unwrap().remove(0);
        assert!((row[0] - 1.0).abs() < 1e-6, "aligned unit vectors score 1");
        assert!(row[1].abs() < 1e-6, "orthogonal vectors score 0");
    }

    #[test]
    fn decoder_head_produces_catalog_logits() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        for depth in [DiffuserDepth::Mlp1, DiffuserDepth::Mlp2] {
            let config = ModelConfig {
                hidden_size: 8,
                item_num: 11,
                diffuser_depth: depth,
                ..Default::default()
            };
            let head = DecoderHead::new(&config, vb.pp(format!("decoder_{depth:?}"))).unwrap();
            let x = Tensor::zeros((3, 8), DType::F32, &device).unwrap();
            let logits = head.forward(&x).unwrap();
            assert_eq!(logits.dims(), &[3, 11]);
        }
    }
}
