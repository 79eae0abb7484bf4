//! Hit-rate and NDCG accumulators for ranked top-K lists.
//!
//! Ranking failures are soft per batch: the failure is logged and that
//! batch's metrics are skipped. This relaxed policy applies only here, never
//! to training-loss computation.

use diffrec_core::DiffRecResult;

/// HR@K / NDCG@K accumulators over a configurable list of cutoffs.
#[derive(Debug, Clone)]
pub struct RankingMetrics {
    ks: Vec<usize>,
    hits: Vec<f64>,
    ndcgs: Vec<f64>,
    examples: f64,
}

impl RankingMetrics {
    /// Standard cutoffs 5 / 10 / 20.
    pub fn standard() -> Self {
        Self::new(vec![5, 10, 20])
    }

    pub fn new(ks: Vec<usize>) -> Self {
        let n = ks.len();
        Self { ks, hits: vec![0.0; n], ndcgs: vec![0.0; n], examples: 0.0 }
    }

    /// Largest configured cutoff; rank at least this many items per example.
    pub fn max_k(&self) -> usize {
        self.ks.iter().copied().max().unwrap_or(0)
    }

    /// Accumulate one batch of ranked lists against ground-truth targets.
    pub fn accumulate(&mut self, ranked: &[Vec<usize>], targets: &[u32]) {
        for (list, target) in ranked.iter().zip(targets.iter()) {
            let position = list.iter().position(|item| *item == *target as usize);
            for (slot, k) in self.ks.iter().enumerate() {
                if let Some(pos) = position {
                    if pos < *k {
                        self.hits[slot] += 1.0;
                        self.ndcgs[slot] += 1.0 / ((pos + 2) as f64).log2();
                    }
                }
            }
            self.examples += 1.0;
        }
    }

    /// Accumulate a batch, or log and skip it if ranking failed.
    pub fn accumulate_checked(
        &mut self,
        ranking: DiffRecResult<Vec<Vec<usize>>>,
        targets: &[u32],
    ) {
        match ranking {
            Ok(ranked) => self.accumulate(&ranked, targets),
            Err(error) => {
                tracing::warn!(%error, "ranking failed for batch, skipping metric accumulation");
            }
        }
    }

    /// HR@k, or `None` for an unconfigured cutoff or empty accumulator.
    pub fn hit_rate(&self, k: usize) -> Option<f64> {
        let slot = self.ks.iter().position(|c| *c == k)?;
        (self.examples > 0.0).then(|| self.hits[slot] / self.examples)
    }

    /// NDCG@k, or `None` for an unconfigured cutoff or empty accumulator.
    pub fn ndcg(&self, k: usize) -> Option<f64> {
        let slot = self.ks.iter().position(|c| *c == k)?;
        (self.examples > 0.0).then(|| self.ndcgs[slot] / self.examples)
    }

    /// Number of examples accumulated so far.
    pub fn examples(&self) -> usize {
        self.examples as usize
    }

    /// Emit all configured metrics at info level.
    pub fn report(&self) {
        for k in &self.ks {
            tracing::info!(
                k,
                hit_rate = self.hit_rate(*k).unwrap_or(0.0),
                ndcg = self.ndcg(*k).unwrap_or(0.0),
                "ranking metrics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffrec_core::DiffRecError;

    #[test]
    fn hit_and_ndcg_arithmetic() {
        let mut metrics = RankingMetrics::new(vec![1, 3]);
        // Target 7 ranked second, target 2 missing entirely.
        metrics.accumulate(&[vec![4, 7, 9], vec![0, 1, 3]], &[7, 2]);
        assert_eq!(metrics.examples(), 2);
        assert_eq!(metrics.hit_rate(1), Some(0.0));
        assert_eq!(metrics.hit_rate(3), Some(0.5));
        let expected_ndcg = (1.0 / 3f64.log2()) / 2.0;
        assert!((metrics.ndcg(3).unwrap() - expected_ndcg).abs() < 1e-12);
    }

    #[test]
    fn top_ranked_target_scores_full_ndcg() {
        let mut metrics = RankingMetrics::new(vec![5]);
        metrics.accumulate(&[vec![3, 1, 2]], &[3]);
        assert_eq!(metrics.hit_rate(5), Some(1.0));
        assert!((metrics.ndcg(5).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn failed_batches_are_skipped_not_fatal() {
        let mut metrics = RankingMetrics::standard();
        metrics.accumulate_checked(
            Err(DiffRecError::config("synthetic ranking failure")),
            &[1, 2, 3],
        );
        assert_eq!(metrics.examples(), 0);
        metrics.accumulate_checked(Ok(vec![vec![1, 0]]), &[1]);
        assert_eq!(metrics.examples(), 1);
        assert_eq!(metrics.hit_rate(5), Some(1.0));
    }

    #[test]
    fn unconfigured_cutoff_yields_none() {
        let metrics = RankingMetrics::standard();
        assert_eq!(metrics.hit_rate(7), None);
    }
}
