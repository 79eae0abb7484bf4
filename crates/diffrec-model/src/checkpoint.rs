//! Checkpoint IO: two artifacts per snapshot.
//!
//! (a) model parameter state via `VarMap::save` (safetensors), and
//! (b) the diffusion process snapshot (schedule + config) as JSON.
//! The two load independently; the genre subsystem consumes the same pair
//! shape once, pre-training.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use diffrec_core::{DiffRecError, DiffRecResult, DiffusionProcess};

/// The artifact pair for one saved snapshot.
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    /// Safetensors file holding encoder/denoiser/decoder parameters.
    pub weights: PathBuf,
    /// JSON file holding the diffusion config and coefficient table.
    pub diffusion: PathBuf,
}

impl CheckpointPaths {
    /// Conventional layout inside a snapshot directory: `model-<tag>` and
    /// `diffusion-<tag>`.
    pub fn new(dir: impl AsRef<Path>, tag: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            weights: dir.join(format!("model-{tag}.safetensors")),
            diffusion: dir.join(format!("diffusion-{tag}.json")),
        }
    }
}

/// Write both artifacts.
pub fn save(
    varmap: &VarMap,
    process: &DiffusionProcess,
    paths: &CheckpointPaths,
) -> DiffRecResult<()> {
    varmap.save(&paths.weights).map_err(|e| {
        DiffRecError::checkpoint(format!(
            "failed to save weights to {}: {e}",
            paths.weights.display()
        ))
    })?;
    process.save(&paths.diffusion)?;
    tracing::info!(weights = %paths.weights.display(), "saved checkpoint pair");
    Ok(())
}

/// Load weights into an existing (already shaped) `VarMap`.
///
/// Shape disagreement between the file and the configured model is fatal.
pub fn load_weights(varmap: &mut VarMap, path: impl AsRef<Path>) -> DiffRecResult<()> {
    varmap.load(path.as_ref()).map_err(|e| {
        DiffRecError::checkpoint(format!(
            "failed to load weights from {}: {e}",
            path.as_ref().display()
        ))
    })
}
