//! The persisted `run_info.json` record.

use crate::error::PpiError;
use crate::persistence;
use crate::training::checkpoint::CheckpointRef;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const RUN_INFO_FILE: &str = "run_info.json";

/// Run metadata: validation loss per epoch and the checkpoint to test with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub val_losses: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_best_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ckpt: Option<CheckpointRef>,
}

impl RunInfo {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(RUN_INFO_FILE)
    }

    /// Read the record of a finished run. Missing or unreadable files are
    /// restore failures.
    pub fn load(dir: &Path) -> Result<Self, PpiError> {
        let path = Self::path(dir);
        match persistence::read_json(&path) {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(PpiError::checkpoint_restore(format!(
                "{} does not exist",
                path.display()
            ))),
            Err(e) => Err(PpiError::checkpoint_restore(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// The checkpoint recorded for testing.
    pub fn best_checkpoint(&self) -> Result<&CheckpointRef, PpiError> {
        self.best_ckpt
            .as_ref()
            .ok_or_else(|| PpiError::checkpoint_restore("run_info.json has no best_ckpt"))
    }
}

/// Single writer of a run's `run_info.json`; every update rewrites the whole
/// file atomically.
pub struct RunInfoWriter {
    path: PathBuf,
    info: RunInfo,
}

impl RunInfoWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: RunInfo::path(dir),
            info: RunInfo::default(),
        }
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// Append an epoch's validation loss. JSON has no encoding for NaN or
    /// infinity, so a non-finite loss is a model error and nothing is written.
    pub fn push_val_loss(&mut self, loss: f64) -> Result<(), PpiError> {
        ensure_finite(loss)?;
        self.info.val_losses.push(loss);
        self.flush()
    }

    /// Record a new best checkpoint and its loss in one rewrite.
    pub fn record_best(&mut self, loss: f64, checkpoint: CheckpointRef) -> Result<(), PpiError> {
        ensure_finite(loss)?;
        self.info.val_best_loss = Some(loss);
        self.info.best_ckpt = Some(checkpoint);
        self.flush()
    }

    /// Point `best_ckpt` at the terminal checkpoint.
    pub fn record_terminal(&mut self, checkpoint: CheckpointRef) -> Result<(), PpiError> {
        self.info.best_ckpt = Some(checkpoint);
        self.flush()
    }

    fn flush(&self) -> Result<(), PpiError> {
        persistence::write_json_atomic(&self.path, &self.info)?;
        Ok(())
    }
}

fn ensure_finite(loss: f64) -> Result<(), PpiError> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(PpiError::model(format!("validation loss diverged to {loss}")))
    }
}
