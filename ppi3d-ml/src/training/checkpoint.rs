//! Checkpoint files and their manifest.

use crate::error::PpiError;
use crate::model::Model;
use crate::persistence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "checkpoints.json";

/// Reference to a persisted parameter snapshot (the checkpoint file path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointRef(PathBuf);

impl CheckpointRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// The same checkpoint file looked up in `dir` instead, for run
    /// directories that were moved after training.
    pub fn relocate(&self, dir: &Path) -> Option<Self> {
        self.0.file_name().map(|name| Self(dir.join(name)))
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub epoch: usize,
    pub val_loss: f64,
    /// File name inside the checkpoint directory.
    pub file: String,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Saves `model-ckpt-<epoch>.json` files into one directory and keeps a
/// SHA-256 manifest of them.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("model-ckpt-{epoch}.json"))
    }

    /// Manifest entries, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>, PpiError> {
        read_manifest(&self.dir)
    }

    /// Persist `model` as the checkpoint of `epoch`, replacing any earlier
    /// checkpoint of the same epoch.
    pub fn save(
        &self,
        model: &dyn Model,
        epoch: usize,
        val_loss: f64,
    ) -> Result<CheckpointRef, PpiError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(epoch);
        model.save(&path)?;

        let bytes = std::fs::read(&path)?;
        let entry = CheckpointEntry {
            epoch,
            val_loss,
            file: format!("model-ckpt-{epoch}.json"),
            hash: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut entries = self.list()?;
        entries.retain(|e| e.epoch != epoch);
        entries.push(entry);
        persistence::write_json_atomic(&self.dir.join(MANIFEST_FILE), &entries)?;

        tracing::debug!(epoch, path = %path.display(), "Checkpoint saved");
        Ok(CheckpointRef::new(path))
    }
}

/// Load `reference` into `model` after checking it against the manifest of
/// its directory.
pub fn restore(model: &mut dyn Model, reference: &CheckpointRef) -> Result<(), PpiError> {
    let path = reference.path();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let entries = read_manifest(dir)
        .map_err(|e| PpiError::checkpoint_restore(format!("manifest in {}: {e}", dir.display())))?;
    let entry = entries.iter().rev().find(|e| e.file == file).ok_or_else(|| {
        PpiError::checkpoint_restore(format!(
            "checkpoint {reference} is not listed in {}",
            dir.join(MANIFEST_FILE).display()
        ))
    })?;

    let bytes = std::fs::read(path)
        .map_err(|e| PpiError::checkpoint_restore(format!("cannot read {reference}: {e}")))?;
    let actual = sha256_hex(&bytes);
    if actual != entry.hash {
        return Err(PpiError::checkpoint_restore(format!(
            "checkpoint {reference} is corrupt (sha256 {actual}, expected {})",
            entry.hash
        )));
    }

    model
        .restore(path)
        .map_err(|e| PpiError::checkpoint_restore(format!("{reference}: {e}")))?;
    tracing::info!(checkpoint = %reference, epoch = entry.epoch, "Restored checkpoint");
    Ok(())
}

fn read_manifest(dir: &Path) -> Result<Vec<CheckpointEntry>, PpiError> {
    Ok(persistence::read_json(&dir.join(MANIFEST_FILE))?.unwrap_or_default())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
