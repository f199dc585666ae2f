//! Crash-safe artifact writes.
//!
//! Every run artifact (`config.json`, `run_info.json`, result tables, checkpoint
//! files and their manifest) is rewritten in full: the payload goes to a `.tmp`
//! sibling, is flushed to disk, and is then renamed over the target. A crash at
//! any point leaves either the previous file or the new one, never a torn write.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Serialize `data` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    write_atomic(path, &json)
}

/// Atomically replace `path` with `data`, creating parent directories as needed.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON, returning `Ok(None)` when the file does not exist.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    let value =
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
