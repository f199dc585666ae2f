//! Sharded ensemble store.
//!
//! A store path either names a single JSON-lines file or uses the
//! `<prefix>@<num_shards>` notation, which resolves to the files
//! `<prefix>_0.jsonl` .. `<prefix>_<num_shards - 1>.jsonl`. Each line holds one
//! keyed [`EnsembleRecord`]. Loading only indexes record offsets; records are
//! parsed on demand.

use crate::data::example::Label;
use crate::error::PpiError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One candidate residue pair of an ensemble with its voxelized environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub res0: String,
    pub res1: String,
    pub label: Label,
    /// Flattened `[2, D, D, D, C]` grid pair.
    pub grids: Vec<f32>,
}

/// A protein complex and all of its candidate regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleRecord {
    pub ensemble: String,
    pub regions: Vec<RegionRecord>,
}

/// Position of a record inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub shard: usize,
    offset: u64,
}

/// Handle to an indexed sharded store.
#[derive(Debug, Clone)]
pub struct ShardedDataset {
    path: PathBuf,
    shards: Vec<PathBuf>,
    index: Vec<RecordLocation>,
}

impl ShardedDataset {
    /// Open a store and index every record.
    pub fn load(path: &Path) -> Result<Self, PpiError> {
        let shards = resolve_shards(path)?;
        let mut index = Vec::new();

        for (shard, shard_path) in shards.iter().enumerate() {
            let file = File::open(shard_path).map_err(|e| {
                PpiError::dataset(format!("cannot open shard {}: {e}", shard_path.display()))
            })?;
            let mut reader = BufReader::new(file);
            let mut offset = 0u64;
            let mut line = String::new();
            loop {
                line.clear();
                let read = reader.read_line(&mut line)?;
                if read == 0 {
                    break;
                }
                if !line.trim().is_empty() {
                    index.push(RecordLocation { shard, offset });
                }
                offset += read as u64;
            }
        }

        tracing::debug!(
            path = %path.display(),
            shards = shards.len(),
            records = index.len(),
            "Indexed sharded dataset"
        );
        Ok(Self {
            path: path.to_path_buf(),
            shards,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of keyed records (ensembles) in the store.
    pub fn num_keyed(&self) -> usize {
        self.index.len()
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Record locations in storage order, optionally restricted to some shards.
    pub fn locations(&self, shard_nums: Option<&[usize]>) -> Vec<RecordLocation> {
        match shard_nums {
            None => self.index.clone(),
            Some(nums) => self
                .index
                .iter()
                .filter(|loc| nums.contains(&loc.shard))
                .copied()
                .collect(),
        }
    }

    /// Parse the record at `location`.
    pub fn read(&self, location: RecordLocation) -> Result<EnsembleRecord, PpiError> {
        let shard_path = self.shards.get(location.shard).ok_or_else(|| {
            PpiError::not_found(format!(
                "shard {} of {}",
                location.shard,
                self.path.display()
            ))
        })?;
        let mut file = File::open(shard_path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line)?;
        serde_json::from_str(&line).map_err(|e| {
            PpiError::dataset(format!(
                "corrupt record at {}:{}: {e}",
                shard_path.display(),
                location.offset
            ))
        })
    }

    /// Write `shards` using the `<prefix>@<n>` layout and return the store path.
    pub fn write(prefix: &Path, shards: &[Vec<EnsembleRecord>]) -> Result<PathBuf, PpiError> {
        if shards.is_empty() {
            return Err(PpiError::invalid_input("a store needs at least one shard"));
        }
        let store = PathBuf::from(format!("{}@{}", prefix.display(), shards.len()));
        for (shard_path, records) in resolve_shards(&store)?.iter().zip(shards) {
            if let Some(parent) = shard_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut writer = BufWriter::new(File::create(shard_path)?);
            for record in records {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        Ok(store)
    }
}

/// Expand a store path into its shard files.
pub fn resolve_shards(path: &Path) -> Result<Vec<PathBuf>, PpiError> {
    let text = path.to_string_lossy();
    let Some((prefix, count)) = text.rsplit_once('@') else {
        return Ok(vec![path.to_path_buf()]);
    };
    let count: usize = count.parse().map_err(|_| {
        PpiError::config(format!(
            "invalid shard count in '{text}', expected <prefix>@<num_shards>"
        ))
    })?;
    if count == 0 {
        return Err(PpiError::config(format!("'{text}' declares zero shards")));
    }
    Ok((0..count)
        .map(|i| PathBuf::from(format!("{prefix}_{i}.jsonl")))
        .collect())
}
