//! Run directory allocation and the train/test flows.

use anyhow::Context;
use ppi3d_ml::config::Split;
use ppi3d_ml::data::{ExampleSource, RegionSampler, ShardedDataset};
use ppi3d_ml::training::{RestoredRun, TestRunner};
use ppi3d_ml::{EpochController, LogisticProbe, RunConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Directory name used by unobserved runs.
const UNOBSERVED_DIR: &str = "None";

/// Create the directory this run writes into.
///
/// Observed runs get the first unused `<output_dir>/<n>` counting from 0; unobserved
/// runs reuse `<output_dir>/None`.
pub fn allocate_output_dir(config: &RunConfig) -> anyhow::Result<PathBuf> {
    let root = config
        .output_dir
        .as_deref()
        .context("output_dir is required (--output-dir or MODEL_DIR)")?;
    let dir = if config.unobserved {
        root.join(UNOBSERVED_DIR)
    } else {
        (0u64..)
            .map(|n| root.join(n.to_string()))
            .find(|candidate| !candidate.exists())
            .context("no free run directory")?
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create run directory {}", dir.display()))?;
    Ok(dir)
}

fn open_split(config: &RunConfig, split: Split) -> anyhow::Result<Arc<dyn ExampleSource>> {
    let path = config.split_path(split)?;
    let dataset = ShardedDataset::load(path)
        .with_context(|| format!("Failed to open {split} store {}", path.display()))?;
    tracing::info!(
        split = %split,
        ensembles = dataset.num_keyed(),
        shards = dataset.num_shards(),
        "Opened {split} store {}",
        path.display()
    );
    Ok(Arc::new(RegionSampler::new(Arc::new(dataset), &config.sample.grid)))
}

/// Train then test, or test the run recorded in `model_dir`.
pub fn execute(config: &RunConfig, output_dir: &Path, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    if config.test_only {
        let restored = RestoredRun::load(config).context("Failed to restore trained run")?;
        let test = open_split(&restored.config, Split::Test)?;
        let mut model = LogisticProbe::new(
            restored.config.sample.grid.channel_count(),
            restored.config.random_seed,
        );
        TestRunner::new(&restored.config, output_dir, test)
            .run(&mut model, &restored.checkpoint)
            .context("Testing failed")?;
        return Ok(());
    }

    let train = open_split(config, Split::Train)?;
    let val = open_split(config, Split::Val)?;
    let test = open_split(config, Split::Test)?;
    let mut model = LogisticProbe::new(config.sample.grid.channel_count(), config.random_seed);

    let summary = EpochController::new(config, output_dir, train, val)
        .with_stop_flag(stop)
        .run(&mut model)
        .context("Training failed")?;
    tracing::info!(
        epochs = summary.epochs_run,
        "Training summary:\n{}",
        serde_json::to_string_pretty(&summary)?
    );

    TestRunner::new(config, output_dir, test)
        .run(&mut model, &summary.selected.reference)
        .context("Testing failed")?;
    Ok(())
}
