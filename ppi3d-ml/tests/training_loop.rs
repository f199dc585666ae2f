//! Integration tests for the epoch loop and test runner.
//!
//! Drives training and testing through the public API with a scripted model,
//! then end to end over an on-disk sharded store with the logistic probe.

use ppi3d_ml::config::{GridConfig, RunConfig, SamplingPolicy};
use ppi3d_ml::data::stream::{ExampleIter, StreamRequest};
use ppi3d_ml::data::{
    EnsembleRecord, Example, ExampleSource, GridPair, Label, RegionRecord, RegionSampler,
    ShardedDataset, StructureId,
};
use ppi3d_ml::model::{DropoutRates, LogisticProbe, Model};
use ppi3d_ml::training::controller::CheckpointOrigin;
use ppi3d_ml::training::{
    CheckpointStore, EpochController, RestoredRun, ResultTable, RunInfo, StopReason, TestRunner,
};
use ppi3d_ml::PpiError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;

// ── Test collaborators ───────────────────────────────────────────────────

/// Emits `count` examples per pass, alternating positive and negative unless
/// `all_positive` is set.
struct AlternatingSource {
    count: usize,
    keyed: usize,
    all_positive: bool,
}

impl ExampleSource for AlternatingSource {
    fn generate(&self, _request: &StreamRequest) -> Result<ExampleIter, PpiError> {
        let examples: Vec<_> = (0..self.count)
            .map(|i| -> Result<Example, PpiError> {
                Ok(Example {
                    structure: StructureId::new(format!("ens{}/A:{i}/B:{i}", i / 2)),
                    grids: GridPair::new(1, 1, vec![i as f32, 0.0])?,
                    label: if self.all_positive || i % 2 == 0 {
                        Label::Positive
                    } else {
                        Label::Negative
                    },
                })
            })
            .collect();
        Ok(Box::new(examples.into_iter()))
    }

    fn num_keyed(&self) -> usize {
        self.keyed
    }
}

/// Emits a fixed logit per validation epoch so validation losses follow a
/// script. The loss of a constant logit `c` over balanced labels grows with
/// `|c|`.
struct ScriptedModel {
    val_logits: Vec<f32>,
    epoch: usize,
    in_training: bool,
}

impl ScriptedModel {
    fn new(val_logits: &[f32]) -> Self {
        Self {
            val_logits: val_logits.to_vec(),
            epoch: 0,
            in_training: false,
        }
    }
}

impl Model for ScriptedModel {
    fn forward(
        &mut self,
        grids: &[GridPair],
        is_training: bool,
        _dropout: &DropoutRates,
    ) -> Result<Vec<f32>, PpiError> {
        if is_training {
            self.in_training = true;
            return Ok(vec![0.0; grids.len()]);
        }
        if self.in_training {
            self.in_training = false;
            self.epoch += 1;
        }
        let logit = self.val_logits[self.epoch.saturating_sub(1).min(self.val_logits.len() - 1)];
        Ok(vec![logit; grids.len()])
    }

    fn backward(&mut self, _: &[GridPair], _: &[f32], _: f64) -> Result<(), PpiError> {
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), PpiError> {
        std::fs::write(path, serde_json::to_vec(&self.epoch)?)?;
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<(), PpiError> {
        self.epoch = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(())
    }
}

fn scripted_config(num_epochs: usize) -> RunConfig {
    let policy = SamplingPolicy {
        max_pos_regions_per_ensemble: 1,
        neg_to_pos_ratio: 1,
    };
    let mut config = RunConfig {
        train_sharded: Some(PathBuf::from("/unused/train@1")),
        val_sharded: Some(PathBuf::from("/unused/val@1")),
        test_sharded: Some(PathBuf::from("/unused/test@1")),
        num_epochs,
        batch_size: 2,
        // the source order is kept as is, so every batch holds both classes
        shuffle: true,
        random_seed: 11,
        ..RunConfig::default()
    };
    config.sample.training = policy;
    config.sample.testing = policy;
    config
}

fn alternating(count: usize, keyed: usize) -> Arc<dyn ExampleSource> {
    Arc::new(AlternatingSource {
        count,
        keyed,
        all_positive: false,
    })
}

fn positives_only(count: usize, keyed: usize) -> Arc<dyn ExampleSource> {
    Arc::new(AlternatingSource {
        count,
        keyed,
        all_positive: true,
    })
}

// ── Epoch loop ───────────────────────────────────────────────────────────

#[test]
fn early_stopping_keeps_best_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut config = scripted_config(5);
    config.use_best = true;
    config.early_stopping = true;
    let mut model = ScriptedModel::new(&[2.0, 0.5, 1.0, 0.1, 0.1]);

    let summary = EpochController::new(&config, dir.path(), alternating(4, 2), alternating(4, 2))
        .run(&mut model)
        .unwrap();

    assert_eq!(summary.epochs_run, 3);
    assert_eq!(summary.stop_reason, StopReason::EarlyStopping);
    assert_eq!(summary.val_losses.len(), 3);
    assert!(summary.val_losses[1] < summary.val_losses[0]);
    assert!(summary.val_losses[2] > summary.val_losses[1]);
    assert_eq!(summary.best_val_loss, Some(summary.val_losses[1]));
    assert!(matches!(
        summary.selected.origin,
        CheckpointOrigin::Best { epoch: 2, .. }
    ));
    assert_eq!(
        summary.selected.reference.path(),
        dir.path().join("model-ckpt-2.json")
    );

    // epoch 3 was neither a new best nor a terminal checkpoint
    assert!(!dir.path().join("model-ckpt-3.json").exists());
    let info = RunInfo::load(dir.path()).unwrap();
    assert_eq!(info.val_losses.len(), 3);
    assert!((info.val_losses[1] - summary.val_losses[1]).abs() < 1e-12);
    assert_eq!(info.best_ckpt.as_ref(), Some(&summary.selected.reference));
    for epoch in 1..=3 {
        assert!(dir.path().join(format!("train_result-{epoch}.json")).exists());
        let val = ResultTable::load(&dir.path().join(format!("val_result-{epoch}.json"))).unwrap();
        assert_eq!(val.len(), 4);
    }
}

#[test]
fn terminal_checkpoint_without_use_best() {
    let dir = TempDir::new().unwrap();
    let config = scripted_config(3);
    let mut model = ScriptedModel::new(&[1.0, 0.5, 0.2]);

    let summary = EpochController::new(&config, dir.path(), alternating(4, 2), alternating(4, 2))
        .run(&mut model)
        .unwrap();

    assert_eq!(summary.epochs_run, 3);
    assert_eq!(summary.stop_reason, StopReason::EpochLimit);
    assert_eq!(summary.best_val_loss, None);
    assert!(matches!(
        summary.selected.origin,
        CheckpointOrigin::Terminal { epoch: 3 }
    ));
    let entries = CheckpointStore::new(dir.path()).list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].epoch, 3);
}

#[test]
fn save_all_ckpts_writes_every_epoch() {
    let dir = TempDir::new().unwrap();
    let mut config = scripted_config(3);
    config.save_all_ckpts = true;
    let mut model = ScriptedModel::new(&[1.0, 0.5, 0.2]);

    EpochController::new(&config, dir.path(), alternating(4, 2), alternating(4, 2))
        .run(&mut model)
        .unwrap();

    let epochs: Vec<_> = CheckpointStore::new(dir.path())
        .list()
        .unwrap()
        .iter()
        .map(|e| e.epoch)
        .collect();
    assert_eq!(epochs, vec![1, 2, 3]);
}

#[test]
fn stop_flag_ends_after_current_epoch() {
    let dir = TempDir::new().unwrap();
    let config = scripted_config(5);
    let mut model = ScriptedModel::new(&[1.0, 0.5, 0.2]);

    let summary = EpochController::new(&config, dir.path(), alternating(4, 2), alternating(4, 2))
        .with_stop_flag(Arc::new(AtomicBool::new(true)))
        .run(&mut model)
        .unwrap();

    assert_eq!(summary.epochs_run, 1);
    assert_eq!(summary.stop_reason, StopReason::Interrupted);
    assert!(matches!(
        summary.selected.origin,
        CheckpointOrigin::Terminal { epoch: 1 }
    ));
}

#[test]
fn one_class_epoch_surfaces_undefined_metric() {
    let dir = TempDir::new().unwrap();
    let config = scripted_config(2);
    let mut model = ScriptedModel::new(&[0.5, 0.2]);

    let err = EpochController::new(&config, dir.path(), positives_only(4, 2), alternating(4, 2))
        .run(&mut model)
        .unwrap_err();

    assert!(matches!(err, PpiError::MetricUndefined { .. }), "{err}");
    // the table is written before the report fails, and no later epoch runs
    assert!(dir.path().join("train_result-1.json").exists());
    assert!(!dir.path().join("train_result-2.json").exists());
}

// ── Test runner ──────────────────────────────────────────────────────────

#[test]
fn short_test_stream_ends_loop_early() {
    let dir = TempDir::new().unwrap();
    let mut config = scripted_config(1);
    config.batch_size = 4;
    // 5 keyed ensembles * 1 * (1 + 1) = 10 examples planned, 3 batches
    let source = alternating(7, 5);

    let mut model = ScriptedModel::new(&[0.3]);
    let checkpoint = CheckpointStore::new(dir.path()).save(&model, 1, 0.5).unwrap();
    let outcome = TestRunner::new(&config, dir.path(), source)
        .run(&mut model, &checkpoint)
        .unwrap();

    assert_eq!(outcome.result.batches, 2);
    assert_eq!(outcome.result.len(), 7);
    assert!(outcome.result.exhausted);
    let written = ResultTable::load(&dir.path().join("test_result.json")).unwrap();
    assert_eq!(written, outcome.table);
    assert_eq!(written.rows()[6].ensemble, "ens3");
}

#[test]
fn one_class_test_split_surfaces_undefined_metric() {
    let dir = TempDir::new().unwrap();
    let config = scripted_config(1);
    let mut model = ScriptedModel::new(&[0.3]);
    let checkpoint = CheckpointStore::new(dir.path()).save(&model, 1, 0.5).unwrap();

    let err = TestRunner::new(&config, dir.path(), positives_only(4, 2))
        .run(&mut model, &checkpoint)
        .unwrap_err();

    assert!(matches!(err, PpiError::MetricUndefined { .. }), "{err}");
    let written = ResultTable::load(&dir.path().join("test_result.json")).unwrap();
    assert_eq!(written.len(), 4);
}

#[test]
fn tampered_checkpoint_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = scripted_config(1);
    let mut model = ScriptedModel::new(&[0.3]);
    let checkpoint = CheckpointStore::new(dir.path()).save(&model, 1, 0.5).unwrap();
    std::fs::write(checkpoint.path(), b"42").unwrap();

    let err = TestRunner::new(&config, dir.path(), alternating(4, 2))
        .run(&mut model, &checkpoint)
        .unwrap_err();
    assert!(matches!(err, PpiError::CheckpointRestore(_)));
}

// ── End to end over a sharded store ──────────────────────────────────────

fn small_grid() -> GridConfig {
    GridConfig {
        radius: 0.5,
        resolution: 1.0,
        ..GridConfig::default()
    }
}

/// Positives have dense carbon occupancy, negatives are nearly empty.
fn ensemble(name: &str, grid: &GridConfig) -> EnsembleRecord {
    let len = grid.grid_pair_len();
    let channels = grid.channel_count();
    let grids = |occupancy: f32| -> Vec<f32> {
        (0..len)
            .map(|i| if i % channels == 0 { occupancy } else { 0.1 })
            .collect()
    };
    let region = |i: usize, label: Label, occupancy: f32| RegionRecord {
        res0: format!("A:{i}"),
        res1: format!("B:{i}"),
        label,
        grids: grids(occupancy),
    };
    EnsembleRecord {
        ensemble: name.to_string(),
        regions: vec![
            region(1, Label::Positive, 1.0),
            region(2, Label::Negative, 0.0),
            region(3, Label::Positive, 0.9),
            region(4, Label::Negative, 0.05),
        ],
    }
}

fn write_store(root: &Path, split: &str, names: &[&[&str]], grid: &GridConfig) -> PathBuf {
    let shards: Vec<Vec<_>> = names
        .iter()
        .map(|shard| shard.iter().map(|n| ensemble(n, grid)).collect())
        .collect();
    ShardedDataset::write(&root.join(split), &shards).unwrap()
}

fn sampler(config: &RunConfig, path: &Path) -> Arc<dyn ExampleSource> {
    let dataset = ShardedDataset::load(path).unwrap();
    Arc::new(RegionSampler::new(Arc::new(dataset), &config.sample.grid))
}

#[test]
fn train_test_and_test_only_agree() {
    let data = TempDir::new().unwrap();
    let run_dir = TempDir::new().unwrap();
    let grid = small_grid();

    let mut config = RunConfig {
        train_sharded: Some(write_store(data.path(), "train", &[&["1abc", "2def"], &["3ghi"]], &grid)),
        val_sharded: Some(write_store(data.path(), "val", &[&["4jkl", "5mno"]], &grid)),
        test_sharded: Some(write_store(data.path(), "test", &[&["6pqr"], &["7stu"]], &grid)),
        num_epochs: 3,
        batch_size: 2,
        shuffle: true,
        random_seed: 42,
        ..RunConfig::default()
    };
    config.sample.grid = grid;
    config.sample.training = SamplingPolicy {
        max_pos_regions_per_ensemble: 1,
        neg_to_pos_ratio: 1,
    };
    config.model.learning_rate = 0.5;
    config.validate().unwrap();
    config.persist(run_dir.path()).unwrap();

    let train = sampler(&config, config.train_sharded.as_deref().unwrap());
    let val = sampler(&config, config.val_sharded.as_deref().unwrap());
    let test = sampler(&config, config.test_sharded.as_deref().unwrap());
    let channels = config.sample.grid.channel_count();

    let mut model = LogisticProbe::new(channels, config.random_seed);
    let summary = EpochController::new(&config, run_dir.path(), train, val)
        .run(&mut model)
        .unwrap();
    assert_eq!(summary.epochs_run, 3);

    let trained = TestRunner::new(&config, run_dir.path(), Arc::clone(&test))
        .run(&mut model, &summary.selected.reference)
        .unwrap();
    // two ensembles, two positives and two negatives each
    assert_eq!(trained.table.len(), 8);
    assert_eq!(trained.confusion.0.values().sum::<usize>(), 8);

    let current = RunConfig {
        test_only: true,
        model_dir: Some(run_dir.path().to_path_buf()),
        ..config.clone()
    };
    let restored = RestoredRun::load(&current).unwrap();
    assert_eq!(restored.checkpoint, summary.selected.reference);

    let out_dir = TempDir::new().unwrap();
    let mut fresh = LogisticProbe::new(channels, 7);
    let replayed = TestRunner::new(&restored.config, out_dir.path(), test)
        .run(&mut fresh, &restored.checkpoint)
        .unwrap();
    assert_eq!(fresh.weights(), model.weights());
    assert_eq!(replayed.table, trained.table);
    assert_eq!(replayed.report, trained.report);
}
