//! Run configuration.
//!
//! Uses `figment` for layered configuration: defaults -> TOML file -> legacy
//! environment variables -> `PPI3D_` environment -> CLI overrides. The result is
//! validated once and never mutated afterwards; every component receives it by
//! reference.

use crate::error::PpiError;
use crate::model::DropoutRates;
use crate::persistence;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the persisted run configuration inside a run directory.
pub const CONFIG_FILE: &str = "config.json";

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Voxel grid geometry shared by every subgrid of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Half-width of the cube around a residue, in angstroms.
    #[serde(default = "default_radius")]
    pub radius: f64,
    /// Voxel edge, in angstroms.
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// Element symbol -> channel index.
    #[serde(default = "default_element_mapping")]
    pub element_mapping: BTreeMap<String, usize>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            radius: default_radius(),
            resolution: default_resolution(),
            element_mapping: default_element_mapping(),
        }
    }
}

impl GridConfig {
    /// Number of voxels along one edge of the cube.
    pub fn grid_edge_length(&self) -> usize {
        (2.0 * self.radius / self.resolution).floor() as usize + 1
    }

    /// Number of distinct feature channels.
    pub fn channel_count(&self) -> usize {
        let mut channels: Vec<usize> = self.element_mapping.values().copied().collect();
        channels.sort_unstable();
        channels.dedup();
        channels.len()
    }

    /// Number of `f32` values in one co-registered grid pair `[2, D, D, D, C]`.
    pub fn grid_pair_len(&self) -> usize {
        let d = self.grid_edge_length();
        2 * d * d * d * self.channel_count()
    }

    fn validate(&self) -> Result<(), PpiError> {
        if !(self.radius > 0.0 && self.resolution > 0.0) {
            return Err(PpiError::config(format!(
                "grid radius ({}) and resolution ({}) must be positive",
                self.radius, self.resolution
            )));
        }
        if self.element_mapping.is_empty() {
            return Err(PpiError::config("grid element_mapping must not be empty"));
        }
        let channels = self.channel_count();
        if let Some(idx) = self.element_mapping.values().find(|&&i| i >= channels) {
            return Err(PpiError::config(format!(
                "channel index {idx} is not contiguous (expected < {channels})"
            )));
        }
        Ok(())
    }
}

fn default_radius() -> f64 {
    17.0
}

fn default_resolution() -> f64 {
    1.0
}

fn default_element_mapping() -> BTreeMap<String, usize> {
    [("C", 0), ("O", 1), ("N", 2), ("S", 3)]
        .into_iter()
        .map(|(element, channel)| (element.to_string(), channel))
        .collect()
}

/// How many interface regions are drawn per ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingPolicy {
    /// Cap on positive regions drawn per ensemble.
    pub max_pos_regions_per_ensemble: i64,
    /// Negatives generated per positive.
    pub neg_to_pos_ratio: i64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            max_pos_regions_per_ensemble: 70,
            neg_to_pos_ratio: 1,
        }
    }
}

impl SamplingPolicy {
    /// Both the cap and the ratio are positive, so an epoch has a finite size.
    pub fn is_capped(&self) -> bool {
        self.max_pos_regions_per_ensemble > 0 && self.neg_to_pos_ratio > 0
    }
}

/// Optional cap on the number of ensembles consumed per split and epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleCaps {
    #[serde(default)]
    pub train: Option<u64>,
    #[serde(default)]
    pub val: Option<u64>,
    #[serde(default)]
    pub test: Option<u64>,
}

/// Immutable description of grid geometry and per-split sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    #[serde(default)]
    pub grid: GridConfig,
    /// Policy for the train and val splits.
    #[serde(default)]
    pub training: SamplingPolicy,
    /// Policy for the test split.
    #[serde(default)]
    pub testing: SamplingPolicy,
    #[serde(default)]
    pub max_num_ensembles: EnsembleCaps,
    /// Evaluate every region of the test split, ignoring the testing policy.
    #[serde(default)]
    pub full_test: bool,
    /// How many times each ensemble is visited per training/validation pass.
    #[serde(default = "default_repeat")]
    pub repeat_gen: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            training: SamplingPolicy::default(),
            testing: SamplingPolicy::default(),
            max_num_ensembles: EnsembleCaps::default(),
            full_test: false,
            repeat_gen: default_repeat(),
        }
    }
}

fn default_repeat() -> u64 {
    1
}

impl SampleConfig {
    pub fn policy(&self, split: Split) -> SamplingPolicy {
        match split {
            Split::Train | Split::Val => self.training,
            Split::Test => self.testing,
        }
    }

    pub fn max_num_ensembles(&self, split: Split) -> Option<u64> {
        match split {
            Split::Train => self.max_num_ensembles.train,
            Split::Val => self.max_num_ensembles.val,
            Split::Test => self.max_num_ensembles.test,
        }
    }

    /// Passes over each ensemble; the test split is always visited once.
    pub fn repeat(&self, split: Split) -> u64 {
        match split {
            Split::Train | Split::Val => self.repeat_gen,
            Split::Test => 1,
        }
    }
}

/// Optimisation and regularisation hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_conv_drop_rate")]
    pub conv_drop_rate: f32,
    #[serde(default = "default_fc_drop_rate")]
    pub fc_drop_rate: f32,
    #[serde(default = "default_top_nn_drop_rate")]
    pub top_nn_drop_rate: f32,
    /// Disable dropout entirely, even in training.
    #[serde(default)]
    pub no_dropout: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            conv_drop_rate: default_conv_drop_rate(),
            fc_drop_rate: default_fc_drop_rate(),
            top_nn_drop_rate: default_top_nn_drop_rate(),
            no_dropout: false,
        }
    }
}

fn default_learning_rate() -> f64 {
    0.001
}

fn default_conv_drop_rate() -> f32 {
    0.1
}

fn default_fc_drop_rate() -> f32 {
    0.25
}

fn default_top_nn_drop_rate() -> f32 {
    0.5
}

impl ModelConfig {
    /// Rates applied to training steps.
    pub fn training_dropout(&self) -> DropoutRates {
        if self.no_dropout {
            DropoutRates::zero()
        } else {
            DropoutRates {
                conv: self.conv_drop_rate,
                fc: self.fc_drop_rate,
                top_nn: self.top_nn_drop_rate,
            }
        }
    }
}

/// Which checkpoints are kept and when training stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    /// Test with the lowest-validation-loss checkpoint instead of the terminal one.
    pub use_best: bool,
    /// Stop as soon as validation loss fails to improve on the previous epoch.
    pub early_stopping: bool,
    /// Persist a checkpoint after every epoch.
    pub save_all_ckpts: bool,
}

impl SelectionPolicy {
    /// Whether new-best checkpoints are tracked at all.
    pub fn tracks_best(&self) -> bool {
        self.use_best || self.early_stopping
    }
}

/// Full configuration of one run; serialized verbatim as `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub train_sharded: Option<PathBuf>,
    #[serde(default)]
    pub val_sharded: Option<PathBuf>,
    #[serde(default)]
    pub test_sharded: Option<PathBuf>,
    /// Root under which the run directory is allocated.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,

    #[serde(default)]
    pub use_best: bool,
    #[serde(default)]
    pub early_stopping: bool,
    #[serde(default)]
    pub save_all_ckpts: bool,

    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sample: SampleConfig,

    /// Skip training and evaluate the checkpoint recorded in `model_dir`.
    #[serde(default)]
    pub test_only: bool,
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
    /// Restrict the test split to these shard numbers.
    #[serde(default)]
    pub use_shard_nums: Option<Vec<usize>>,

    #[serde(default)]
    pub debug: bool,
    /// Write into `<output_dir>/None` instead of a fresh numbered directory.
    #[serde(default)]
    pub unobserved: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            train_sharded: None,
            val_sharded: None,
            test_sharded: None,
            output_dir: None,
            num_epochs: default_num_epochs(),
            batch_size: default_batch_size(),
            shuffle: false,
            random_seed: default_random_seed(),
            use_best: false,
            early_stopping: false,
            save_all_ckpts: false,
            model: ModelConfig::default(),
            sample: SampleConfig::default(),
            test_only: false,
            model_dir: None,
            use_shard_nums: None,
            debug: false,
            unobserved: false,
        }
    }
}

fn default_num_epochs() -> usize {
    5
}

fn default_batch_size() -> usize {
    4
}

fn default_random_seed() -> u64 {
    rand::thread_rng().gen_range(1..10_000_000)
}

impl RunConfig {
    /// Layered configuration sources, lowest priority first.
    ///
    /// CLI overrides are merged on top of the returned figment by the caller.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }

        // PPI_TRAIN_SHARDED, PPI_VAL_SHARDED, PPI_TEST_SHARDED
        figment = figment.merge(Env::prefixed("PPI_").only(&[
            "train_sharded",
            "val_sharded",
            "test_sharded",
        ]));
        // MODEL_DIR names the output root, not the test-only model directory.
        figment = figment.merge(Env::raw().only(&["model_dir"]).map(|_| "output_dir".into()));

        // PPI3D_BATCH_SIZE, PPI3D_SAMPLE__TRAINING__NEG_TO_POS_RATIO, etc.
        figment.merge(Env::prefixed("PPI3D_").split("__"))
    }

    /// Extract and validate a configuration.
    pub fn from_figment(figment: &Figment) -> Result<Self, PpiError> {
        let config: RunConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn selection(&self) -> SelectionPolicy {
        SelectionPolicy {
            use_best: self.use_best,
            early_stopping: self.early_stopping,
            save_all_ckpts: self.save_all_ckpts,
        }
    }

    /// Location of a split's sharded store.
    pub fn split_path(&self, split: Split) -> Result<&Path, PpiError> {
        let (path, source) = match split {
            Split::Train => (&self.train_sharded, "train_sharded / PPI_TRAIN_SHARDED"),
            Split::Val => (&self.val_sharded, "val_sharded / PPI_VAL_SHARDED"),
            Split::Test => (&self.test_sharded, "test_sharded / PPI_TEST_SHARDED"),
        };
        path.as_deref()
            .ok_or_else(|| PpiError::config(format!("missing {split} split location ({source})")))
    }

    /// Reject configurations that cannot produce a well-defined run.
    pub fn validate(&self) -> Result<(), PpiError> {
        if self.batch_size == 0 {
            return Err(PpiError::config("batch_size must be at least 1"));
        }
        if !(self.model.learning_rate.is_finite() && self.model.learning_rate > 0.0) {
            return Err(PpiError::config(format!(
                "learning_rate must be positive, got {}",
                self.model.learning_rate
            )));
        }
        for (name, rate) in [
            ("conv_drop_rate", self.model.conv_drop_rate),
            ("fc_drop_rate", self.model.fc_drop_rate),
            ("top_nn_drop_rate", self.model.top_nn_drop_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(PpiError::config(format!(
                    "{name} must lie in [0, 1), got {rate}"
                )));
            }
        }
        self.sample.grid.validate()?;
        self.split_path(Split::Test)?;

        if self.test_only {
            if self.model_dir.is_none() {
                return Err(PpiError::config("test_only requires model_dir"));
            }
        } else {
            if self.num_epochs == 0 {
                return Err(PpiError::config("num_epochs must be at least 1"));
            }
            if self.sample.repeat_gen == 0 {
                return Err(PpiError::config("repeat_gen must be at least 1"));
            }
            self.split_path(Split::Train)?;
            self.split_path(Split::Val)?;
            require_capped(Split::Train, self.sample.training)?;
        }

        if !self.sample.full_test {
            require_capped(Split::Test, self.sample.testing)?;
        }
        Ok(())
    }

    /// Write `config.json` into a run directory.
    pub fn persist(&self, run_dir: &Path) -> Result<PathBuf, PpiError> {
        let path = run_dir.join(CONFIG_FILE);
        persistence::write_json_atomic(&path, self)?;
        Ok(path)
    }

    /// Read the `config.json` of a finished run.
    pub fn load_persisted(run_dir: &Path) -> Result<Self, PpiError> {
        let path = run_dir.join(CONFIG_FILE);
        match persistence::read_json(&path) {
            Ok(Some(config)) => Ok(config),
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

    /// Configuration for a test-only invocation.
    ///
    /// Grid geometry and model hyperparameters come from the persisted
    /// `config.json` of the trained run; split locations, sampling and test
    /// flags come from the current invocation.
    pub fn for_restored_model(&self, trained: &RunConfig) -> RunConfig {
        RunConfig {
            model: trained.model.clone(),
            sample: SampleConfig {
                grid: trained.sample.grid.clone(),
                ..self.sample.clone()
            },
            ..self.clone()
        }
    }
}

fn require_capped(split: Split, policy: SamplingPolicy) -> Result<(), PpiError> {
    if policy.is_capped() {
        return Ok(());
    }
    Err(PpiError::config(format!(
        "{split} sampling needs a positive max_pos_regions_per_ensemble ({}) and neg_to_pos_ratio ({}) \
         to bound the number of examples per epoch",
        policy.max_pos_regions_per_ensemble, policy.neg_to_pos_ratio
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runnable() -> RunConfig {
        RunConfig {
            train_sharded: Some(PathBuf::from("/data/pairs_train@4")),
            val_sharded: Some(PathBuf::from("/data/pairs_val@2")),
            test_sharded: Some(PathBuf::from("/data/pairs_test@2")),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_default_grid_geometry() {
        let grid = GridConfig::default();
        assert_eq!(grid.grid_edge_length(), 35);
        assert_eq!(grid.channel_count(), 4);
        assert_eq!(grid.grid_pair_len(), 2 * 35 * 35 * 35 * 4);
    }

    #[test]
    fn test_channel_count_merges_shared_indices() {
        let grid = GridConfig {
            radius: 2.0,
            resolution: 1.0,
            element_mapping: [("C", 0), ("N", 1), ("O", 1)]
                .into_iter()
                .map(|(e, c)| (e.to_string(), c))
                .collect(),
        };
        assert_eq!(grid.grid_edge_length(), 5);
        assert_eq!(grid.channel_count(), 2);
    }

    #[test]
    fn test_runnable_config_validates() {
        runnable().validate().unwrap();
    }

    #[test]
    fn test_non_positive_ratio_is_fatal() {
        let mut config = runnable();
        config.sample.training.neg_to_pos_ratio = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PpiError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_full_test_bypasses_testing_policy() {
        let mut config = runnable();
        config.sample.testing.max_pos_regions_per_ensemble = -1;
        assert!(config.validate().is_err());

        config.sample.full_test = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_split_location() {
        let mut config = runnable();
        config.val_sharded = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("val split"));
    }

    #[test]
    fn test_test_only_needs_model_dir_not_training_splits() {
        let mut config = runnable();
        config.train_sharded = None;
        config.test_only = true;
        assert!(config.validate().is_err());

        config.model_dir = Some(PathBuf::from("/runs/7"));
        config.validate().unwrap();
    }

    #[test]
    fn test_training_dropout_respects_no_dropout() {
        let mut model = ModelConfig::default();
        assert_eq!(model.training_dropout().fc, 0.25);
        model.no_dropout = true;
        assert_eq!(model.training_dropout(), DropoutRates::zero());
    }

    #[test]
    fn test_figment_toml_layer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ppi3d.toml");
        std::fs::write(
            &path,
            r#"
train_sharded = "/data/train@2"
val_sharded = "/data/val@2"
test_sharded = "/data/test@2"
batch_size = 16
early_stopping = true

[sample.training]
max_pos_regions_per_ensemble = 5
neg_to_pos_ratio = 3
"#,
        )
        .unwrap();

        let config = RunConfig::from_figment(&RunConfig::figment(Some(&path))).unwrap();
        assert_eq!(config.batch_size, 16);
        assert!(config.selection().early_stopping);
        assert!(config.selection().tracks_best());
        assert_eq!(config.sample.training.neg_to_pos_ratio, 3);
        assert_eq!(config.sample.testing, SamplingPolicy::default());
    }

    #[test]
    fn test_restored_model_keeps_current_sampling() {
        let mut trained = runnable();
        trained.sample.grid.radius = 8.0;
        trained.model.learning_rate = 0.01;

        let mut current = runnable();
        current.test_only = true;
        current.model_dir = Some(PathBuf::from("/runs/3"));
        current.sample.full_test = true;

        let restored = current.for_restored_model(&trained);
        assert_eq!(restored.sample.grid.radius, 8.0);
        assert_eq!(restored.model.learning_rate, 0.01);
        assert!(restored.sample.full_test);
        assert!(restored.test_only);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = runnable();
        let path = config.persist(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(CONFIG_FILE));
        assert_eq!(RunConfig::load_persisted(dir.path()).unwrap(), config);

        let empty = TempDir::new().unwrap();
        assert!(matches!(
            RunConfig::load_persisted(empty.path()),
            Err(PpiError::CheckpointRestore(_))
        ));
    }
}
