//! Held-out evaluation of a selected checkpoint.

use crate::config::{RunConfig, Split};
use crate::data::stream::{ExampleSource, ExampleStream, StreamRequest, Traversal};
use crate::error::PpiError;
use crate::eval::metrics::{PerfReport, compute_perf};
use crate::model::Model;
use crate::training::accounting::ExampleBudget;
use crate::training::batch::BatchAssembler;
use crate::training::checkpoint::{self, CheckpointRef};
use crate::training::evaluator::{EpochResult, Evaluator, Mode};
use crate::training::results::{ConfusionCounts, ResultTable};
use crate::training::run_info::RunInfo;
use std::path::PathBuf;
use std::sync::Arc;

pub const TEST_RESULT_FILE: &str = "test_result.json";

/// A trained run loaded back for test-only evaluation.
#[derive(Debug, Clone)]
pub struct RestoredRun {
    /// Current invocation merged with the trained run's model and grid.
    pub config: RunConfig,
    pub checkpoint: CheckpointRef,
    pub run_info: RunInfo,
}

impl RestoredRun {
    /// Load `config.json` and `run_info.json` from `current.model_dir`.
    pub fn load(current: &RunConfig) -> Result<Self, PpiError> {
        let model_dir = current
            .model_dir
            .as_deref()
            .ok_or_else(|| PpiError::config("test_only requires model_dir"))?;
        let trained = RunConfig::load_persisted(model_dir)?;
        let run_info = RunInfo::load(model_dir)?;

        let mut checkpoint = run_info.best_checkpoint()?.clone();
        if !checkpoint.path().exists() {
            if let Some(moved) = checkpoint.relocate(model_dir).filter(|c| c.path().exists()) {
                tracing::warn!(
                    recorded = %checkpoint,
                    found = %moved,
                    "Recorded checkpoint missing, using the copy in model_dir"
                );
                checkpoint = moved;
            }
        }

        let config = current.for_restored_model(&trained);
        config.validate()?;
        Ok(Self {
            config,
            checkpoint,
            run_info,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub checkpoint: CheckpointRef,
    pub result: EpochResult,
    pub table: ResultTable,
    pub report: PerfReport,
    pub confusion: ConfusionCounts,
}

/// Restores a checkpoint and runs one deterministic pass over the test split.
pub struct TestRunner<'a> {
    config: &'a RunConfig,
    output_dir: PathBuf,
    source: Arc<dyn ExampleSource>,
}

impl<'a> TestRunner<'a> {
    pub fn new(
        config: &'a RunConfig,
        output_dir: impl Into<PathBuf>,
        source: Arc<dyn ExampleSource>,
    ) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
            source,
        }
    }

    pub fn run(
        &self,
        model: &mut dyn Model,
        checkpoint: &CheckpointRef,
    ) -> Result<TestOutcome, PpiError> {
        tracing::info!(checkpoint = %checkpoint, "Using {checkpoint} for testing");
        checkpoint::restore(model, checkpoint)?;

        let budget = ExampleBudget::for_split(self.config, Split::Test, self.source.num_keyed())?;
        match budget.num_examples() {
            Some(n) => tracing::info!(examples = n, "Start testing with {n} structures"),
            None => tracing::info!("Start testing over every region"),
        }

        let stream = ExampleStream::open(
            Arc::clone(&self.source),
            StreamRequest::for_split(self.config, Split::Test, self.config.random_seed),
            Traversal::SinglePass,
        )?;
        let mut batches = BatchAssembler::new(stream, self.config.batch_size);
        let evaluator = Evaluator::from_config(&self.config.model, &self.config.sample);
        let result = evaluator.run(
            model,
            &mut batches,
            Mode::Test,
            budget.num_batches(self.config.batch_size),
        )?;
        tracing::info!(examples = result.len(), loss = result.mean_loss, "Finished testing");

        let table = ResultTable::from_epoch_result(&result)?;
        table.write(&self.output_dir.join(TEST_RESULT_FILE))?;
        let confusion = table.confusion_counts();
        tracing::info!("\n{confusion}");
        let report = compute_perf(&table.scored())?;
        report.log("Test");

        Ok(TestOutcome {
            checkpoint: checkpoint.clone(),
            result,
            table,
            report,
            confusion,
        })
    }
}
