//! The epoch loop: train, validate, select checkpoints, stop.

use crate::config::{RunConfig, SelectionPolicy, Split};
use crate::data::stream::{ExampleSource, ExampleStream, StreamRequest, Traversal};
use crate::error::PpiError;
use crate::eval::metrics::compute_perf;
use crate::model::Model;
use crate::training::accounting::ExampleBudget;
use crate::training::batch;
use crate::training::checkpoint::{CheckpointRef, CheckpointStore};
use crate::training::evaluator::{EpochResult, Evaluator, Mode};
use crate::training::results::ResultTable;
use crate::training::run_info::RunInfoWriter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What the controller does after an epoch's validation loss is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochDecision {
    /// The loss beat every earlier one; persist and record it.
    pub new_best: bool,
    /// Early stopping fired.
    pub stop: bool,
}

/// Best-ever and previous-epoch validation losses.
///
/// The two follow different rules: `best_val_loss` selects checkpoints,
/// `prev_val_loss` drives the one-step-lookback early stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionState {
    best_val_loss: f64,
    prev_val_loss: f64,
}

impl Default for SelectionState {
    fn default() -> Self {
        Self {
            best_val_loss: f64::INFINITY,
            prev_val_loss: f64::INFINITY,
        }
    }
}

impl SelectionState {
    pub fn observe(&mut self, val_loss: f64, policy: &SelectionPolicy) -> EpochDecision {
        let new_best = policy.tracks_best() && val_loss < self.best_val_loss;
        if new_best {
            self.best_val_loss = val_loss;
        }
        let stop = policy.early_stopping && val_loss >= self.prev_val_loss;
        if !stop {
            self.prev_val_loss = val_loss;
        }
        EpochDecision { new_best, stop }
    }

    pub fn best_val_loss(&self) -> f64 {
        self.best_val_loss
    }

    pub fn prev_val_loss(&self) -> f64 {
        self.prev_val_loss
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EpochLimit,
    EarlyStopping,
    /// A stop was requested from outside (Ctrl-C) and honoured at the epoch boundary.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointOrigin {
    Best { epoch: usize, val_loss: f64 },
    Terminal { epoch: usize },
}

/// The checkpoint testing should use, handed from training to testing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedCheckpoint {
    pub reference: CheckpointRef,
    pub origin: CheckpointOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub stop_reason: StopReason,
    pub val_losses: Vec<f64>,
    pub best_val_loss: Option<f64>,
    pub selected: SelectedCheckpoint,
}

/// Drives successive train and validation loops over one model.
pub struct EpochController<'a> {
    config: &'a RunConfig,
    output_dir: PathBuf,
    train: Arc<dyn ExampleSource>,
    val: Arc<dyn ExampleSource>,
    evaluator: Evaluator,
    stop_requested: Option<Arc<AtomicBool>>,
}

impl<'a> EpochController<'a> {
    pub fn new(
        config: &'a RunConfig,
        output_dir: impl Into<PathBuf>,
        train: Arc<dyn ExampleSource>,
        val: Arc<dyn ExampleSource>,
    ) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
            train,
            val,
            evaluator: Evaluator::from_config(&config.model, &config.sample),
            stop_requested: None,
        }
    }

    /// Stop after the current epoch once `flag` is set.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_requested = Some(flag);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn run(&self, model: &mut dyn Model) -> Result<TrainingSummary, PpiError> {
        let policy = self.config.selection();
        let batch_size = self.config.batch_size;
        let train_budget =
            ExampleBudget::for_split(self.config, Split::Train, self.train.num_keyed())?;
        let val_budget = ExampleBudget::for_split(self.config, Split::Val, self.val.num_keyed())?;
        tracing::info!(
            train = ?train_budget.num_examples(),
            val = ?val_budget.num_examples(),
            "Start training with {:?} structures for train and {:?} structures for val per epoch",
            train_budget.num_examples(),
            val_budget.num_examples()
        );

        let store = CheckpointStore::new(&self.output_dir);
        let mut run_info = RunInfoWriter::new(&self.output_dir);
        let mut state = SelectionState::default();
        let mut best: Option<SelectedCheckpoint> = None;
        let mut terminal: Option<SelectedCheckpoint> = None;
        let mut stop_reason = StopReason::EpochLimit;
        let mut epochs_run = 0;

        for epoch in 1..=self.config.num_epochs {
            let seed = self.config.random_seed;
            tracing::info!(epoch, random_seed = seed, "Epoch {epoch} - random_seed: {seed}");

            let train_result = self.run_split(
                model,
                &self.train,
                Split::Train,
                seed,
                train_budget.num_batches(batch_size),
            )?;
            let val_result = self.run_split(
                model,
                &self.val,
                Split::Val,
                seed,
                val_budget.num_batches(batch_size),
            )?;
            epochs_run = epoch;

            let val_loss = val_result.mean_loss;
            run_info.push_val_loss(val_loss)?;
            let decision = state.observe(val_loss, &policy);
            let interrupted = self
                .stop_requested
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst));
            let is_last = epoch == self.config.num_epochs || decision.stop || interrupted;

            // At most one checkpoint file per epoch.
            let mut saved: Option<CheckpointRef> = None;
            let mut save = |model: &dyn Model| -> Result<CheckpointRef, PpiError> {
                if let Some(reference) = &saved {
                    return Ok(reference.clone());
                }
                let reference = store.save(model, epoch, val_loss)?;
                saved = Some(reference.clone());
                Ok(reference)
            };

            if decision.new_best {
                let reference = save(&*model)?;
                run_info.record_best(val_loss, reference.clone())?;
                tracing::info!(checkpoint = %reference, val_loss, "New best {reference}");
                best = Some(SelectedCheckpoint {
                    reference,
                    origin: CheckpointOrigin::Best { epoch, val_loss },
                });
            }
            if is_last && !policy.use_best {
                let reference = save(&*model)?;
                run_info.record_terminal(reference.clone())?;
                tracing::info!(checkpoint = %reference, "Last checkpoint {reference}");
                terminal = Some(SelectedCheckpoint {
                    reference,
                    origin: CheckpointOrigin::Terminal { epoch },
                });
            }
            if policy.save_all_ckpts {
                let reference = save(&*model)?;
                tracing::info!(checkpoint = %reference, "Saving checkpoint {reference}");
            }

            tracing::info!(epoch, "Saving train and val results");
            self.report(
                &train_result,
                &format!("train_result-{epoch}.json"),
                &format!("Train Epoch {epoch}"),
            )?;
            self.report(
                &val_result,
                &format!("val_result-{epoch}.json"),
                &format!("Val Epoch {epoch}"),
            )?;

            if decision.stop {
                tracing::info!(epoch, val_loss, "Validation loss stopped decreasing, stopping...");
                stop_reason = StopReason::EarlyStopping;
                break;
            }
            if interrupted && epoch < self.config.num_epochs {
                tracing::warn!(epoch, "Stop requested, ending training after this epoch");
                stop_reason = StopReason::Interrupted;
                break;
            }
        }

        let selected = (if policy.use_best { best } else { terminal }).ok_or_else(|| {
            PpiError::model(format!(
                "no checkpoint selected after {epochs_run} epochs; validation losses {:?}",
                run_info.info().val_losses
            ))
        })?;
        let summary = TrainingSummary {
            epochs_run,
            stop_reason,
            val_losses: run_info.info().val_losses.clone(),
            best_val_loss: run_info.info().val_best_loss,
            selected,
        };
        tracing::info!(
            epochs_run = summary.epochs_run,
            stop_reason = ?summary.stop_reason,
            best_val_loss = ?summary.best_val_loss,
            checkpoint = %summary.selected.reference,
            "Finished training"
        );
        Ok(summary)
    }

    fn run_split(
        &self,
        model: &mut dyn Model,
        source: &Arc<dyn ExampleSource>,
        split: Split,
        seed: u64,
        num_batches: u64,
    ) -> Result<EpochResult, PpiError> {
        tracing::debug!(split = %split, "Creating {split} generator...");
        let stream = ExampleStream::open(
            Arc::clone(source),
            StreamRequest::for_split(self.config, split, seed),
            Traversal::for_split(split, self.config.shuffle),
        )?;
        let mut batches = batch::batches(stream, self.config.batch_size)?;
        let mode = match split {
            Split::Train => Mode::Train,
            Split::Val => Mode::Val,
            Split::Test => Mode::Test,
        };
        self.evaluator.run(model, batches.as_mut(), mode, num_batches)
    }

    fn report(&self, result: &EpochResult, file: &str, title: &str) -> Result<(), PpiError> {
        let table = ResultTable::from_epoch_result(result)?;
        table.write(&self.output_dir.join(file))?;
        compute_perf(&table.scored())?.log(title);
        Ok(())
    }
}
