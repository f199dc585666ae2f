//! One pass of a batch stream through the model.

use crate::config::{ModelConfig, SampleConfig};
use crate::data::example::{Label, StructureId};
use crate::error::PpiError;
use crate::model::{DropoutRates, Model, WeightedCrossEntropy, batch_accuracy, round_prediction};
use crate::training::batch::BatchSource;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a loop is for. Only `Train` applies dropout and updates parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Val,
    Test,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Val => "val",
            Mode::Test => "test",
        }
    }

    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Train)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Online mean: `mean += (value - mean) / (n + 1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    mean: f64,
    count: usize,
}

impl RunningMean {
    pub fn update(&mut self, value: f64) {
        self.mean += (value - self.mean) / (self.count + 1) as f64;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Everything one loop produced, in batch arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochResult {
    pub mode: Mode,
    pub structures: Vec<StructureId>,
    pub logits: Vec<f32>,
    pub preds: Vec<u8>,
    pub labels: Vec<Label>,
    /// Mean over batches of the mean per-example loss.
    pub mean_loss: f64,
    pub mean_accuracy: f64,
    pub batches: usize,
    /// The stream ended before the planned batch count.
    pub exhausted: bool,
}

impl EpochResult {
    fn empty(mode: Mode) -> Self {
        Self {
            mode,
            structures: Vec::new(),
            logits: Vec::new(),
            preds: Vec::new(),
            labels: Vec::new(),
            mean_loss: 0.0,
            mean_accuracy: 0.0,
            batches: 0,
            exhausted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Runs loops with fixed loss and optimisation settings.
#[derive(Debug, Clone)]
pub struct Evaluator {
    loss: WeightedCrossEntropy,
    training_dropout: DropoutRates,
    learning_rate: f64,
}

impl Evaluator {
    pub fn new(loss: WeightedCrossEntropy, training_dropout: DropoutRates, learning_rate: f64) -> Self {
        Self {
            loss,
            training_dropout,
            learning_rate,
        }
    }

    /// Settings of a run: positives are weighted by the training
    /// negative-to-positive ratio (at least 1).
    pub fn from_config(model: &ModelConfig, sample: &SampleConfig) -> Self {
        let pos_weight = sample.training.neg_to_pos_ratio.max(1) as f32;
        Self::new(
            WeightedCrossEntropy::new(pos_weight),
            model.training_dropout(),
            model.learning_rate,
        )
    }

    /// Run up to `num_batches` batches, stopping early when the source is
    /// exhausted.
    pub fn run(
        &self,
        model: &mut dyn Model,
        batches: &mut dyn BatchSource,
        mode: Mode,
        num_batches: u64,
    ) -> Result<EpochResult, PpiError> {
        let dropout = if mode.is_training() {
            self.training_dropout
        } else {
            DropoutRates::zero()
        };
        let progress_every = if num_batches == u64::MAX {
            100
        } else {
            (num_batches / 10).max(1)
        };

        let mut result = EpochResult::empty(mode);
        let mut loss_mean = RunningMean::default();
        let mut acc_mean = RunningMean::default();

        for i in 0..num_batches {
            let Some(batch) = batches.next_batch()? else {
                tracing::info!(mode = %mode, iteration = i, "End of {mode} dataset at iteration {i}");
                result.exhausted = num_batches != u64::MAX;
                break;
            };

            let logits = model.forward(&batch.grids, mode.is_training(), &dropout)?;
            if logits.len() != batch.len() {
                return Err(PpiError::model(format!(
                    "model returned {} logits for a batch of {}",
                    logits.len(),
                    batch.len()
                )));
            }
            let losses = self.loss.per_example(&logits, &batch.labels)?;
            if mode.is_training() {
                let grads = self.loss.logit_gradients(&logits, &batch.labels)?;
                model.backward(&batch.grids, &grads, self.learning_rate)?;
            }

            let preds: Vec<u8> = logits.iter().map(|&x| round_prediction(x)).collect();
            let batch_loss = losses.iter().map(|&l| f64::from(l)).sum::<f64>() / losses.len() as f64;
            loss_mean.update(batch_loss);
            acc_mean.update(f64::from(batch_accuracy(&preds, &batch.labels)));

            result.structures.extend(batch.structures);
            result.labels.extend(batch.labels);
            result.logits.extend(logits);
            result.preds.extend(preds);
            result.batches += 1;

            if result.batches as u64 % progress_every == 0 {
                tracing::info!(
                    mode = %mode,
                    batch = result.batches,
                    planned = num_batches,
                    loss = loss_mean.mean(),
                    acc = acc_mean.mean(),
                    "{mode} loss: {:6.6}; acc: {:6.4}",
                    loss_mean.mean(),
                    acc_mean.mean()
                );
            } else {
                tracing::debug!(mode = %mode, batch = result.batches, loss = batch_loss, "Batch done");
            }
        }

        result.mean_loss = loss_mean.mean();
        result.mean_accuracy = acc_mean.mean();
        Ok(result)
    }
}
