//! Model collaborator interface, loss and a reference implementation.

pub mod loss;
pub mod probe;

pub use loss::{WeightedCrossEntropy, batch_accuracy, round_prediction, sigmoid};
pub use probe::LogisticProbe;

use crate::data::example::GridPair;
use crate::error::PpiError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Dropout rates for the convolutional, fully-connected and top layers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DropoutRates {
    pub conv: f32,
    pub fc: f32,
    pub top_nn: f32,
}

impl DropoutRates {
    /// Rates used for validation and testing.
    pub fn zero() -> Self {
        Self::default()
    }
}

/// A binary classifier over grid pairs.
///
/// The evaluator calls `forward` for every batch and, in training mode only,
/// `backward` with the gradient of the mean batch loss with respect to the
/// logits it just returned.
pub trait Model: Send {
    /// Logits for each grid pair of the batch.
    fn forward(
        &mut self,
        grids: &[GridPair],
        is_training: bool,
        dropout: &DropoutRates,
    ) -> Result<Vec<f32>, PpiError>;

    /// Apply one optimisation step for the most recent training `forward`.
    fn backward(
        &mut self,
        grids: &[GridPair],
        logit_grads: &[f32],
        learning_rate: f64,
    ) -> Result<(), PpiError>;

    /// Persist parameters to `path`.
    fn save(&self, path: &Path) -> Result<(), PpiError>;

    /// Replace parameters with those stored at `path`.
    fn restore(&mut self, path: &Path) -> Result<(), PpiError>;
}
