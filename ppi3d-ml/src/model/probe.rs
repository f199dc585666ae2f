//! Pooled-feature logistic regression over grid pairs.
//!
//! Each grid of a pair is reduced to its per-channel mean occupancy and the
//! `2 * C` features feed a single linear unit trained by plain SGD. Only the
//! fully-connected dropout rate applies; it masks the pooled features.

use crate::data::example::GridPair;
use crate::error::PpiError;
use crate::model::{DropoutRates, Model};
use crate::persistence;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProbeParameters {
    channels: usize,
    weights: Vec<f32>,
    bias: f32,
}

pub struct LogisticProbe {
    params: ProbeParameters,
    rng: StdRng,
    /// Inverted-dropout masks of the last training forward, one per example.
    masks: Vec<Vec<f32>>,
}

impl LogisticProbe {
    pub fn new(channels: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = (0..2 * channels)
            .map(|_| rng.gen_range(-0.01f32..0.01))
            .collect();
        Self {
            params: ProbeParameters {
                channels,
                weights,
                bias: 0.0,
            },
            rng,
            masks: Vec::new(),
        }
    }

    pub fn weights(&self) -> &[f32] {
        &self.params.weights
    }

    pub fn bias(&self) -> f32 {
        self.params.bias
    }

    fn features(&self, pair: &GridPair) -> Result<Vec<f32>, PpiError> {
        if pair.channels() != self.params.channels {
            return Err(PpiError::model(format!(
                "probe expects {} channels, grid pair has {}",
                self.params.channels,
                pair.channels()
            )));
        }
        Ok(pair.channel_means())
    }

    fn dropout_mask(&mut self, rate: f32) -> Vec<f32> {
        let width = self.params.weights.len();
        if rate <= 0.0 {
            return vec![1.0; width];
        }
        let keep = f64::from(1.0 - rate);
        let scale = 1.0 / (1.0 - rate);
        (0..width)
            .map(|_| if self.rng.gen_bool(keep) { scale } else { 0.0 })
            .collect()
    }
}

impl Model for LogisticProbe {
    fn forward(
        &mut self,
        grids: &[GridPair],
        is_training: bool,
        dropout: &DropoutRates,
    ) -> Result<Vec<f32>, PpiError> {
        let rate = if is_training { dropout.fc } else { 0.0 };
        self.masks.clear();
        let mut logits = Vec::with_capacity(grids.len());
        for pair in grids {
            let features = self.features(pair)?;
            let mask = self.dropout_mask(rate);
            let logit = self.params.bias
                + features
                    .iter()
                    .zip(&mask)
                    .zip(&self.params.weights)
                    .map(|((f, m), w)| f * m * w)
                    .sum::<f32>();
            logits.push(logit);
            self.masks.push(mask);
        }
        Ok(logits)
    }

    fn backward(
        &mut self,
        grids: &[GridPair],
        logit_grads: &[f32],
        learning_rate: f64,
    ) -> Result<(), PpiError> {
        if grids.len() != logit_grads.len() || grids.len() != self.masks.len() {
            return Err(PpiError::model(format!(
                "backward over {} examples with {} gradients after a forward of {}",
                grids.len(),
                logit_grads.len(),
                self.masks.len()
            )));
        }
        let lr = learning_rate as f32;
        let mut weight_grads = vec![0.0f32; self.params.weights.len()];
        let mut bias_grad = 0.0f32;
        for ((pair, &g), mask) in grids.iter().zip(logit_grads).zip(&self.masks) {
            let features = self.features(pair)?;
            for ((acc, f), m) in weight_grads.iter_mut().zip(&features).zip(mask) {
                *acc += g * f * m;
            }
            bias_grad += g;
        }
        for (w, g) in self.params.weights.iter_mut().zip(&weight_grads) {
            *w -= lr * g;
        }
        self.params.bias -= lr * bias_grad;
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), PpiError> {
        persistence::write_json_atomic(path, &self.params)?;
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<(), PpiError> {
        let params: ProbeParameters = persistence::read_json(path)?
            .ok_or_else(|| PpiError::not_found(format!("probe parameters {}", path.display())))?;
        if params.channels != self.params.channels || params.weights.len() != 2 * params.channels {
            return Err(PpiError::model(format!(
                "checkpoint {} holds a {}-channel probe, expected {}",
                path.display(),
                params.channels,
                self.params.channels
            )));
        }
        self.params = params;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::example::Label;
    use crate::model::WeightedCrossEntropy;
    use tempfile::TempDir;

    fn pair(signal: f32) -> GridPair {
        GridPair::new(1, 2, vec![signal, 0.5, 0.5, signal]).unwrap()
    }

    #[test]
    fn test_eval_forward_is_deterministic() {
        let mut probe = LogisticProbe::new(2, 1);
        let grids = [pair(1.0), pair(0.0)];
        let dropout = DropoutRates {
            conv: 0.5,
            fc: 0.5,
            top_nn: 0.5,
        };
        let a = probe.forward(&grids, false, &dropout).unwrap();
        let b = probe.forward(&grids, false, &dropout).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sgd_separates_classes() {
        let mut probe = LogisticProbe::new(2, 7);
        let loss = WeightedCrossEntropy::new(1.0);
        let grids = [pair(1.0), pair(0.0), pair(0.9), pair(0.1)];
        let labels = [Label::Positive, Label::Negative, Label::Positive, Label::Negative];

        for _ in 0..500 {
            let logits = probe.forward(&grids, true, &DropoutRates::zero()).unwrap();
            let grads = loss.logit_gradients(&logits, &labels).unwrap();
            probe.backward(&grids, &grads, 1.0).unwrap();
        }
        let logits = probe.forward(&grids, false, &DropoutRates::zero()).unwrap();
        assert!(logits[0] > 0.0 && logits[2] > 0.0);
        assert!(logits[1] < 0.0 && logits[3] < 0.0);
    }

    #[test]
    fn test_backward_requires_matching_forward() {
        let mut probe = LogisticProbe::new(2, 1);
        let grids = [pair(1.0)];
        assert!(probe.backward(&grids, &[0.1], 0.1).is_err());
    }

    #[test]
    fn test_save_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.json");
        let trained = LogisticProbe::new(2, 3);
        trained.save(&path).unwrap();

        let mut fresh = LogisticProbe::new(2, 99);
        assert_ne!(fresh.weights(), trained.weights());
        fresh.restore(&path).unwrap();
        assert_eq!(fresh.weights(), trained.weights());

        let mut wrong = LogisticProbe::new(3, 1);
        assert!(wrong.restore(&path).is_err());
    }
}
