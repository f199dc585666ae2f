//! Class-weighted sigmoid cross-entropy.

use crate::data::example::Label;
use crate::error::PpiError;

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Rounded prediction for a logit; a probability of exactly 0.5 rounds down.
pub fn round_prediction(logit: f32) -> u8 {
    u8::from(sigmoid(logit) > 0.5)
}

/// Fraction of predictions on the same side of 0.5 as their label.
pub fn batch_accuracy(predictions: &[u8], labels: &[Label]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|&(&pred, label)| (pred > 0) == label.is_positive())
        .count();
    correct as f32 / labels.len() as f32
}

/// Positive-weighted cross-entropy on logits, renormalised per batch.
///
/// Raw per-example losses are scaled by `batch_size / effective_weight` with
/// `effective_weight = num_positive * pos_weight + num_negative`, so the batch
/// mean stays comparable across different negative-to-positive ratios.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedCrossEntropy {
    pub pos_weight: f32,
}

impl WeightedCrossEntropy {
    pub fn new(pos_weight: f32) -> Self {
        Self { pos_weight }
    }

    /// Renormalised loss of each example.
    pub fn per_example(&self, logits: &[f32], labels: &[Label]) -> Result<Vec<f32>, PpiError> {
        let effective = self.effective_weight(logits, labels)?;
        let scale = labels.len() as f32 / effective;
        Ok(logits
            .iter()
            .zip(labels)
            .map(|(&x, &label)| self.raw(x, label) * scale)
            .collect())
    }

    /// Gradient of the mean renormalised loss with respect to each logit.
    pub fn logit_gradients(&self, logits: &[f32], labels: &[Label]) -> Result<Vec<f32>, PpiError> {
        let effective = self.effective_weight(logits, labels)?;
        Ok(logits
            .iter()
            .zip(labels)
            .map(|(&x, &label)| {
                let z = label.as_f32();
                let l = 1.0 + (self.pos_weight - 1.0) * z;
                ((1.0 - z) + l * (sigmoid(x) - 1.0)) / effective
            })
            .collect())
    }

    fn raw(&self, x: f32, label: Label) -> f32 {
        let z = label.as_f32();
        let l = 1.0 + (self.pos_weight - 1.0) * z;
        (1.0 - z) * x + l * ((-x.abs()).exp().ln_1p() + (-x).max(0.0))
    }

    fn effective_weight(&self, logits: &[f32], labels: &[Label]) -> Result<f32, PpiError> {
        if logits.len() != labels.len() {
            return Err(PpiError::model(format!(
                "{} logits for {} labels",
                logits.len(),
                labels.len()
            )));
        }
        let positives = labels.iter().filter(|l| l.is_positive()).count() as f32;
        let negatives = labels.len() as f32 - positives;
        let effective = positives * self.pos_weight + negatives;
        if effective <= 0.0 {
            return Err(PpiError::model(format!(
                "batch has no effective weight (pos_weight {}, {} examples)",
                self.pos_weight,
                labels.len()
            )));
        }
        Ok(effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_unit_weight_is_plain_cross_entropy() {
        let loss = WeightedCrossEntropy::new(1.0);
        let values = loss
            .per_example(&[0.0, 2.0], &[Label::Positive, Label::Negative])
            .unwrap();
        assert!(close(values[0], std::f32::consts::LN_2));
        // -ln(1 - sigmoid(2))
        assert!(close(values[1], (1.0 + 2.0f32.exp()).ln()));
    }

    #[test]
    fn test_renormalisation() {
        let loss = WeightedCrossEntropy::new(3.0);
        let labels = [Label::Positive, Label::Negative, Label::Negative, Label::Negative];
        let logits = [0.0; 4];
        let values = loss.per_example(&logits, &labels).unwrap();

        // effective weight = 1 * 3 + 3 = 6; scale = 4 / 6
        let scale = 4.0 / 6.0;
        assert!(close(values[0], 3.0 * std::f32::consts::LN_2 * scale));
        assert!(close(values[1], std::f32::consts::LN_2 * scale));
        let mean: f32 = values.iter().sum::<f32>() / 4.0;
        assert!(close(mean, std::f32::consts::LN_2));
    }

    #[test]
    fn test_extreme_logits_are_finite() {
        let loss = WeightedCrossEntropy::new(2.0);
        let values = loss
            .per_example(&[80.0, -80.0], &[Label::Negative, Label::Positive])
            .unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let loss = WeightedCrossEntropy::new(2.5);
        let labels = [Label::Positive, Label::Negative, Label::Positive];
        let logits = [0.3f32, -1.2, 2.0];
        let grads = loss.logit_gradients(&logits, &labels).unwrap();

        let mean = |xs: &[f32]| {
            let v = loss.per_example(xs, &labels).unwrap();
            v.iter().sum::<f32>() / v.len() as f32
        };
        let h = 1e-2;
        for i in 0..logits.len() {
            let mut up = logits;
            let mut down = logits;
            up[i] += h;
            down[i] -= h;
            let numeric = (mean(&up) - mean(&down)) / (2.0 * h);
            assert!(
                (numeric - grads[i]).abs() < 1e-3,
                "logit {i}: numeric {numeric} vs analytic {}",
                grads[i]
            );
        }
    }

    #[test]
    fn test_zero_effective_weight_is_error() {
        let loss = WeightedCrossEntropy::new(0.0);
        assert!(loss.per_example(&[0.1], &[Label::Positive]).is_err());
        assert!(loss.per_example(&[0.1, 0.2], &[Label::Positive]).is_err());
    }

    #[test]
    fn test_accuracy_and_rounding() {
        assert_eq!(round_prediction(0.2), 1);
        assert_eq!(round_prediction(-0.2), 0);
        assert_eq!(round_prediction(0.0), 0);
        let acc = batch_accuracy(
            &[1, 0, 1, 0],
            &[Label::Positive, Label::Negative, Label::Negative, Label::Negative],
        );
        assert!(close(acc, 0.75));
    }
}
