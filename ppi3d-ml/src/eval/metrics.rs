//! Binary classification metrics over `(truth, probability)` pairs.
//!
//! A metric that is undefined for the given results (one class only, no
//! examples) is returned as [`PpiError::MetricUndefined`], never replaced by a
//! default value.

use crate::error::PpiError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Probabilities are clipped to `[EPS, 1 - EPS]` for log-loss.
const LOG_LOSS_EPS: f64 = 1e-15;

/// The five metrics reported for every split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerfReport {
    pub ap: f64,
    pub auroc: f64,
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub log_loss: f64,
}

impl PerfReport {
    /// Log the report under `title` ("Train Epoch 3", "Test", ...).
    pub fn log(&self, title: &str) {
        tracing::info!(
            title,
            ap = self.ap,
            auroc = self.auroc,
            accuracy = self.accuracy,
            balanced_accuracy = self.balanced_accuracy,
            log_loss = self.log_loss,
            "\n{}\n{}",
            title,
            self
        );
    }
}

impl fmt::Display for PerfReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Perf Metrics:")?;
        writeln!(f, "    AP: {:.3}", self.ap)?;
        writeln!(f, "    AUROC: {:.3}", self.auroc)?;
        writeln!(f, "    Accuracy: {:.3}", self.accuracy)?;
        writeln!(f, "    Balanced Accuracy: {:.3}", self.balanced_accuracy)?;
        write!(f, "    Log loss: {:.3}", self.log_loss)
    }
}

/// Compute every metric; the first undefined one is returned as an error.
pub fn compute_perf(scored: &[(u8, f64)]) -> Result<PerfReport, PpiError> {
    check_inputs(scored)?;
    Ok(PerfReport {
        ap: average_precision(scored)?,
        auroc: roc_auc(scored)?,
        accuracy: accuracy(scored)?,
        balanced_accuracy: balanced_accuracy(scored)?,
        log_loss: log_loss(scored)?,
    })
}

fn check_inputs(scored: &[(u8, f64)]) -> Result<(), PpiError> {
    if let Some((truth, p)) = scored
        .iter()
        .find(|(truth, p)| *truth > 1 || !(0.0..=1.0).contains(p))
    {
        return Err(PpiError::invalid_input(format!(
            "expected a 0/1 label and a probability, got ({truth}, {p})"
        )));
    }
    Ok(())
}

fn class_counts(scored: &[(u8, f64)]) -> (usize, usize) {
    let positives = scored.iter().filter(|(t, _)| *t == 1).count();
    (positives, scored.len() - positives)
}

fn threshold(p: f64) -> u8 {
    u8::from(p > 0.5)
}

/// Step-wise area under the precision-recall curve, one step per distinct
/// score.
pub fn average_precision(scored: &[(u8, f64)]) -> Result<f64, PpiError> {
    let (positives, _) = class_counts(scored);
    if positives == 0 {
        return Err(PpiError::metric_undefined(
            "average_precision",
            "no positive examples",
        ));
    }
    let mut sorted = scored.to_vec();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let total = positives as f64;
    let (mut tp, mut fp) = (0.0, 0.0);
    let mut prev_recall = 0.0;
    let mut ap = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let score = sorted[i].1;
        while i < sorted.len() && sorted[i].1 == score {
            if sorted[i].0 == 1 {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
            i += 1;
        }
        let recall = tp / total;
        let precision = tp / (tp + fp);
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    Ok(ap)
}

/// Area under the ROC curve via the rank-sum statistic, ties averaged.
pub fn roc_auc(scored: &[(u8, f64)]) -> Result<f64, PpiError> {
    let (positives, negatives) = class_counts(scored);
    if positives == 0 || negatives == 0 {
        return Err(PpiError::metric_undefined(
            "auroc",
            "only one class present in y_true",
        ));
    }
    let mut sorted = scored.to_vec();
    sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j < sorted.len() && sorted[j].1 == sorted[i].1 {
            j += 1;
        }
        // ranks i+1..=j share their average
        let rank = (i + 1 + j) as f64 / 2.0;
        let tied_positives = sorted[i..j].iter().filter(|(t, _)| *t == 1).count();
        positive_rank_sum += rank * tied_positives as f64;
        i = j;
    }
    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

pub fn accuracy(scored: &[(u8, f64)]) -> Result<f64, PpiError> {
    if scored.is_empty() {
        return Err(PpiError::metric_undefined("accuracy", "no examples"));
    }
    let correct = scored.iter().filter(|(t, p)| threshold(*p) == *t).count();
    Ok(correct as f64 / scored.len() as f64)
}

/// Mean recall over the classes present in the labels.
pub fn balanced_accuracy(scored: &[(u8, f64)]) -> Result<f64, PpiError> {
    if scored.is_empty() {
        return Err(PpiError::metric_undefined("balanced_accuracy", "no examples"));
    }
    let recalls: Vec<f64> = [0u8, 1]
        .into_iter()
        .filter_map(|class| {
            let members: Vec<_> = scored.iter().filter(|(t, _)| *t == class).collect();
            if members.is_empty() {
                return None;
            }
            let hits = members.iter().filter(|(_, p)| threshold(*p) == class).count();
            Some(hits as f64 / members.len() as f64)
        })
        .collect();
    Ok(recalls.iter().sum::<f64>() / recalls.len() as f64)
}

pub fn log_loss(scored: &[(u8, f64)]) -> Result<f64, PpiError> {
    let (positives, negatives) = class_counts(scored);
    if scored.is_empty() {
        return Err(PpiError::metric_undefined("log_loss", "no examples"));
    }
    if positives == 0 || negatives == 0 {
        return Err(PpiError::metric_undefined(
            "log_loss",
            "y_true contains only one label",
        ));
    }
    let total: f64 = scored
        .iter()
        .map(|&(t, p)| {
            let p = p.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
            if t == 1 { -p.ln() } else { -(1.0 - p).ln() }
        })
        .sum();
    Ok(total / scored.len() as f64)
}
