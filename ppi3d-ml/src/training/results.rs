//! Per-example result tables.

use crate::error::PpiError;
use crate::model::sigmoid;
use crate::persistence;
use crate::training::evaluator::EpochResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// One evaluated example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub structure: String,
    #[serde(rename = "true")]
    pub truth: u8,
    pub pred: u8,
    pub logits: f32,
    pub ensemble: String,
    pub res0: String,
    pub res1: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultTable {
    rows: Vec<ResultRow>,
}

impl ResultTable {
    /// Tabulate a loop's output, splitting each structure id into its parts.
    pub fn from_epoch_result(result: &EpochResult) -> Result<Self, PpiError> {
        let rows = result
            .structures
            .iter()
            .zip(&result.labels)
            .zip(&result.preds)
            .zip(&result.logits)
            .map(|(((structure, label), &pred), &logit)| {
                let parts = structure.decompose()?;
                Ok(ResultRow {
                    structure: structure.to_string(),
                    truth: label.as_u8(),
                    pred,
                    logits: logit,
                    ensemble: parts.ensemble,
                    res0: parts.res0,
                    res1: parts.res1,
                })
            })
            .collect::<Result<Vec<_>, PpiError>>()?;
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `(truth, probability)` pairs for metric computation.
    pub fn scored(&self) -> Vec<(u8, f64)> {
        self.rows
            .iter()
            .map(|r| (r.truth, f64::from(sigmoid(r.logits))))
            .collect()
    }

    /// Number of rows per `(true, pred)` pair.
    pub fn confusion_counts(&self) -> ConfusionCounts {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry((row.truth, row.pred)).or_insert(0) += 1;
        }
        ConfusionCounts(counts)
    }

    pub fn write(&self, path: &Path) -> Result<(), PpiError> {
        persistence::write_json_atomic(path, self)?;
        tracing::debug!(path = %path.display(), rows = self.len(), "Result table written");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PpiError> {
        persistence::read_json(path)?
            .ok_or_else(|| PpiError::not_found(format!("result table {}", path.display())))
    }
}

/// Row counts grouped by `(true, pred)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfusionCounts(pub BTreeMap<(u8, u8), usize>);

impl ConfusionCounts {
    pub fn get(&self, truth: u8, pred: u8) -> usize {
        self.0.get(&(truth, pred)).copied().unwrap_or(0)
    }
}

impl fmt::Display for ConfusionCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "true  pred")?;
        for ((truth, pred), count) in &self.0 {
            writeln!(f, "{truth:<5} {pred:<5} {count:>8}")?;
        }
        Ok(())
    }
}
