//! Examples: a structure id, a co-registered grid pair and a binary label.

use crate::error::PpiError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a residue pair, encoded as `ensemble/res0/res1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructureId(String);

/// The three components of a [`StructureId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructurePath {
    pub ensemble: String,
    pub res0: String,
    pub res1: String,
}

impl StructureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_parts(ensemble: &str, res0: &str, res1: &str) -> Self {
        Self(format!("{ensemble}/{res0}/{res1}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into ensemble and residue components.
    ///
    /// Splitting starts from the right, so an ensemble name may itself contain `/`.
    pub fn decompose(&self) -> Result<StructurePath, PpiError> {
        let mut parts = self.0.rsplitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(res1), Some(res0), Some(ensemble)) => Ok(StructurePath {
                ensemble: ensemble.to_string(),
                res0: res0.to_string(),
                res1: res1.to_string(),
            }),
            _ => Err(PpiError::dataset(format!(
                "structure id '{}' is not of the form ensemble/res0/res1",
                self.0
            ))),
        }
    }
}

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a residue pair forms an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Label {
    Negative,
    Positive,
}

impl Label {
    pub fn as_u8(self) -> u8 {
        match self {
            Label::Negative => 0,
            Label::Positive => 1,
        }
    }

    pub fn as_f32(self) -> f32 {
        f32::from(self.as_u8())
    }

    pub fn is_positive(self) -> bool {
        self == Label::Positive
    }
}

impl TryFrom<u8> for Label {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Label::Negative),
            1 => Ok(Label::Positive),
            other => Err(format!("label must be 0 or 1, got {other}")),
        }
    }
}

impl From<Label> for u8 {
    fn from(label: Label) -> u8 {
        label.as_u8()
    }
}

/// Two co-registered voxel grids of shape `[D, D, D, C]`, stored contiguously
/// as `[2, D, D, D, C]` in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPair {
    edge: usize,
    channels: usize,
    data: Vec<f32>,
}

impl GridPair {
    pub fn new(edge: usize, channels: usize, data: Vec<f32>) -> Result<Self, PpiError> {
        let expected = 2 * edge * edge * edge * channels;
        if data.len() != expected {
            return Err(PpiError::dataset(format!(
                "grid pair has {} values, expected {expected} for edge {edge} and {channels} channels",
                data.len()
            )));
        }
        Ok(Self {
            edge,
            channels,
            data,
        })
    }

    pub fn edge(&self) -> usize {
        self.edge
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// One grid of the pair (`0` or `1`).
    pub fn grid(&self, which: usize) -> &[f32] {
        let half = self.data.len() / 2;
        &self.data[which * half..(which + 1) * half]
    }

    /// Mean occupancy per channel, first grid's channels then the second's.
    pub fn channel_means(&self) -> Vec<f32> {
        let voxels = (self.edge * self.edge * self.edge).max(1) as f32;
        let mut means = vec![0.0f32; 2 * self.channels];
        for which in 0..2 {
            for voxel in self.grid(which).chunks_exact(self.channels) {
                for (c, value) in voxel.iter().enumerate() {
                    means[which * self.channels + c] += value;
                }
            }
        }
        for m in &mut means {
            *m /= voxels;
        }
        means
    }
}

/// One model input with its ground truth.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub structure: StructureId,
    pub grids: GridPair,
    pub label: Label,
}
