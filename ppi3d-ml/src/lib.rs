//! # ppi3d-ml: training and evaluation of 3D-CNN interface predictors
//!
//! Streams paired voxel grids of candidate residue pairs, batches them through
//! a [`model::Model`], and drives the epoch loop: dataset-size accounting,
//! best-validation checkpoint selection, early stopping, result tables and
//! classification metrics.

pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod model;
pub mod persistence;
pub mod training;

pub use config::{RunConfig, SampleConfig, Split};
pub use error::PpiError;
pub use eval::PerfReport;
pub use model::{LogisticProbe, Model};
pub use training::{EpochController, TestRunner};
