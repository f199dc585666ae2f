//! Training orchestration: accounting, batching, loops, checkpoint selection and testing.

pub mod accounting;
pub mod batch;
pub mod checkpoint;
pub mod controller;
pub mod evaluator;
pub mod results;
pub mod run_info;
pub mod test_runner;

pub use accounting::ExampleBudget;
pub use batch::{Batch, BatchAssembler, BatchSource, Prefetcher};
pub use checkpoint::{CheckpointRef, CheckpointStore};
pub use controller::{
    EpochController, SelectedCheckpoint, SelectionState, StopReason, TrainingSummary,
};
pub use evaluator::{EpochResult, Evaluator, Mode};
pub use results::{ResultRow, ResultTable};
pub use run_info::{RunInfo, RunInfoWriter};
pub use test_runner::{RestoredRun, TestOutcome, TestRunner};
