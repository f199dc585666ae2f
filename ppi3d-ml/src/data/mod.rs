//! Example data: identifiers, grid tensors, the sharded store and streams over it.

pub mod example;
pub mod sampler;
pub mod sharded;
pub mod stream;

pub use example::{Example, GridPair, Label, StructureId, StructurePath};
pub use sampler::RegionSampler;
pub use sharded::{EnsembleRecord, RegionRecord, ShardedDataset};
pub use stream::{ExampleSource, ExampleStream, StreamRequest, Traversal};
