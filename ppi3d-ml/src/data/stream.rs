//! Lazy, restartable example streams.
//!
//! An [`ExampleSource`] produces one finite pass over a split. [`ExampleStream`]
//! turns passes into the traversal a phase needs: endless (restarting, and
//! buffer-shuffled when the source itself does not shuffle) for training and
//! validation, or exactly one deterministic pass for testing.

use crate::config::{RunConfig, SamplingPolicy, Split};
use crate::data::example::Example;
use crate::error::PpiError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// One pass worth of examples.
pub type ExampleIter = Box<dyn Iterator<Item = Result<Example, PpiError>> + Send>;

/// Elements held by the shuffle buffer of a non-shuffling endless stream.
pub const SHUFFLE_BUFFER_SIZE: usize = 1000;

/// Parameters of one pass over a split.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub policy: SamplingPolicy,
    /// Shuffle ensemble order and the regions drawn from each ensemble.
    pub shuffle: bool,
    /// Visits per ensemble within one pass.
    pub repeat: u64,
    pub max_num_ensembles: Option<u64>,
    /// Emit every region, ignoring `policy` (exhaustive testing).
    pub full_coverage: bool,
    pub seed: u64,
    pub shard_nums: Option<Vec<usize>>,
}

impl StreamRequest {
    /// Request for `split` under `config`.
    pub fn for_split(config: &RunConfig, split: Split, seed: u64) -> Self {
        let testing = split == Split::Test;
        Self {
            policy: config.sample.policy(split),
            shuffle: config.shuffle,
            repeat: config.sample.repeat(split),
            max_num_ensembles: config.sample.max_num_ensembles(split),
            full_coverage: testing && config.sample.full_test,
            seed,
            shard_nums: if testing {
                config.use_shard_nums.clone()
            } else {
                None
            },
        }
    }
}

/// Producer of examples for one split (the feature/grid pipeline).
pub trait ExampleSource: Send + Sync {
    /// Start one finite pass over the split.
    fn generate(&self, request: &StreamRequest) -> Result<ExampleIter, PpiError>;

    /// Number of keyed ensembles in the underlying store.
    fn num_keyed(&self) -> usize;
}

/// Whether a stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Restart the source forever. Without `shuffle`, examples pass through a
    /// seeded shuffle buffer.
    Endless { shuffle: bool },
    /// Exactly one pass, in source order.
    SinglePass,
}

impl Traversal {
    pub fn for_split(split: Split, shuffle: bool) -> Self {
        match split {
            Split::Train | Split::Val => Traversal::Endless { shuffle },
            Split::Test => Traversal::SinglePass,
        }
    }

    pub fn is_finite(&self) -> bool {
        matches!(self, Traversal::SinglePass)
    }
}

/// A lazy sequence of examples with an explicit restart.
pub struct ExampleStream {
    source: Arc<dyn ExampleSource>,
    request: StreamRequest,
    traversal: Traversal,
    pipeline: Pipeline,
}

enum Pipeline {
    Once(ExampleIter),
    Repeating(Repeating),
    Buffered(ShuffleBuffer<Repeating>),
}

impl ExampleStream {
    pub fn open(
        source: Arc<dyn ExampleSource>,
        request: StreamRequest,
        traversal: Traversal,
    ) -> Result<Self, PpiError> {
        let pipeline = build_pipeline(&source, &request, traversal)?;
        Ok(Self {
            source,
            request,
            traversal,
            pipeline,
        })
    }

    /// Discard buffered state and begin again from `seed`.
    pub fn restart(&mut self, seed: u64) -> Result<(), PpiError> {
        self.request.seed = seed;
        self.pipeline = build_pipeline(&self.source, &self.request, self.traversal)?;
        Ok(())
    }

    pub fn traversal(&self) -> Traversal {
        self.traversal
    }

    pub fn request(&self) -> &StreamRequest {
        &self.request
    }
}

impl Iterator for ExampleStream {
    type Item = Result<Example, PpiError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.pipeline {
            Pipeline::Once(pass) => pass.next(),
            Pipeline::Repeating(repeating) => repeating.next(),
            Pipeline::Buffered(buffered) => buffered.next(),
        }
    }
}

fn build_pipeline(
    source: &Arc<dyn ExampleSource>,
    request: &StreamRequest,
    traversal: Traversal,
) -> Result<Pipeline, PpiError> {
    Ok(match traversal {
        Traversal::SinglePass => Pipeline::Once(source.generate(request)?),
        Traversal::Endless { shuffle: true } => {
            Pipeline::Repeating(Repeating::start(Arc::clone(source), request.clone())?)
        }
        Traversal::Endless { shuffle: false } => Pipeline::Buffered(ShuffleBuffer::new(
            Repeating::start(Arc::clone(source), request.clone())?,
            SHUFFLE_BUFFER_SIZE,
            request.seed,
        )),
    })
}

/// Restarts the source with the same request whenever a pass ends.
struct Repeating {
    source: Arc<dyn ExampleSource>,
    request: StreamRequest,
    current: ExampleIter,
    yielded_this_pass: usize,
    passes: usize,
    done: bool,
}

impl Repeating {
    fn start(source: Arc<dyn ExampleSource>, request: StreamRequest) -> Result<Self, PpiError> {
        let current = source.generate(&request)?;
        Ok(Self {
            source,
            request,
            current,
            yielded_this_pass: 0,
            passes: 0,
            done: false,
        })
    }
}

impl Iterator for Repeating {
    type Item = Result<Example, PpiError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(item) = self.current.next() {
                self.yielded_this_pass += 1;
                return Some(item);
            }
            if self.yielded_this_pass == 0 {
                // An empty pass would make every later pass empty too.
                tracing::warn!(passes = self.passes, "Example source produced an empty pass");
                self.done = true;
                return None;
            }
            self.passes += 1;
            self.yielded_this_pass = 0;
            tracing::debug!(passes = self.passes, "Restarting example source");
            match self.source.generate(&self.request) {
                Ok(pass) => self.current = pass,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Reservoir-style shuffle: keeps up to `capacity` examples and emits a
/// uniformly chosen one each step.
struct ShuffleBuffer<I> {
    upstream: I,
    buffer: Vec<Example>,
    capacity: usize,
    rng: StdRng,
    upstream_done: bool,
}

impl<I> ShuffleBuffer<I>
where
    I: Iterator<Item = Result<Example, PpiError>>,
{
    fn new(upstream: I, capacity: usize, seed: u64) -> Self {
        Self {
            upstream,
            buffer: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            rng: StdRng::seed_from_u64(seed),
            upstream_done: false,
        }
    }
}

impl<I> Iterator for ShuffleBuffer<I>
where
    I: Iterator<Item = Result<Example, PpiError>>,
{
    type Item = Result<Example, PpiError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.upstream_done && self.buffer.len() < self.capacity {
            match self.upstream.next() {
                Some(Ok(example)) => self.buffer.push(example),
                Some(Err(e)) => return Some(Err(e)),
                None => self.upstream_done = true,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.buffer.len());
        Some(Ok(self.buffer.swap_remove(idx)))
    }
}
