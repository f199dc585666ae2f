//! Fixed-size batching of example streams, with optional background prefetch.

use crate::data::example::{Example, GridPair, Label, StructureId};
use crate::data::stream::ExampleStream;
use crate::error::PpiError;
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;

/// Batches held in flight by a [`Prefetcher`].
pub const PREFETCH_DEPTH: usize = 8;

/// Consecutive examples grouped for one model step, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub structures: Vec<StructureId>,
    pub grids: Vec<GridPair>,
    pub labels: Vec<Label>,
}

impl Batch {
    fn with_capacity(n: usize) -> Self {
        Self {
            structures: Vec::with_capacity(n),
            grids: Vec::with_capacity(n),
            labels: Vec::with_capacity(n),
        }
    }

    fn push(&mut self, example: Example) {
        self.structures.push(example.structure);
        self.grids.push(example.grids);
        self.labels.push(example.label);
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Pull-based source of batches.
///
/// `Ok(None)` means the underlying stream is exhausted; that is an ordinary
/// outcome, not an error.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Option<Batch>, PpiError>;
}

/// Groups consecutive examples into batches of `batch_size`. The final batch of
/// a finite stream may be smaller.
pub struct BatchAssembler<I> {
    examples: I,
    batch_size: usize,
}

impl<I> BatchAssembler<I>
where
    I: Iterator<Item = Result<Example, PpiError>>,
{
    pub fn new(examples: I, batch_size: usize) -> Self {
        Self {
            examples,
            batch_size: batch_size.max(1),
        }
    }
}

impl<I> BatchSource for BatchAssembler<I>
where
    I: Iterator<Item = Result<Example, PpiError>>,
{
    fn next_batch(&mut self) -> Result<Option<Batch>, PpiError> {
        let mut batch = Batch::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.examples.next() {
                Some(example) => batch.push(example?),
                None => break,
            }
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

/// Assembles batches on a worker thread, keeping up to `depth` of them ready.
///
/// Batches are delivered in the order the worker produced them, so grouping
/// and ordering match the wrapped source exactly.
pub struct Prefetcher {
    receiver: Option<Receiver<Result<Batch, PpiError>>>,
    worker: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn spawn<S>(mut source: S, depth: usize) -> Result<Self, PpiError>
    where
        S: BatchSource + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(depth.max(1));
        let worker = std::thread::Builder::new()
            .name("ppi3d-prefetch".to_string())
            .spawn(move || {
                loop {
                    let next = match source.next_batch() {
                        Ok(Some(batch)) => Ok(batch),
                        Ok(None) => break,
                        Err(e) => Err(e),
                    };
                    let failed = next.is_err();
                    // The consumer hung up.
                    if sender.send(next).is_err() || failed {
                        break;
                    }
                }
                tracing::debug!("Prefetch worker finished");
            })?;
        Ok(Self {
            receiver: Some(receiver),
            worker: Some(worker),
        })
    }
}

impl BatchSource for Prefetcher {
    fn next_batch(&mut self) -> Result<Option<Batch>, PpiError> {
        let Some(receiver) = &self.receiver else {
            return Ok(None);
        };
        match receiver.recv() {
            Ok(batch) => batch.map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Unblock a worker waiting on a full channel before joining it.
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Prefetch worker panicked");
            }
        }
    }
}

/// Batch source for a stream: endless streams are prefetched in the
/// background, single-pass streams are assembled inline.
pub fn batches(
    stream: ExampleStream,
    batch_size: usize,
) -> Result<Box<dyn BatchSource + Send>, PpiError> {
    if stream.traversal().is_finite() {
        Ok(Box::new(BatchAssembler::new(stream, batch_size)))
    } else {
        Ok(Box::new(Prefetcher::spawn(
            BatchAssembler::new(stream, batch_size),
            PREFETCH_DEPTH,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stream::Traversal;
    use crate::data::stream::tests::{CountingSource, request};
    use std::sync::Arc;

    fn drain(source: &mut dyn BatchSource) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Some(batch) = source.next_batch().unwrap() {
            out.push(batch.structures.iter().map(|s| s.to_string()).collect());
        }
        out
    }

    fn single_pass(count: usize) -> ExampleStream {
        ExampleStream::open(
            Arc::new(CountingSource::new(count)),
            request(1),
            Traversal::SinglePass,
        )
        .unwrap()
    }

    #[test]
    fn test_final_batch_may_be_short() {
        let mut assembler = BatchAssembler::new(single_pass(7), 4);
        let sizes: Vec<_> = drain(&mut assembler).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 3]);
        assert!(assembler.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_error_surfaces() {
        let examples = vec![
            Ok(single_pass(1).next().unwrap().unwrap()),
            Err(PpiError::dataset("truncated shard")),
        ];
        let mut assembler = BatchAssembler::new(examples.into_iter(), 4);
        assert!(matches!(assembler.next_batch(), Err(PpiError::Dataset(_))));
    }

    #[test]
    fn test_prefetch_preserves_grouping() {
        let inline = drain(&mut BatchAssembler::new(single_pass(11), 3));
        let mut prefetched = Prefetcher::spawn(BatchAssembler::new(single_pass(11), 3), 2).unwrap();
        assert_eq!(drain(&mut prefetched), inline);
        assert!(prefetched.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_dropping_endless_prefetcher_returns() {
        let stream = ExampleStream::open(
            Arc::new(CountingSource::new(5)),
            request(1),
            Traversal::Endless { shuffle: true },
        )
        .unwrap();
        let mut source = batches(stream, 2).unwrap();
        for _ in 0..20 {
            assert_eq!(source.next_batch().unwrap().unwrap().len(), 2);
        }
        drop(source);
    }
}
