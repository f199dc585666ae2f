//! Region sampling over a sharded ensemble store.

use crate::config::GridConfig;
use crate::data::example::{Example, GridPair, StructureId};
use crate::data::sharded::{EnsembleRecord, RecordLocation, ShardedDataset};
use crate::data::stream::{ExampleIter, ExampleSource, StreamRequest};
use crate::error::PpiError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;

/// Draws positive and negative regions from each ensemble of a store.
///
/// In capped mode an ensemble contributes at most
/// `max_pos_regions_per_ensemble` positives and `neg_to_pos_ratio` negatives
/// per drawn positive. The drawn subset depends only on the seed; `shuffle`
/// controls whether ensembles and regions are emitted in shuffled or storage
/// order.
pub struct RegionSampler {
    dataset: Arc<ShardedDataset>,
    edge: usize,
    channels: usize,
}

impl RegionSampler {
    pub fn new(dataset: Arc<ShardedDataset>, grid: &GridConfig) -> Self {
        Self {
            dataset,
            edge: grid.grid_edge_length(),
            channels: grid.channel_count(),
        }
    }
}

impl ExampleSource for RegionSampler {
    fn generate(&self, request: &StreamRequest) -> Result<ExampleIter, PpiError> {
        if !request.full_coverage && !request.policy.is_capped() {
            return Err(PpiError::config(format!(
                "cannot sample regions with max_pos_regions_per_ensemble={} and neg_to_pos_ratio={}",
                request.policy.max_pos_regions_per_ensemble, request.policy.neg_to_pos_ratio
            )));
        }
        if let Some(nums) = &request.shard_nums {
            if let Some(bad) = nums.iter().find(|&&n| n >= self.dataset.num_shards()) {
                return Err(PpiError::config(format!(
                    "shard {bad} requested but {} has {} shards",
                    self.dataset.path().display(),
                    self.dataset.num_shards()
                )));
            }
        }

        let mut rng = StdRng::seed_from_u64(request.seed);
        let locations = self.dataset.locations(request.shard_nums.as_deref());
        let cap = request
            .max_num_ensembles
            .map_or(usize::MAX, |cap| usize::try_from(cap).unwrap_or(usize::MAX));
        let mut order = Vec::new();
        for _ in 0..request.repeat {
            if order.len() >= cap || locations.is_empty() {
                break;
            }
            let mut pass = locations.clone();
            if request.shuffle {
                pass.shuffle(&mut rng);
            }
            order.extend(pass);
        }
        order.truncate(cap);

        Ok(Box::new(SampledRegions {
            dataset: Arc::clone(&self.dataset),
            order: order.into_iter(),
            pending: VecDeque::new(),
            rng,
            request: request.clone(),
            edge: self.edge,
            channels: self.channels,
        }))
    }

    fn num_keyed(&self) -> usize {
        self.dataset.num_keyed()
    }
}

struct SampledRegions {
    dataset: Arc<ShardedDataset>,
    order: std::vec::IntoIter<RecordLocation>,
    pending: VecDeque<Example>,
    rng: StdRng,
    request: StreamRequest,
    edge: usize,
    channels: usize,
}

impl SampledRegions {
    fn sample(&mut self, record: EnsembleRecord) -> Result<Vec<Example>, PpiError> {
        let chosen: Vec<usize> = if self.request.full_coverage {
            (0..record.regions.len()).collect()
        } else {
            let (mut positives, mut negatives): (Vec<usize>, Vec<usize>) =
                (0..record.regions.len()).partition(|&i| record.regions[i].label.is_positive());
            positives.shuffle(&mut self.rng);
            negatives.shuffle(&mut self.rng);

            let policy = self.request.policy;
            let max_pos = usize::try_from(policy.max_pos_regions_per_ensemble).unwrap_or(usize::MAX);
            let ratio = usize::try_from(policy.neg_to_pos_ratio).unwrap_or(usize::MAX);
            positives.truncate(max_pos);
            negatives.truncate(positives.len().saturating_mul(ratio));

            let mut chosen = positives;
            chosen.extend(negatives);
            if self.request.shuffle {
                chosen.shuffle(&mut self.rng);
            } else {
                chosen.sort_unstable();
            }
            chosen
        };

        let EnsembleRecord { ensemble, regions } = record;
        let mut regions: Vec<Option<_>> = regions.into_iter().map(Some).collect();
        chosen
            .into_iter()
            .filter_map(|i| regions[i].take())
            .map(|region| {
                Ok(Example {
                    structure: StructureId::from_parts(&ensemble, &region.res0, &region.res1),
                    grids: GridPair::new(self.edge, self.channels, region.grids)?,
                    label: region.label,
                })
            })
            .collect()
    }
}

impl Iterator for SampledRegions {
    type Item = Result<Example, PpiError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(example) = self.pending.pop_front() {
                return Some(Ok(example));
            }
            let location = self.order.next()?;
            let sampled = self
                .dataset
                .read(location)
                .and_then(|record| self.sample(record));
            match sampled {
                Ok(examples) => self.pending.extend(examples),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
