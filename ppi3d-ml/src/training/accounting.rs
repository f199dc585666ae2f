//! Dataset-size accounting.
//!
//! The number of examples a split yields per epoch is estimated up front from
//! the sampling policy and bounds the number of batches a loop attempts. The
//! generator may produce fewer examples; the evaluator tolerates that.

use crate::config::{RunConfig, SamplingPolicy, Split};
use crate::error::PpiError;

/// Examples contributed by one ensemble visit under a capped policy.
pub fn multiplier(policy: &SamplingPolicy) -> Result<u64, PpiError> {
    if !policy.is_capped() {
        return Err(PpiError::config(format!(
            "example count is undefined for max_pos_regions_per_ensemble={} and neg_to_pos_ratio={}",
            policy.max_pos_regions_per_ensemble, policy.neg_to_pos_ratio
        )));
    }
    let max_pos = policy.max_pos_regions_per_ensemble as u64;
    let ratio = policy.neg_to_pos_ratio as u64;
    ratio
        .checked_add(1)
        .and_then(|per_pos| max_pos.checked_mul(per_pos))
        .ok_or_else(|| {
            PpiError::config(format!(
                "example count overflows for max_pos_regions_per_ensemble={max_pos} and neg_to_pos_ratio={ratio}"
            ))
        })
}

/// Structures consumed per epoch: the configured cap, else everything keyed.
pub fn num_structures(max_num_ensembles: Option<u64>, num_keyed: usize) -> u64 {
    max_num_ensembles.unwrap_or(num_keyed as u64)
}

/// `num_structures * repeat * multiplier`.
pub fn num_examples_per_epoch(
    policy: &SamplingPolicy,
    num_structures: u64,
    repeat: u64,
) -> Result<u64, PpiError> {
    let per_structure = multiplier(policy)?;
    num_structures
        .checked_mul(repeat)
        .and_then(|visits| visits.checked_mul(per_structure))
        .ok_or_else(|| {
            PpiError::config(format!(
                "example count overflows for {num_structures} structures repeated {repeat} times"
            ))
        })
}

/// Batches needed to cover `num_examples`; the last one may be short.
pub fn num_batches(num_examples: u64, batch_size: usize) -> u64 {
    num_examples.div_ceil(batch_size.max(1) as u64)
}

/// How many batches a loop over a split may attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExampleBudget {
    /// Estimated example count from the sampling multiplier.
    Bounded(u64),
    /// Every region of the split; run until the stream ends.
    Exhaustive,
}

impl ExampleBudget {
    /// Budget for `split` given the number of keyed ensembles in its store.
    pub fn for_split(config: &RunConfig, split: Split, num_keyed: usize) -> Result<Self, PpiError> {
        if split == Split::Test && config.sample.full_test {
            return Ok(ExampleBudget::Exhaustive);
        }
        let structures = num_structures(config.sample.max_num_ensembles(split), num_keyed);
        let examples = num_examples_per_epoch(
            &config.sample.policy(split),
            structures,
            config.sample.repeat(split),
        )?;
        Ok(ExampleBudget::Bounded(examples))
    }

    /// Planned batch count; `u64::MAX` for an exhaustive pass.
    pub fn num_batches(&self, batch_size: usize) -> u64 {
        match self {
            ExampleBudget::Bounded(examples) => num_batches(*examples, batch_size),
            ExampleBudget::Exhaustive => u64::MAX,
        }
    }

    pub fn num_examples(&self) -> Option<u64> {
        match self {
            ExampleBudget::Bounded(examples) => Some(*examples),
            ExampleBudget::Exhaustive => None,
        }
    }
}
