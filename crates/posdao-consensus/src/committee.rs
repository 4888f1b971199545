// COMMITTEE SIZING & WEIGHTED ELECTION
// How many validators to elect for a candidate count, and which ones.
//
// SAFETY INVARIANTS:
// 1. The sizing table is monotone: more candidates never shrink the committee
// 2. The committee never exceeds the candidate count or max_validators
// 3. Election is a pure function of (candidates, weights, seed)
// 4. A candidate is drawn at most once

use posdao_core::{Address, BlockHash};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SizingError {
    #[error("sizing table must start with a threshold of 1 and grow strictly in both columns")]
    NotMonotone,
    #[error("max validators must be > 0")]
    ZeroMax,
}

/// Step table mapping "at least N candidates" to a committee size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeSizing {
    /// (min_candidates, committee_size), ascending
    steps: Vec<(usize, usize)>,
    max_validators: usize,
}

impl CommitteeSizing {
    pub fn new(steps: Vec<(usize, usize)>, max_validators: usize) -> Result<Self, SizingError> {
        if max_validators == 0 {
            return Err(SizingError::ZeroMax);
        }
        let starts_at_one = steps.first().map(|(min, _)| *min == 1).unwrap_or(false);
        let grows = steps.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 < w[1].1);
        let feasible = steps.iter().all(|(min, size)| *size >= 1 && size <= min);
        if !starts_at_one || !grows || !feasible {
            return Err(SizingError::NotMonotone);
        }
        Ok(CommitteeSizing { steps, max_validators })
    }

    /// Byzantine sweet spots: below 4 candidates everyone is elected, from
    /// there on the committee is the largest 3f+1 the candidate count allows.
    pub fn byzantine_sweet_spots(max_validators: usize) -> Self {
        let mut steps = vec![(1, 1), (2, 2), (3, 3)];
        let mut size = 4;
        while size <= max_validators.max(4) {
            steps.push((size, size));
            size += 3;
        }
        CommitteeSizing { steps, max_validators: max_validators.max(1) }
    }

    pub fn max_validators(&self) -> usize {
        self.max_validators
    }

    pub fn steps(&self) -> &[(usize, usize)] {
        &self.steps
    }

    /// Committee size for `candidates` eligible pools.
    pub fn committee_size(&self, candidates: usize) -> usize {
        self.steps
            .iter()
            .rev()
            .find(|(min, _)| candidates >= *min)
            .map(|(_, size)| *size)
            .unwrap_or(0)
            .min(self.max_validators)
            .min(candidates)
    }
}

/// Deterministic draw value `i` from a seed.
fn draw(seed: &BlockHash, round: u64, modulo: u128) -> u128 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(round.to_be_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(head) % modulo
}

/// Weighted sampling without replacement. Each round picks one candidate
/// with probability weight / remaining_total and removes it from the pool.
/// Zero-weight candidates are never drawn.
pub fn elect_weighted(candidates: &[(Address, u128)], count: usize, seed: &BlockHash) -> Vec<Address> {
    let mut pool: Vec<(Address, u128)> = candidates.iter().copied().filter(|(_, w)| *w > 0).collect();
    let mut total: u128 = pool.iter().fold(0u128, |acc, (_, w)| acc.saturating_add(*w));
    let mut elected = Vec::with_capacity(count.min(pool.len()));

    let mut round = 0u64;
    while elected.len() < count && !pool.is_empty() && total > 0 {
        let target = draw(seed, round, total);
        let mut acc = 0u128;
        let mut picked = pool.len() - 1;
        for (idx, (_, weight)) in pool.iter().enumerate() {
            acc = acc.saturating_add(*weight);
            if acc > target {
                picked = idx;
                break;
            }
        }
        let (address, weight) = pool.swap_remove(picked);
        total -= weight;
        elected.push(address);
        round += 1;
    }
    elected
}
