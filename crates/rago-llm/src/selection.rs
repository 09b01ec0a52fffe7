//! Load-balancing policies
//!
//! Draws are deterministic: a shared counter walks the eligible set, so the
//! same sequence of requests against the same providers picks the same
//! providers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    #[default]
    WeightedRoundRobin,
    RoundRobin,
    LeastRecent,
}

/// Candidate view handed to [`pick`]
pub(crate) struct Candidate {
    pub weight: u32,
    /// Sequence stamp of the last selection (0 = never)
    pub last_used: u64,
}

/// Index of the chosen candidate; `candidates` must be non-empty
pub(crate) fn pick(policy: LoadBalancingPolicy, candidates: &[Candidate], draw: usize) -> usize {
    debug_assert!(!candidates.is_empty());
    match policy {
        LoadBalancingPolicy::RoundRobin => draw % candidates.len(),
        LoadBalancingPolicy::WeightedRoundRobin => {
            let total: u64 = candidates.iter().map(|c| c.weight as u64).sum();
            if total == 0 {
                return draw % candidates.len();
            }
            let mut slot = draw as u64 % total;
            for (index, candidate) in candidates.iter().enumerate() {
                let weight = candidate.weight as u64;
                if slot < weight {
                    return index;
                }
                slot -= weight;
            }
            candidates.len() - 1
        }
        LoadBalancingPolicy::LeastRecent => candidates
            .iter()
            .enumerate()
            .min_by_key(|(index, c)| (c.last_used, *index))
            .map(|(index, _)| index)
            .unwrap_or(0),
    }
}
