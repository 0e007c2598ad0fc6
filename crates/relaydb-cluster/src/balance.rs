//! Read-target selection.
//!
//! ROUND_ROBIN walks the UP set in stable id order with a global counter;
//! LEAST_LOADED picks the node with the fewest in-flight sessions at this
//! instant, breaking ties by lower id. In-flight accounting is kept by
//! guard objects so a panicked or cancelled read never leaks a count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{NodeId, ReadStrategy};

pub struct ReadBalancer {
    strategy: ReadStrategy,
    rr_counter: AtomicU64,
    inflight: Mutex<HashMap<NodeId, usize>>,
}

impl ReadBalancer {
    pub fn new(strategy: ReadStrategy) -> Self {
        ReadBalancer {
            strategy,
            rr_counter: AtomicU64::new(0),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Pick a target from the UP set; `None` when the set is empty.
    pub fn select(&self, up: &[NodeId]) -> Option<NodeId> {
        if up.is_empty() {
            return None;
        }
        let mut sorted: Vec<NodeId> = up.to_vec();
        sorted.sort_unstable();
        match self.strategy {
            ReadStrategy::RoundRobin => {
                let slot = self.rr_counter.fetch_add(1, Ordering::Relaxed) as usize;
                Some(sorted[slot % sorted.len()])
            }
            ReadStrategy::LeastLoaded => {
                let inflight = self.inflight.lock();
                sorted
                    .into_iter()
                    .min_by_key(|id| (inflight.get(id).copied().unwrap_or(0), *id))
            }
        }
    }

    /// Count a request against a node for its duration.
    pub fn track(self: &Arc<Self>, node_id: NodeId) -> LoadGuard {
        *self.inflight.lock().entry(node_id).or_insert(0) += 1;
        LoadGuard {
            balancer: Arc::clone(self),
            node_id,
        }
    }

    pub fn inflight(&self, node_id: NodeId) -> usize {
        self.inflight.lock().get(&node_id).copied().unwrap_or(0)
    }
}

/// Decrements the in-flight count on drop.
pub struct LoadGuard {
    balancer: Arc<ReadBalancer>,
    node_id: NodeId,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let mut inflight = self.balancer.inflight.lock();
        if let Some(count) = inflight.get_mut(&self.node_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_is_stable_and_fair() {
        let balancer = ReadBalancer::new(ReadStrategy::RoundRobin);
        // deliberately unsorted input
        let up = vec![3, 1, 2];
        let picks: Vec<NodeId> = (0..6).filter_map(|_| balancer.select(&up)).collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_round_robin_adjusts_to_up_set() {
        let balancer = ReadBalancer::new(ReadStrategy::RoundRobin);
        balancer.select(&[1, 2, 3]);
        let picks: Vec<NodeId> = (0..2).filter_map(|_| balancer.select(&[1, 3])).collect();
        assert_eq!(picks.len(), 2);
        assert!(picks.iter().all(|p| *p == 1 || *p == 3));
    }

    #[test]
    fn test_least_loaded_prefers_idle_then_lower_id() {
        let balancer = Arc::new(ReadBalancer::new(ReadStrategy::LeastLoaded));
        assert_eq!(balancer.select(&[1, 2, 3]), Some(1));

        let _g1 = balancer.track(1);
        let _g2 = balancer.track(2);
        assert_eq!(balancer.select(&[1, 2, 3]), Some(3));

        let _g3 = balancer.track(3);
        // all equal again; lowest id wins
        assert_eq!(balancer.select(&[1, 2, 3]), Some(1));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let balancer = Arc::new(ReadBalancer::new(ReadStrategy::LeastLoaded));
        {
            let _guard = balancer.track(2);
            assert_eq!(balancer.inflight(2), 1);
        }
        assert_eq!(balancer.inflight(2), 0);
    }

    #[test]
    fn test_empty_up_set() {
        let balancer = ReadBalancer::new(ReadStrategy::RoundRobin);
        assert_eq!(balancer.select(&[]), None);
    }
}
