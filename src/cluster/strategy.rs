use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::node::Node;

/// Picks the node for the next attempt.
///
/// The cluster has already narrowed `candidates` to nodes the operation has
/// not tried, healthy ones first, so a selector only has to be fair.
pub trait NodeSelector: Send + Sync + 'static {
    fn select(&self, candidates: &[Arc<Node>]) -> Option<Arc<Node>>;
}

/// Rotates through candidates with one cursor shared by every caller.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeSelector for RoundRobin {
    fn select(&self, candidates: &[Arc<Node>]) -> Option<Arc<Node>> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[i]))
    }
}
