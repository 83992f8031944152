use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around a node's connectors.
pub struct NodeStatistics(Arc<NodeStatisticsInner>);

impl Deref for NodeStatistics {
    type Target = NodeStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct NodeStatisticsInner {
    /// The number of requests answered by one of the node's contexts.
    pub(crate) num_requests_served: Counter,
    /// The number of requests which matched no hosted context.
    pub(crate) num_not_found: Counter,
    /// The number of sessions the node has created.
    pub(crate) num_sessions_created: Counter,
}

impl NodeStatisticsInner {
    /// The number of requests answered by one of the node's contexts.
    pub fn num_requests_served(&self) -> u64 {
        self.num_requests_served.load(Ordering::Relaxed)
    }

    /// The number of requests which matched no hosted context.
    pub fn num_not_found(&self) -> u64 {
        self.num_not_found.load(Ordering::Relaxed)
    }

    /// The number of sessions the node has created.
    pub fn num_sessions_created(&self) -> u64 {
        self.num_sessions_created.load(Ordering::Relaxed)
    }
}
