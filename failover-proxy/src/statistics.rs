use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the proxy's request handling.
pub struct ProxyStatistics(Arc<ProxyStatisticsInner>);

impl Deref for ProxyStatistics {
    type Target = ProxyStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ProxyStatisticsInner {
    pub(crate) num_manager_commands: Counter,
    pub(crate) num_requests_proxied: Counter,
    pub(crate) num_failovers: Counter,
    pub(crate) num_backend_errors: Counter,
}

impl ProxyStatisticsInner {
    /// The number of manager protocol commands handled.
    pub fn num_manager_commands(&self) -> u64 {
        self.num_manager_commands.load(Ordering::Relaxed)
    }

    /// The number of client requests forwarded to a node.
    pub fn num_requests_proxied(&self) -> u64 {
        self.num_requests_proxied.load(Ordering::Relaxed)
    }

    /// The number of times a request was retried on another node.
    pub fn num_failovers(&self) -> u64 {
        self.num_failovers.load(Ordering::Relaxed)
    }

    /// The number of forwarded requests which failed to reach their node.
    pub fn num_backend_errors(&self) -> u64 {
        self.num_backend_errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
/// Live metrics around the listener's communication with its proxies.
pub struct ListenerStatistics(Arc<ListenerStatisticsInner>);

impl Deref for ListenerStatistics {
    type Target = ListenerStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ListenerStatisticsInner {
    pub(crate) num_commands_sent: Counter,
    pub(crate) num_command_failures: Counter,
    pub(crate) num_full_syncs: Counter,
}

impl ListenerStatisticsInner {
    /// The number of manager commands accepted by a proxy.
    pub fn num_commands_sent(&self) -> u64 {
        self.num_commands_sent.load(Ordering::Relaxed)
    }

    /// The number of manager commands which failed or were rejected.
    pub fn num_command_failures(&self) -> u64 {
        self.num_command_failures.load(Ordering::Relaxed)
    }

    /// The number of times a proxy was brought up to date from scratch.
    pub fn num_full_syncs(&self) -> u64 {
        self.num_full_syncs.load(Ordering::Relaxed)
    }
}
