use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use failover_proxy::{ClusterListener, ClusterSnapshot};
use tokio::time::{sleep, timeout, Instant};

use crate::error::MonitorError;

const DEFAULT_POLL_INTERVAL: Duration = if cfg!(test) {
    Duration::from_millis(20)
} else {
    Duration::from_secs(1)
};
const DEFAULT_QUERY_TIMEOUT: Duration = if cfg!(test) {
    Duration::from_millis(200)
} else {
    Duration::from_secs(5)
};

#[async_trait]
/// The source of truth about what the proxy currently knows.
pub trait ConvergenceOracle: Send + Sync + 'static {
    /// Returns `true` once the proxy acknowledges the listener.
    async fn ping(&self) -> anyhow::Result<bool>;

    /// Fetches the proxy's current view of the cluster.
    async fn snapshot(&self) -> anyhow::Result<ClusterSnapshot>;

    /// Releases whatever the oracle holds onto.
    async fn stop(&self);
}

#[async_trait]
impl ConvergenceOracle for ClusterListener {
    async fn ping(&self) -> anyhow::Result<bool> {
        let response = ClusterListener::ping(self).await?;
        Ok(response.contains("PING-RSP"))
    }

    async fn snapshot(&self) -> anyhow::Result<ClusterSnapshot> {
        Ok(self.proxy_info().await?)
    }

    async fn stop(&self) {
        ClusterListener::stop(self).await
    }
}

#[derive(Debug, Copy, Clone)]
/// How often the monitor polls and how long a single poll may take.
pub struct PollPolicy {
    pub interval: Duration,
    pub query_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    /// The number of polls which fit within `timeout`, at least one.
    pub fn attempts(&self, timeout: Duration) -> u32 {
        let interval = self.interval.as_millis().max(1);
        let attempts = (timeout.as_millis() + interval - 1) / interval;
        attempts.clamp(1, u32::MAX as u128) as u32
    }
}

/// Observes a proxy until its view of the cluster matches what is expected.
///
/// Every wait is bounded, a proxy which never answers makes the wait report
/// failure rather than hang.
pub struct ClusterMonitor<O: ConvergenceOracle> {
    oracle: O,
    policy: PollPolicy,
    stopped: AtomicBool,
}

impl<O: ConvergenceOracle> ClusterMonitor<O> {
    pub fn new(oracle: O, policy: PollPolicy) -> Self {
        Self {
            oracle,
            policy,
            stopped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    #[inline]
    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Waits for the proxy to acknowledge the listener.
    ///
    /// Returns the number of attempts it took.
    pub async fn wait_for_initial_advertisement(
        &self,
        timeout: Duration,
    ) -> Result<u32, MonitorError> {
        let attempts = self.policy.attempts(timeout);

        for attempt in 1..=attempts {
            if self.is_stopped() {
                return Err(MonitorError::Stopped);
            }

            match self.bounded(self.oracle.ping()).await {
                Ok(true) => {
                    info!(attempts = attempt, "Proxy acknowledged the listener.");
                    return Ok(attempt);
                },
                Ok(false) => {
                    debug!(attempt = attempt, "Proxy answered without acknowledging.");
                },
                Err(e) => {
                    debug!(attempt = attempt, error = %e, "Proxy not reachable yet.");
                },
            }

            if attempt < attempts {
                sleep(self.policy.interval).await;
            }
        }

        warn!(attempts = attempts, waited = ?timeout, "Proxy never acknowledged the listener.");
        Err(MonitorError::TimedOut {
            waited: timeout,
            attempts,
        })
    }

    /// Waits for the proxy to report exactly the given node names.
    pub async fn wait_for_exact_node_set<I, S>(&self, expected: I, timeout: Duration) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected = expected.into_iter().map(Into::into).collect::<BTreeSet<_>>();
        self.wait_for(timeout, |snapshot| snapshot.node_names() == expected)
            .await
    }

    /// Waits for the proxy to report no nodes at all.
    pub async fn wait_for_no_nodes(&self, timeout: Duration) -> bool {
        self.wait_for_exact_node_set(Vec::<String>::new(), timeout)
            .await
    }

    /// Waits for the proxy to stop reporting `path` on `node`.
    pub async fn wait_for_context_absent(
        &self,
        node: &str,
        path: &str,
        timeout: Duration,
    ) -> bool {
        self.wait_for(timeout, |snapshot| !snapshot.has_context(node, path))
            .await
    }

    /// Stops the underlying oracle.
    ///
    /// Calling this more than once has no effect.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.oracle.stop().await;
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&ClusterSnapshot) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_stopped() {
                return false;
            }

            match self.bounded(self.oracle.snapshot()).await {
                Ok(snapshot) if predicate(&snapshot) => return true,
                Ok(snapshot) => {
                    trace!(nodes = ?snapshot.node_names(), "Proxy has not converged yet.");
                },
                Err(e) => {
                    debug!(error = %e, "Failed to fetch proxy state.");
                },
            }

            if Instant::now() + self.policy.interval > deadline {
                warn!(waited = ?timeout, "Proxy did not converge in time.");
                return false;
            }
            sleep(self.policy.interval).await;
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        timeout(self.policy.query_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("proxy query timed out after {:?}", self.policy.query_timeout))?
    }
}
