use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use failover_node::{
    Application,
    LifecycleError,
    LifecycleExit,
    MyCount,
    Node,
    Server,
    ServerLifecycle,
    DEFAULT_GRACE_PERIOD,
};
use failover_proxy::{AdvertiseGroup, ClusterListener, ListenerConfig};

use crate::client::{FailoverClient, RequestResult, WindowReport, DEFAULT_ATTEMPT_TIMEOUT};
use crate::error::{ConfigurationError, HarnessError};
use crate::monitor::{ClusterMonitor, PollPolicy};
use crate::ports::{test_port, wait_for_free_ports};

const DEFAULT_ADVERTISEMENT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_LIFECYCLE_BUDGET: Duration = Duration::from_secs(3000);
const DEFAULT_FREE_PORTS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
/// A node taking part in the scenario.
pub struct NodeSpec {
    pub name: String,
    pub host: String,
    /// The port to serve on, `0` lets the OS pick one.
    pub port: u16,
    pub application: Arc<dyn Application>,
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("application", &self.application.name())
            .finish()
    }
}

impl NodeSpec {
    /// A node on the loopback interface running its own [MyCount].
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: "127.0.0.1".to_string(),
            port,
            application: Arc::new(MyCount::default()),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = application;
        self
    }
}

#[derive(Clone)]
pub struct ScenarioConfig {
    pub nodes: Vec<NodeSpec>,
    /// The context path every node hosts.
    pub context_path: String,
    /// The path requested through the proxy.
    pub request_path: String,
    /// The prefix every correct response starts with.
    pub signature: String,
    pub listener: ListenerConfig,
    pub poll_policy: PollPolicy,
    pub advertisement_timeout: Duration,
    pub convergence_timeout: Duration,
    pub request_timeout: Duration,
    pub window: Duration,
    /// How long the lifecycle unit keeps the nodes up unless stopped early.
    pub lifecycle_budget: Duration,
    pub grace_period: Duration,
    /// Check the node ports are free before starting and after teardown.
    pub check_ports: bool,
    pub free_ports_timeout: Duration,
}

impl ScenarioConfig {
    pub fn new(nodes: Vec<NodeSpec>, listener: ListenerConfig) -> Self {
        Self {
            nodes,
            context_path: "/test".to_string(),
            request_path: "/test/MyCount".to_string(),
            signature: "MyCount".to_string(),
            listener,
            poll_policy: PollPolicy::default(),
            advertisement_timeout: DEFAULT_ADVERTISEMENT_TIMEOUT,
            convergence_timeout: DEFAULT_CONVERGENCE_TIMEOUT,
            request_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            window: DEFAULT_WINDOW,
            lifecycle_budget: DEFAULT_LIFECYCLE_BUDGET,
            grace_period: DEFAULT_GRACE_PERIOD,
            check_ports: true,
            free_ports_timeout: DEFAULT_FREE_PORTS_TIMEOUT,
        }
    }

    /// Set the context hosted by every node and the path requested within it.
    pub fn with_paths(mut self, context_path: impl Into<String>, request_path: impl Into<String>) -> Self {
        self.context_path = context_path.into();
        self.request_path = request_path.into();
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = policy;
        self
    }

    pub fn with_advertisement_timeout(mut self, timeout: Duration) -> Self {
        self.advertisement_timeout = timeout;
        self
    }

    pub fn with_convergence_timeout(mut self, timeout: Duration) -> Self {
        self.convergence_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set how long the client keeps requesting after the context is removed.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_lifecycle_budget(mut self, budget: Duration) -> Self {
        self.lifecycle_budget = budget;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_check_ports(mut self, check_ports: bool) -> Self {
        self.check_ports = check_ports;
        self
    }

    /// The fixed ports requested by the nodes.
    fn fixed_ports(&self) -> Vec<u16> {
        self.nodes
            .iter()
            .map(|n| n.port)
            .filter(|port| *port != 0)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
/// What happened during a scenario run.
pub struct ScenarioReport {
    pub advertisement_attempts: u32,
    pub baseline: Option<RequestResult>,
    /// The node the context was removed from.
    pub withdrawn_node: Option<String>,
    pub survivors: Vec<String>,
    pub window: Option<WindowReport>,
    /// The node the client was pinned to once the window finished.
    pub final_node: Option<String>,
    pub ports: Vec<u16>,
    pub teardown_converged: bool,
}

/// Runs the failover scenario against a proxy.
///
/// The proxy is not owned by the scenario, it is discovered through the
/// advertisement group and addressed directly by the client.
pub struct Scenario {
    config: ScenarioConfig,
    proxy_addr: SocketAddr,
    group: AdvertiseGroup,
}

impl Scenario {
    pub fn new(config: ScenarioConfig, proxy_addr: SocketAddr, group: AdvertiseGroup) -> Self {
        Self {
            config,
            proxy_addr,
            group,
        }
    }

    /// Runs the scenario to completion.
    ///
    /// Teardown is always attempted once the nodes exist, the first fatal
    /// error becomes the verdict.
    pub async fn run(self) -> Result<ScenarioReport, HarnessError> {
        let config = &self.config;
        if config.nodes.len() < 2 {
            return Err(ConfigurationError::TooFewNodes(config.nodes.len()).into());
        }

        if config.check_ports {
            let fixed = config.fixed_ports();
            for port in fixed.iter() {
                wait_for_free_ports(*port, 1, config.free_ports_timeout)
                    .await
                    .map_err(ConfigurationError::PortsInUse)?;
            }
        }

        let server = Server::default();
        let mut report = ScenarioReport::default();
        let nodes = self.build_nodes(&mut report)?;
        for node in nodes.iter() {
            server
                .add_service(node.clone())
                .map_err(ConfigurationError::from)?;
        }

        let listener = ClusterListener::create(&server, config.listener.clone(), self.group.clone());
        let monitor = ClusterMonitor::new(listener, config.poll_policy);

        let mut lifecycle =
            ServerLifecycle::new(server).with_grace_period(config.grace_period);
        let started = match lifecycle.start(config.lifecycle_budget) {
            Ok(()) => lifecycle.wait_started(config.convergence_timeout).await,
            Err(e) => Err(e),
        };
        let outcome = match started {
            Ok(()) => self.exercise(&nodes, &monitor, &mut report).await,
            Err(e) => Err(ConfigurationError::from(e).into()),
        };

        let teardown = self.teardown(&mut lifecycle, &monitor, &mut report).await;

        match (outcome, teardown) {
            (Err(e), _) | (Ok(()), Err(e)) => {
                error!(error = %e, "Failover scenario failed.");
                Err(e)
            },
            (Ok(()), Ok(())) => {
                info!(
                    withdrawn = ?report.withdrawn_node,
                    survivor = ?report.final_node,
                    "Failover scenario passed."
                );
                Ok(report)
            },
        }
    }

    fn build_nodes(&self, report: &mut ScenarioReport) -> Result<Vec<Node>, ConfigurationError> {
        let mut nodes = Vec::with_capacity(self.config.nodes.len());

        for spec in self.config.nodes.iter() {
            let node = Node::create(spec.name.clone(), spec.host.clone());
            let addr = node.add_connector(spec.port)?;
            node.add_context(
                self.config.context_path.clone(),
                self.config.context_path.clone(),
                spec.application.clone(),
                true,
            )?;

            debug!(node = %spec.name, addr = %addr, "Built node.");
            report.ports.push(addr.port());
            nodes.push(node);
        }

        Ok(nodes)
    }

    async fn exercise(
        &self,
        nodes: &[Node],
        monitor: &ClusterMonitor<ClusterListener>,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let config = &self.config;

        report.advertisement_attempts = monitor
            .wait_for_initial_advertisement(config.advertisement_timeout)
            .await
            .map_err(|_| HarnessError::ConvergenceTimeout {
                stage: "initial advertisement",
                waited: config.advertisement_timeout,
            })?;

        let names = nodes.iter().map(|n| n.name().to_string()).collect::<Vec<_>>();
        if !monitor
            .wait_for_exact_node_set(names, config.convergence_timeout)
            .await
        {
            return Err(HarnessError::ConvergenceTimeout {
                stage: "node registration",
                waited: config.convergence_timeout,
            });
        }

        let mut client = FailoverClient::new(self.proxy_addr, config.signature.clone())
            .with_attempt_timeout(config.request_timeout);
        let baseline = client
            .request_once(&config.request_path, config.request_timeout, false)
            .await;
        report.baseline = Some(baseline.clone());
        if !baseline.ok {
            return Err(HarnessError::BaselineFailed(baseline));
        }

        let serving = match baseline.responding_node.as_deref() {
            Some(name) => nodes
                .iter()
                .find(|n| n.name() == name)
                .ok_or_else(|| ConfigurationError::UnknownNode(name.to_string()))?,
            None => return Err(HarnessError::BaselineFailed(baseline.clone())),
        };
        info!(node = %serving.name(), "Baseline served, withdrawing context.");

        serving
            .remove_context(&config.context_path)
            .map_err(ConfigurationError::from)?;
        report.withdrawn_node = Some(serving.name().to_string());

        report.survivors = nodes
            .iter()
            .filter(|n| n.has_context(&config.context_path))
            .map(|n| n.name().to_string())
            .collect();
        match report.survivors.as_slice() {
            [] => return Err(ConfigurationError::NoSurvivor(serving.name().to_string()).into()),
            [survivor] => client.set_node(survivor.clone()),
            _ => client.clear_node(),
        }
        client.exclude_node(serving.name());

        let window = client.run_failover_window(config.request_path.clone(), config.window);
        let (client, window_report) = window.join().await?;
        report.window = Some(window_report.clone());
        report.final_node = client.node().map(String::from);

        if !window_report.result_ok() {
            return Err(HarnessError::FailoverFailed(window_report));
        }

        Ok(())
    }

    async fn teardown(
        &self,
        lifecycle: &mut ServerLifecycle,
        monitor: &ClusterMonitor<ClusterListener>,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let config = &self.config;
        let mut first_error = None;

        if let Some(e) = shutdown_error(lifecycle.stop_early().await) {
            first_error.get_or_insert(e);
        }

        report.teardown_converged = monitor.wait_for_no_nodes(config.convergence_timeout).await;
        if !report.teardown_converged {
            first_error.get_or_insert(HarnessError::ConvergenceTimeout {
                stage: "node removal",
                waited: config.convergence_timeout,
            });
        }
        monitor.stop().await;

        if config.check_ports {
            let busy = report
                .ports
                .iter()
                .copied()
                .filter(|port| !test_port(*port))
                .collect::<Vec<_>>();
            if !busy.is_empty() {
                first_error.get_or_insert(HarnessError::PortsNotReleased(busy));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Turns the outcome of stopping the lifecycle unit into a verdict.
///
/// A unit whose nodes never started is a configuration problem, one which
/// was never running has nothing to report.
fn shutdown_error(result: Result<LifecycleExit, LifecycleError>) -> Option<HarnessError> {
    match result {
        Ok(exit) => {
            debug!(exit = ?exit, "Lifecycle unit stopped.");
            None
        },
        Err(LifecycleError::NotRunning) => None,
        Err(LifecycleError::Node(e)) => {
            warn!(error = %e, "Nodes failed while the lifecycle unit was running.");
            Some(ConfigurationError::Node(e).into())
        },
        Err(e) => Some(HarnessError::Shutdown(e)),
    }
}

#[cfg(test)]
mod tests {
    use failover_node::NodeError;

    use super::*;

    #[test]
    fn test_shutdown_verdict() {
        assert!(shutdown_error(Ok(LifecycleExit::Stopped)).is_none());
        assert!(shutdown_error(Err(LifecycleError::NotRunning)).is_none());

        let failed = shutdown_error(Err(LifecycleError::Node(NodeError::NoConnector(
            "node3".to_string(),
        ))));
        assert!(matches!(
            failed,
            Some(HarnessError::Configuration(ConfigurationError::Node(
                NodeError::NoConnector(_)
            )))
        ));

        let stuck = shutdown_error(Err(LifecycleError::ShutdownTimeout(Duration::from_secs(1))));
        assert!(matches!(
            stuck,
            Some(HarnessError::Shutdown(LifecycleError::ShutdownTimeout(_)))
        ));
    }
}
