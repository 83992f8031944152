use std::time::Duration;

use failover_node::{LifecycleError, NodeError};
use thiserror::Error;

use crate::client::{RequestResult, WindowReport};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("The proxy did not respond after {attempts} attempts over {waited:?}")]
    /// The proxy never acknowledged the listener within the attempt budget.
    TimedOut { waited: Duration, attempts: u32 },

    #[error("The monitor has been stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("The failover window did not finish within {0:?}")]
    JoinTimeout(Duration),

    #[error("The failover window panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
/// Problems with the scenario itself, detected before any traffic is sent.
pub enum ConfigurationError {
    #[error("At least two nodes are required, got {0}")]
    TooFewNodes(usize),

    #[error("Ports {0:?} are still in use")]
    PortsInUse(Vec<u16>),

    #[error("No node other than {0:?} hosts the context")]
    NoSurvivor(String),

    #[error("The baseline request was served by unknown node {0:?}")]
    UnknownNode(String),

    #[error("{0}")]
    Node(#[from] NodeError),

    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Error)]
/// The reason a scenario run failed, the first fatal cause wins.
pub enum HarnessError {
    #[error("Invalid scenario: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("The proxy did not converge on the {stage} within {waited:?}")]
    ConvergenceTimeout {
        stage: &'static str,
        waited: Duration,
    },

    #[error("The baseline request failed: {0}")]
    BaselineFailed(RequestResult),

    #[error("Requests failed during the failover window: {0}")]
    FailoverFailed(WindowReport),

    #[error("Failed to shut the nodes down: {0}")]
    Shutdown(LifecycleError),

    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("Ports {0:?} were not released after shutdown")]
    PortsNotReleased(Vec<u16>),
}
