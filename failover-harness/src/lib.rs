//! A harness verifying that a clustering proxy fails requests over to a
//! surviving node once a context is withdrawn from the node serving it.
//!
//! The [Scenario] drives the whole run: it starts the nodes under a
//! [ServerLifecycle](failover_node::ServerLifecycle), waits for the proxy to
//! converge through a [ClusterMonitor], establishes session affinity with a
//! [FailoverClient] and finally checks every request made during the
//! failover window was answered by the survivor.

#[macro_use]
extern crate tracing;

mod client;
mod error;
mod monitor;
mod ports;
mod scenario;

pub use client::{
    AffinityRecord,
    ClientState,
    FailoverClient,
    FailoverWindow,
    RequestResult,
    WindowReport,
    DEFAULT_ATTEMPT_TIMEOUT,
};
pub use error::{ClientError, ConfigurationError, HarnessError, MonitorError};
pub use monitor::{ClusterMonitor, ConvergenceOracle, PollPolicy};
pub use ports::{test_port, wait_for_free_ports};
pub use scenario::{NodeSpec, Scenario, ScenarioConfig, ScenarioReport};
