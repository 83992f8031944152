//! # Failover
//! Tooling for verifying that a clustering reverse proxy fails requests over
//! to a surviving node once a context is withdrawn.
//!
//! This is a convenience package which includes all of the sub-projects,
//! realistically you probably only want some of these:
//!
//! ### Features
//! - `failover-node` - Backend nodes hosting contexts and the lifecycle unit running them.
//! - `failover-proxy` - An in-process clustering proxy and the listener keeping it up to date.
//! - `failover-harness` - The convergence monitor, failover client and the scenario driving them.

#[cfg(feature = "failover-harness")]
pub use failover_harness as harness;
#[cfg(feature = "failover-node")]
pub use failover_node as node;
#[cfg(feature = "failover-proxy")]
pub use failover_proxy as proxy;
