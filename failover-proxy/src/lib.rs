//! An in-process clustering proxy and the cluster listener feeding it.
//!
//! The [ProxyServer] keeps a [ManagerTable] of nodes and their contexts,
//! updated through the manager protocol ([mcmp]), and forwards client
//! requests to a node hosting the requested path. Nodes never talk to the
//! proxy themselves: a [ClusterListener] registered with the node
//! [failover_node::Server] discovers proxies through their advertisements
//! and pushes every lifecycle change to them.

#[macro_use]
extern crate tracing;

mod advertise;
mod balancer;
mod error;
mod listener;
pub mod mcmp;
mod server;
mod snapshot;
mod statistics;
mod table;

pub use advertise::{
    digest,
    AdvertiseGroup,
    Advertisement,
    DEFAULT_ADVERTISE_FREQUENCY,
    DEFAULT_ADVERTISE_GROUP,
};
pub use balancer::{elect, BalancerConfig, Candidate, Election};
pub use error::{McmpError, ProxyError};
pub use listener::{
    ClusterListener,
    ListenerConfig,
    DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_STATUS_INTERVAL,
};
pub use server::{ProxyConfig, ProxyServer, DEFAULT_BACKEND_TIMEOUT};
pub use snapshot::{ClusterSnapshot, NodeSnapshot};
pub use statistics::{ListenerStatistics, ProxyStatistics};
pub use table::{ContextStatus, ManagerTable, NodeEntry, DEFAULT_BALANCER};
