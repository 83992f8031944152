use std::fmt::Debug;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::node::NodeState;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Port {port} is unavailable: {source}")]
    /// The connector could not bind its port, typically because something
    /// else is already listening on it.
    PortUnavailable {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("A context is already registered at path {0:?}")]
    /// The node already hosts a context with this path.
    DuplicatePath(String),

    #[error("No context is registered at path {0:?}")]
    /// The node does not host a context with this path.
    NotFound(String),

    #[error("A node named {0:?} is already registered with the server")]
    /// Node names double as the proxy route and must be unique per server.
    DuplicateNode(String),

    #[error("Node {0:?} has no connector to serve requests on")]
    NoConnector(String),

    #[error("Node {node:?} cannot {action} while {state:?}")]
    /// The operation is not allowed in the node's current lifecycle state.
    InvalidState {
        node: String,
        action: &'static str,
        state: NodeState,
    },

    #[error("{0}")]
    /// An IO error has occurred,
    IO(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("A lifecycle unit is already running for this server")]
    /// Only one lifecycle unit may be active at a time.
    AlreadyRunning,

    #[error("No lifecycle unit is running")]
    NotRunning,

    #[error("The lifecycle unit did not exit within {0:?}")]
    /// The unit was aborted after exceeding its grace period. Nodes may
    /// still hold their ports.
    ShutdownTimeout(Duration),

    #[error("The lifecycle unit did not start its nodes within {0:?}")]
    StartTimeout(Duration),

    #[error("The lifecycle unit panicked: {0}")]
    Panicked(String),

    #[error("Failed to start the server: {0}")]
    Node(#[from] NodeError),
}
