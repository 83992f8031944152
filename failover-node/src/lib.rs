//! Backend node containers and the lifecycle unit keeping them alive.
//!
//! A [Node] hosts a set of [Context]s, each running an [Application], and
//! serves them over HTTP once started. Nodes are registered with a [Server]
//! which fans their lifecycle changes out to every [LifecycleListener], this
//! is how the proxy eventually learns about them.

#[macro_use]
extern crate tracing;

mod application;
mod connector;
mod context;
mod error;
mod event;
mod node;
mod server;
mod session;
mod statistics;

pub use application::{AppRequest, Application, MyCount};
pub use context::{Context, ContextInfo};
pub use error::{LifecycleError, NodeError};
pub use event::{LifecycleListener, NodeEvent, NodeInfo};
pub use node::{Node, NodeIdentity, NodeState};
pub use server::{LifecycleExit, Server, ServerLifecycle, DEFAULT_GRACE_PERIOD};
pub use session::{
    new_session_id,
    route_from_session_id,
    session_id_from_cookie,
    session_id_from_set_cookie,
    strip_session_cookie,
    Session,
    SESSION_COOKIE,
};
pub use statistics::NodeStatistics;
