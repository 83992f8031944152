use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::ContextInfo;
use crate::node::NodeIdentity;

#[derive(Debug, Clone)]
/// The details of a node which has just started serving.
pub struct NodeInfo {
    pub identity: NodeIdentity,
    /// The address of the node's first connector.
    pub addr: SocketAddr,
    pub contexts: Vec<ContextInfo>,
}

#[derive(Debug, Clone)]
/// A change in a node's lifecycle or hosted contexts.
pub enum NodeEvent {
    Started(NodeInfo),
    Stopping(NodeIdentity),
    /// The node was taken off the server before it stopped.
    Removed(NodeIdentity),
    ContextAdded {
        node: NodeIdentity,
        context: ContextInfo,
    },
    ContextRemoved {
        node: NodeIdentity,
        path: String,
    },
    ContextEnabled {
        node: NodeIdentity,
        path: String,
    },
    ContextDisabled {
        node: NodeIdentity,
        path: String,
    },
}

impl NodeEvent {
    /// The node the event originated from.
    pub fn node(&self) -> &NodeIdentity {
        match self {
            NodeEvent::Started(info) => &info.identity,
            NodeEvent::Stopping(node) => node,
            NodeEvent::Removed(node) => node,
            NodeEvent::ContextAdded { node, .. } => node,
            NodeEvent::ContextRemoved { node, .. } => node,
            NodeEvent::ContextEnabled { node, .. } => node,
            NodeEvent::ContextDisabled { node, .. } => node,
        }
    }
}

/// Observes the nodes registered with a [crate::Server].
///
/// Events are delivered synchronously from within the node operation that
/// caused them, implementations must hand them off rather than block.
pub trait LifecycleListener: Send + Sync + 'static {
    fn on_event(&self, event: NodeEvent);
}

#[derive(Clone, Default)]
/// The set of listeners events are fanned out to.
pub(crate) struct EventSink {
    listeners: Arc<RwLock<Vec<Arc<dyn LifecycleListener>>>>,
}

impl EventSink {
    pub(crate) fn add(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
