use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::application::Application;
use crate::connector::{Connector, RunningConnector};
use crate::context::{Context, ContextInfo};
use crate::error::NodeError;
use crate::event::{EventSink, NodeEvent, NodeInfo};
use crate::session::SessionStore;
use crate::statistics::NodeStatistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity {
    /// The unique name of the node, this is also the route the proxy
    /// knows the node by.
    pub name: String,
    /// The host the node's connectors bind to.
    pub host: String,
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

#[derive(Clone)]
/// A single backend server instance.
///
/// This is a cheap to clone handle, every clone refers to the same node.
pub struct Node(Arc<NodeInner>);

struct NodeInner {
    identity: NodeIdentity,
    state: Mutex<NodeState>,
    contexts: RwLock<Vec<Context>>,
    connectors: Mutex<Vec<Connector>>,
    running: Mutex<Vec<RunningConnector>>,
    sessions: SessionStore,
    statistics: NodeStatistics,
    sink: RwLock<Option<EventSink>>,
}

impl Node {
    /// Creates a new, stopped node.
    pub fn create(name: impl Into<String>, host: impl Into<String>) -> Self {
        let inner = NodeInner {
            identity: NodeIdentity {
                name: name.into(),
                host: host.into(),
            },
            state: Mutex::new(NodeState::Stopped),
            contexts: RwLock::default(),
            connectors: Mutex::default(),
            running: Mutex::default(),
            sessions: SessionStore::default(),
            statistics: NodeStatistics::default(),
            sink: RwLock::default(),
        };

        Self(Arc::new(inner))
    }

    #[inline]
    pub fn identity(&self) -> &NodeIdentity {
        &self.0.identity
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.identity.name
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.0.identity.host
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        *self.0.state.lock()
    }

    #[inline]
    /// Gets the live node statistics.
    pub fn statistics(&self) -> NodeStatistics {
        self.0.statistics.clone()
    }

    /// The number of sessions the node currently holds.
    pub fn num_active_sessions(&self) -> usize {
        self.0.sessions.len()
    }

    /// Binds a new connector on the given port.
    ///
    /// The port is bound immediately, if it is already in use elsewhere
    /// [NodeError::PortUnavailable] is returned. Passing `0` lets the OS pick
    /// a port, the bound address is returned either way.
    pub fn add_connector(&self, port: u16) -> Result<SocketAddr, NodeError> {
        self.ensure_state(NodeState::Stopped, "add a connector")?;

        let connector = Connector::bind(self.host(), port)?;
        let addr = connector.local_addr();
        self.0.connectors.lock().push(connector);

        debug!(node_id = %self.name(), addr = %addr, "Connector bound.");

        Ok(addr)
    }

    /// The addresses of every connector of the node.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.0
            .connectors
            .lock()
            .iter()
            .map(Connector::local_addr)
            .collect()
    }

    /// Registers a new context on the node.
    pub fn add_context(
        &self,
        path: impl Into<String>,
        mount: impl Into<String>,
        application: Arc<dyn Application>,
        enabled: bool,
    ) -> Result<(), NodeError> {
        let context = Context::new(path, mount, application, enabled);
        let info = context.info();

        {
            let mut contexts = self.0.contexts.write();
            if contexts.iter().any(|c| c.path() == context.path()) {
                return Err(NodeError::DuplicatePath(context.path().to_string()));
            }
            contexts.push(context);
        }

        if self.state() == NodeState::Running {
            self.emit(NodeEvent::ContextAdded {
                node: self.identity().clone(),
                context: info,
            });
        }

        Ok(())
    }

    /// Deregisters a context from the node.
    ///
    /// The context stops answering requests immediately, the proxy only learns
    /// about the removal once the advertisement of the change reaches it.
    pub fn remove_context(&self, path: &str) -> Result<ContextInfo, NodeError> {
        let removed = {
            let mut contexts = self.0.contexts.write();
            let position = contexts
                .iter()
                .position(|c| c.path() == path)
                .ok_or_else(|| NodeError::NotFound(path.to_string()))?;
            contexts.remove(position)
        };

        info!(node_id = %self.name(), context = %path, "Context removed.");

        if self.state() == NodeState::Running {
            self.emit(NodeEvent::ContextRemoved {
                node: self.identity().clone(),
                path: path.to_string(),
            });
        }

        Ok(removed.info())
    }

    /// Marks a context as enabled, allowing the proxy to send it new sessions.
    pub fn enable_context(&self, path: &str) -> Result<(), NodeError> {
        self.set_context_enabled(path, true)
    }

    /// Marks a context as disabled, the proxy keeps routing existing
    /// sessions to it but no longer elects it for new ones.
    pub fn disable_context(&self, path: &str) -> Result<(), NodeError> {
        self.set_context_enabled(path, false)
    }

    fn set_context_enabled(&self, path: &str, enabled: bool) -> Result<(), NodeError> {
        {
            let mut contexts = self.0.contexts.write();
            let context = contexts
                .iter_mut()
                .find(|c| c.path() == path)
                .ok_or_else(|| NodeError::NotFound(path.to_string()))?;
            context.set_enabled(enabled);
        }

        if self.state() == NodeState::Running {
            let node = self.identity().clone();
            let path = path.to_string();
            let event = if enabled {
                NodeEvent::ContextEnabled { node, path }
            } else {
                NodeEvent::ContextDisabled { node, path }
            };
            self.emit(event);
        }

        Ok(())
    }

    /// The contexts currently hosted by the node.
    pub fn contexts(&self) -> Vec<ContextInfo> {
        self.0.contexts.read().iter().map(Context::info).collect()
    }

    pub fn has_context(&self, path: &str) -> bool {
        self.0.contexts.read().iter().any(|c| c.path() == path)
    }

    /// The description of the node that is advertised once it is running.
    ///
    /// Returns `None` if the node has no connector.
    pub fn info(&self) -> Option<NodeInfo> {
        let addr = self.addresses().into_iter().next()?;
        Some(NodeInfo {
            identity: self.identity().clone(),
            addr,
            contexts: self.contexts(),
        })
    }

    /// Starts serving requests on every connector of the node.
    pub async fn start(&self) -> Result<(), NodeError> {
        self.transition(NodeState::Stopped, NodeState::Starting, "start")?;

        let (running, failure) = self.serve_connectors();
        if let Some(error) = failure {
            for connector in running {
                connector.shutdown().await;
            }
            self.set_state(NodeState::Stopped);
            return Err(error);
        }

        self.0.running.lock().extend(running);
        self.set_state(NodeState::Running);

        let info = self.info().ok_or_else(|| NodeError::NoConnector(self.name().to_string()))?;
        info!(
            node_id = %self.name(),
            addr = %info.addr,
            num_contexts = info.contexts.len(),
            "Node started."
        );
        self.emit(NodeEvent::Started(info));

        Ok(())
    }

    fn serve_connectors(&self) -> (Vec<RunningConnector>, Option<NodeError>) {
        let mut connectors = self.0.connectors.lock();
        if connectors.is_empty() {
            return (Vec::new(), Some(NodeError::NoConnector(self.name().to_string())));
        }

        let mut running = Vec::with_capacity(connectors.len());
        for connector in connectors.iter_mut() {
            match connector.serve(self.clone()) {
                Ok(handle) => running.push(handle),
                Err(error) => return (running, Some(error)),
            }
        }

        (running, None)
    }

    /// Stops the node, waiting for its connectors to drain.
    ///
    /// Listeners are told the node is stopping before the connectors close.
    pub async fn stop(&self) -> Result<(), NodeError> {
        self.transition(NodeState::Running, NodeState::Stopping, "stop")?;
        self.emit(NodeEvent::Stopping(self.identity().clone()));

        let running = std::mem::take(&mut *self.0.running.lock());
        for connector in running {
            connector.shutdown().await;
        }

        self.0.sessions.clear();
        self.set_state(NodeState::Stopped);
        info!(node_id = %self.name(), "Node stopped.");

        Ok(())
    }

    pub(crate) fn attach(&self, sink: EventSink) {
        *self.0.sink.write() = Some(sink);
    }

    pub(crate) fn detach(&self) {
        self.0.sink.write().take();
    }

    pub(crate) fn sessions(&self) -> &SessionStore {
        &self.0.sessions
    }

    /// Finds the context with the longest path matching the request path.
    pub(crate) fn find_context(&self, request_path: &str) -> Option<Context> {
        self.0
            .contexts
            .read()
            .iter()
            .filter(|c| c.matches(request_path))
            .max_by_key(|c| c.path().len())
            .cloned()
    }

    fn emit(&self, event: NodeEvent) {
        let sink = self.0.sink.read().clone();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    fn ensure_state(&self, expected: NodeState, action: &'static str) -> Result<(), NodeError> {
        let state = self.state();
        if state != expected {
            return Err(NodeError::InvalidState {
                node: self.name().to_string(),
                action,
                state,
            });
        }
        Ok(())
    }

    fn transition(
        &self,
        from: NodeState,
        to: NodeState,
        action: &'static str,
    ) -> Result<(), NodeError> {
        let mut state = self.0.state.lock();
        if *state != from {
            return Err(NodeError::InvalidState {
                node: self.name().to_string(),
                action,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, state: NodeState) {
        *self.0.state.lock() = state;
    }
}
