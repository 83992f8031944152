use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};

use crate::error::{LifecycleError, NodeError};
use crate::event::{EventSink, LifecycleListener, NodeEvent};
use crate::node::{Node, NodeState};

/// The default time a lifecycle unit has to shut its nodes down once asked to.
pub const DEFAULT_GRACE_PERIOD: Duration = if cfg!(test) {
    Duration::from_secs(5)
} else {
    Duration::from_secs(15)
};

#[derive(Clone, Default)]
/// The container nodes are registered with.
///
/// Lifecycle listeners added to the server observe every node registered
/// with it, regardless of the order they were added in.
pub struct Server {
    inner: Arc<ServerInner>,
}

#[derive(Default)]
struct ServerInner {
    services: RwLock<Vec<Node>>,
    sink: EventSink,
}

impl Server {
    /// Registers a node with the server.
    ///
    /// Node names double as proxy routes so they must be unique.
    pub fn add_service(&self, node: Node) -> Result<(), NodeError> {
        let mut services = self.inner.services.write();
        if services.iter().any(|n| n.name() == node.name()) {
            return Err(NodeError::DuplicateNode(node.name().to_string()));
        }

        node.attach(self.inner.sink.clone());
        services.push(node);
        Ok(())
    }

    /// Removes a node from the server, it no longer emits events to the
    /// server's listeners.
    ///
    /// Listeners are told about the removal unless the node is stopped, in
    /// which case they already saw it go.
    pub fn remove_service(&self, name: &str) -> Option<Node> {
        let node = {
            let mut services = self.inner.services.write();
            let position = services.iter().position(|n| n.name() == name)?;
            services.remove(position)
        };

        if node.state() != NodeState::Stopped {
            info!(node_id = %node.name(), state = ?node.state(), "Removing live node.");
            self.inner.sink.emit(NodeEvent::Removed(node.identity().clone()));
        }
        node.detach();
        Some(node)
    }

    /// The nodes currently registered.
    pub fn services(&self) -> Vec<Node> {
        self.inner.services.read().clone()
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.inner.sink.add(listener);
    }

    /// Starts every stopped node.
    ///
    /// If any node fails to start, the nodes started by this call are
    /// stopped again before the error is returned.
    pub async fn start(&self) -> Result<(), NodeError> {
        let mut started = Vec::new();
        for node in self.services() {
            if node.state() != NodeState::Stopped {
                continue;
            }

            if let Err(e) = node.start().await {
                error!(node_id = %node.name(), error = ?e, "Failed to start node.");
                for node in started {
                    stop_node(node).await;
                }
                return Err(e);
            }
            started.push(node);
        }

        info!(num_nodes = started.len(), "Server started.");
        Ok(())
    }

    /// Stops every running node concurrently.
    pub async fn stop(&self) {
        let running = self
            .services()
            .into_iter()
            .filter(|n| n.state() == NodeState::Running);
        join_all(running.map(stop_node)).await;
        info!("Server stopped.");
    }
}

async fn stop_node(node: Node) {
    if let Err(e) = node.stop().await {
        warn!(node_id = %node.name(), error = ?e, "Failed to stop node.");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why a lifecycle unit exited.
pub enum LifecycleExit {
    /// The duration budget elapsed.
    BudgetElapsed,
    /// The unit was told to stop early.
    Stopped,
}

/// Keeps the nodes of a [Server] alive in a background task for a bounded
/// duration.
pub struct ServerLifecycle {
    server: Server,
    grace_period: Duration,
    unit: Option<LifecycleUnit>,
}

struct LifecycleUnit {
    budget: Duration,
    stop: oneshot::Sender<()>,
    /// Fires once every node has started, dropped if starting failed.
    ready: Option<oneshot::Receiver<()>>,
    handle: JoinHandle<Result<LifecycleExit, NodeError>>,
}

impl ServerLifecycle {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            grace_period: DEFAULT_GRACE_PERIOD,
            unit: None,
        }
    }

    /// Set the time the unit has to exit once asked to stop.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    #[inline]
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// If a unit has been started and has not exited yet.
    pub fn is_running(&self) -> bool {
        self.unit
            .as_ref()
            .map(|unit| !unit.handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawns the lifecycle unit.
    ///
    /// The unit starts every node, keeps them alive until `budget` has
    /// elapsed or [Self::stop_early] is called, and then stops them again.
    /// This returns as soon as the unit is spawned.
    pub fn start(&mut self, budget: Duration) -> Result<(), LifecycleError> {
        if self.is_running() {
            return Err(LifecycleError::AlreadyRunning);
        }

        let (stop, stop_rx) = oneshot::channel::<()>();
        let (ready_tx, ready) = oneshot::channel::<()>();
        let server = self.server.clone();
        let handle = tokio::spawn(async move {
            server.start().await?;
            let _ = ready_tx.send(());

            let exit = tokio::select! {
                _ = sleep(budget) => LifecycleExit::BudgetElapsed,
                _ = stop_rx => LifecycleExit::Stopped,
            };
            debug!(exit = ?exit, "Lifecycle unit stopping nodes.");

            server.stop().await;
            Ok(exit)
        });

        info!(budget = ?budget, "Lifecycle unit started.");
        self.unit = Some(LifecycleUnit {
            budget,
            stop,
            ready: Some(ready),
            handle,
        });

        Ok(())
    }

    /// Waits for the unit to have started every node.
    ///
    /// If starting failed the unit has already exited, it is joined and its
    /// error returned.
    pub async fn wait_started(&mut self, bound: Duration) -> Result<(), LifecycleError> {
        let unit = self.unit.as_mut().ok_or(LifecycleError::NotRunning)?;
        let ready = match unit.ready.take() {
            Some(ready) => ready,
            None => return Ok(()),
        };

        match timeout(bound, ready).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                let unit = self.unit.take().ok_or(LifecycleError::NotRunning)?;
                self.wait_for_exit(unit.handle, self.grace_period)
                    .await
                    .map(|_| ())
            },
            Err(_) => Err(LifecycleError::StartTimeout(bound)),
        }
    }

    /// Signals the unit to stop and waits for it to exit.
    ///
    /// If the unit does not exit within the grace period it is aborted and
    /// [LifecycleError::ShutdownTimeout] is returned.
    pub async fn stop_early(&mut self) -> Result<LifecycleExit, LifecycleError> {
        let unit = self.unit.take().ok_or(LifecycleError::NotRunning)?;
        let _ = unit.stop.send(());
        self.wait_for_exit(unit.handle, self.grace_period).await
    }

    /// Waits for the unit to exit on its own once its budget has elapsed.
    pub async fn join(&mut self) -> Result<LifecycleExit, LifecycleError> {
        let unit = self.unit.take().ok_or(LifecycleError::NotRunning)?;
        let bound = unit.budget + self.grace_period;
        self.wait_for_exit(unit.handle, bound).await
    }

    async fn wait_for_exit(
        &self,
        mut handle: JoinHandle<Result<LifecycleExit, NodeError>>,
        bound: Duration,
    ) -> Result<LifecycleExit, LifecycleError> {
        match timeout(bound, &mut handle).await {
            Ok(Ok(Ok(exit))) => {
                info!(exit = ?exit, "Lifecycle unit exited.");
                Ok(exit)
            },
            Ok(Ok(Err(e))) => Err(LifecycleError::Node(e)),
            Ok(Err(e)) => Err(join_error(e)),
            Err(_) => {
                error!(bound = ?bound, "Lifecycle unit did not exit in time, aborting.");
                handle.abort();
                Err(LifecycleError::ShutdownTimeout(bound))
            },
        }
    }
}

fn join_error(e: JoinError) -> LifecycleError {
    if e.is_panic() {
        let payload = e.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        LifecycleError::Panicked(message)
    } else {
        LifecycleError::Panicked("the unit was cancelled".to_string())
    }
}
