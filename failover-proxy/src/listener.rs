use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use failover_node::{
    ContextInfo,
    LifecycleListener,
    Node,
    NodeEvent,
    NodeIdentity,
    NodeInfo,
    NodeState,
    Server,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::advertise::{AdvertiseGroup, Advertisement, DEFAULT_ADVERTISE_GROUP};
use crate::error::ProxyError;
use crate::mcmp::{McmpClient, McmpCommand, McmpMessage};
use crate::snapshot::ClusterSnapshot;
use crate::statistics::ListenerStatistics;
use crate::table::DEFAULT_BALANCER;

pub const DEFAULT_STATUS_INTERVAL: Duration = if cfg!(test) {
    Duration::from_millis(100)
} else {
    Duration::from_secs(10)
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = if cfg!(test) {
    Duration::from_secs(2)
} else {
    Duration::from_secs(10)
};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The load factor nodes report on each status tick.
const NODE_LOAD: i32 = 1;

#[derive(Debug, Clone)]
/// How the listener discovers proxies and what it tells them.
pub struct ListenerConfig {
    pub advertise_group: SocketAddr,
    /// The load balancing group nodes are reported in.
    pub domain: String,
    /// Discover proxies through their advertisements.
    pub advertise: bool,
    pub sticky_session: bool,
    pub sticky_session_remove: bool,
    pub sticky_session_force: bool,
    /// Only accept advertisements signed with this key.
    pub security_key: Option<String>,
    /// Proxies known up front, regardless of advertisements.
    pub proxies: Vec<SocketAddr>,
    pub status_interval: Duration,
    pub max_attempts: u32,
    pub balancer: String,
    /// The time a proxy has to answer a manager command.
    pub request_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            advertise_group: DEFAULT_ADVERTISE_GROUP,
            domain: String::new(),
            advertise: true,
            sticky_session: true,
            sticky_session_remove: false,
            sticky_session_force: false,
            security_key: None,
            proxies: Vec::new(),
            status_interval: DEFAULT_STATUS_INTERVAL,
            max_attempts: 3,
            balancer: DEFAULT_BALANCER.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ListenerConfig {
    /// Creates a config listening for proxies advertising on `group`.
    pub fn new(group: SocketAddr) -> Self {
        Self {
            advertise_group: group,
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_advertise(mut self, advertise: bool) -> Self {
        self.advertise = advertise;
        self
    }

    pub fn with_sticky_session(mut self, sticky_session: bool) -> Self {
        self.sticky_session = sticky_session;
        self
    }

    pub fn with_sticky_session_remove(mut self, remove: bool) -> Self {
        self.sticky_session_remove = remove;
        self
    }

    pub fn with_sticky_session_force(mut self, force: bool) -> Self {
        self.sticky_session_force = force;
        self
    }

    pub fn with_security_key(mut self, key: impl Into<String>) -> Self {
        self.security_key = Some(key.into());
        self
    }

    /// Adds a proxy which is contacted without waiting for it to advertise.
    pub fn with_proxy(mut self, addr: SocketAddr) -> Self {
        self.proxies.push(addr);
        self
    }

    /// Set how often node status is reported to the proxies.
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Default)]
struct ProxyLink {
    server_name: Option<String>,
    /// The proxy's view may be stale and must be rebuilt before anything
    /// else is sent to it.
    needs_sync: bool,
}

type ProxyLinks = Arc<RwLock<BTreeMap<SocketAddr, ProxyLink>>>;

struct EventForwarder(flume::Sender<NodeEvent>);

impl LifecycleListener for EventForwarder {
    fn on_event(&self, event: NodeEvent) {
        let _ = self.0.send(event);
    }
}

#[derive(Clone)]
/// Keeps every discovered proxy informed about the nodes of a [Server].
///
/// This handle is cheap to clone.
pub struct ClusterListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    proxies: ProxyLinks,
    client: McmpClient,
    statistics: ListenerStatistics,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterListener {
    /// Registers a new listener with the server and starts it.
    pub fn create(server: &Server, config: ListenerConfig, group: AdvertiseGroup) -> Self {
        let (tx, events) = flume::unbounded();
        server.add_lifecycle_listener(Arc::new(EventForwarder(tx)));

        let proxies = config
            .proxies
            .iter()
            .map(|addr| {
                let link = ProxyLink {
                    server_name: None,
                    needs_sync: true,
                };
                (*addr, link)
            })
            .collect::<BTreeMap<_, _>>();
        let proxies = Arc::new(RwLock::new(proxies));

        let advertisements = config.advertise.then(|| group.subscribe());
        let client = McmpClient::new(config.request_timeout);
        let statistics = ListenerStatistics::default();

        info!(
            group = %config.advertise_group,
            advertise = config.advertise,
            num_static_proxies = config.proxies.len(),
            "Cluster listener started."
        );

        let task = ListenerTask {
            server: server.clone(),
            config,
            client: client.clone(),
            proxies: proxies.clone(),
            statistics: statistics.clone(),
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(task.run(events, advertisements, shutdown_rx));

        let inner = ListenerInner {
            proxies,
            client,
            statistics,
            shutdown: Mutex::new(Some(shutdown)),
            handle: Mutex::new(Some(handle)),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    #[inline]
    pub fn statistics(&self) -> ListenerStatistics {
        self.inner.statistics.clone()
    }

    /// The proxies the listener currently talks to.
    pub fn proxies(&self) -> Vec<SocketAddr> {
        self.inner.proxies.read().keys().copied().collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Pings the first known proxy, returning its response.
    pub async fn ping(&self) -> Result<String, ProxyError> {
        let addr = self.first_proxy()?;
        self.inner
            .client
            .send(addr, &McmpMessage::new(McmpCommand::Ping))
            .await
    }

    /// Fetches the cluster view of the first known proxy.
    pub async fn proxy_info(&self) -> Result<ClusterSnapshot, ProxyError> {
        let addr = self.first_proxy()?;
        let info = self
            .inner
            .client
            .send(addr, &McmpMessage::new(McmpCommand::Info))
            .await?;
        ClusterSnapshot::parse_info(&info)
    }

    fn first_proxy(&self) -> Result<SocketAddr, ProxyError> {
        self.inner
            .proxies
            .read()
            .keys()
            .next()
            .copied()
            .ok_or(ProxyError::NoProxy)
    }

    /// Stops the listener task.
    ///
    /// Calling this more than once has no effect.
    pub async fn stop(&self) {
        let shutdown = self.inner.shutdown.lock().take();
        let handle = self.inner.handle.lock().take();

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }

        if let Some(mut handle) = handle {
            if timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("Cluster listener did not stop in time, aborting.");
                handle.abort();
            }
            info!("Cluster listener stopped.");
        }
    }
}

struct ListenerTask {
    server: Server,
    config: ListenerConfig,
    client: McmpClient,
    proxies: ProxyLinks,
    statistics: ListenerStatistics,
}

impl ListenerTask {
    async fn run(
        self,
        events: flume::Receiver<NodeEvent>,
        mut advertisements: Option<broadcast::Receiver<Advertisement>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut interval = interval(self.config.status_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv_async() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(_) => break,
                },
                advertisement = next_advertisement(&mut advertisements) => {
                    if let Some(advertisement) = advertisement {
                        self.on_advertisement(advertisement).await;
                    }
                },
                _ = interval.tick() => self.on_status_tick().await,
            }
        }

        debug!("Cluster listener task exited.");
    }

    async fn on_event(&self, event: NodeEvent) {
        debug!(node_id = %event.node().name, event = ?event, "Handling node event.");

        let messages = self.event_messages(&event);
        for (addr, link) in self.links() {
            if link.needs_sync {
                self.full_sync(addr).await;
            } else if !self.send_all(addr, &messages).await {
                self.mark_needs_sync(addr);
            }
        }
    }

    async fn on_advertisement(&self, advertisement: Advertisement) {
        if advertisement.group != self.config.advertise_group {
            trace!(group = %advertisement.group, "Ignoring advertisement of another group.");
            return;
        }

        if !advertisement.verify(self.config.security_key.as_deref()) {
            warn!(
                server_addr = %advertisement.server_addr,
                server_name = %advertisement.server_name,
                "Ignoring advertisement with an invalid digest."
            );
            return;
        }

        let addr = advertisement.server_addr;
        {
            let mut proxies = self.proxies.write();
            if let Some(link) = proxies.get_mut(&addr) {
                link.server_name = Some(advertisement.server_name);
                return;
            }

            proxies.insert(
                addr,
                ProxyLink {
                    server_name: Some(advertisement.server_name.clone()),
                    needs_sync: true,
                },
            );
        }

        info!(
            proxy_addr = %addr,
            server_name = %advertisement.server_name,
            "Discovered proxy."
        );
        self.full_sync(addr).await;
    }

    async fn on_status_tick(&self) {
        for (addr, link) in self.links() {
            if link.needs_sync {
                self.full_sync(addr).await;
                continue;
            }

            let messages = self
                .server
                .services()
                .into_iter()
                .filter(|node| node.state() == NodeState::Running)
                .map(|node| {
                    McmpMessage::new(McmpCommand::Status)
                        .with_param("JVMRoute", node.name())
                        .with_param("Load", NODE_LOAD)
                })
                .collect::<Vec<_>>();

            if !self.send_all(addr, &messages).await {
                self.mark_needs_sync(addr);
            }
        }
    }

    /// Rebuilds the proxy's view from the current state of every node.
    ///
    /// Nodes of this listener's balancer and domain which the proxy still
    /// reports but the server no longer holds are removed as well.
    async fn full_sync(&self, addr: SocketAddr) {
        self.statistics.num_full_syncs.fetch_add(1, Ordering::Relaxed);

        let services = self.server.services();
        let mut messages = self
            .stale_routes(addr, &services)
            .await
            .iter()
            .map(|route| remove_node_message(route))
            .collect::<Vec<_>>();

        for node in services {
            match (node.state(), node.info()) {
                (NodeState::Running, Some(info)) => {
                    messages.extend(self.started_messages(&info));
                },
                _ => messages.push(remove_node_message(node.name())),
            }
        }

        let synced = self.send_all(addr, &messages).await;
        if let Some(link) = self.proxies.write().get_mut(&addr) {
            link.needs_sync = !synced;
        }

        if synced {
            debug!(proxy_addr = %addr, num_commands = messages.len(), "Proxy synchronised.");
        }
    }

    async fn stale_routes(&self, addr: SocketAddr, services: &[Node]) -> Vec<String> {
        let info = McmpMessage::new(McmpCommand::Info);
        let snapshot = match self
            .client
            .send(addr, &info)
            .await
            .and_then(|info| ClusterSnapshot::parse_info(&info))
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(proxy_addr = %addr, error = %e, "Failed to read proxy state.");
                return Vec::new();
            },
        };

        snapshot
            .nodes()
            .filter(|node| {
                node.balancer == self.config.balancer && node.domain == self.config.domain
            })
            .filter(|node| !services.iter().any(|s| s.name() == node.name))
            .map(|node| {
                info!(proxy_addr = %addr, node_id = %node.name, "Removing node unknown to the server.");
                node.name.clone()
            })
            .collect()
    }

    /// Sends the messages in order, stopping at the first failure.
    async fn send_all(&self, addr: SocketAddr, messages: &[McmpMessage]) -> bool {
        for msg in messages {
            match self.client.send(addr, msg).await {
                Ok(_) => {
                    self.statistics
                        .num_commands_sent
                        .fetch_add(1, Ordering::Relaxed);
                },
                Err(e) => {
                    self.statistics
                        .num_command_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        proxy_addr = %addr,
                        command = %msg.command,
                        route = ?msg.route(),
                        error = %e,
                        "Proxy rejected manager command, it will be resynchronised."
                    );
                    return false;
                },
            }
        }

        true
    }

    fn links(&self) -> Vec<(SocketAddr, ProxyLink)> {
        self.proxies
            .read()
            .iter()
            .map(|(addr, link)| (*addr, link.clone()))
            .collect()
    }

    fn mark_needs_sync(&self, addr: SocketAddr) {
        if let Some(link) = self.proxies.write().get_mut(&addr) {
            link.needs_sync = true;
        }
    }

    fn event_messages(&self, event: &NodeEvent) -> Vec<McmpMessage> {
        match event {
            NodeEvent::Started(info) => self.started_messages(info),
            NodeEvent::Stopping(node) | NodeEvent::Removed(node) => {
                vec![remove_node_message(&node.name)]
            },
            NodeEvent::ContextAdded { node, context } => {
                vec![context_message(node, context)]
            },
            NodeEvent::ContextRemoved { node, path } => vec![
                app_message(McmpCommand::StopApp, node, path),
                app_message(McmpCommand::RemoveApp, node, path),
            ],
            NodeEvent::ContextEnabled { node, path } => {
                vec![app_message(McmpCommand::EnableApp, node, path)]
            },
            NodeEvent::ContextDisabled { node, path } => {
                vec![app_message(McmpCommand::DisableApp, node, path)]
            },
        }
    }

    fn started_messages(&self, info: &NodeInfo) -> Vec<McmpMessage> {
        let mut messages = Vec::with_capacity(info.contexts.len() + 1);
        messages.push(self.config_message(info));
        messages.extend(
            info.contexts
                .iter()
                .map(|context| context_message(&info.identity, context)),
        );
        messages
    }

    fn config_message(&self, info: &NodeInfo) -> McmpMessage {
        let mut msg = McmpMessage::new(McmpCommand::Config)
            .with_param("JVMRoute", &info.identity.name)
            .with_param("Balancer", &self.config.balancer)
            .with_param("Host", info.addr.ip())
            .with_param("Port", info.addr.port())
            .with_param("Type", "http")
            .with_param("StickySession", yes_no(self.config.sticky_session))
            .with_param("StickySessionRemove", yes_no(self.config.sticky_session_remove))
            .with_param("StickySessionForce", yes_no(self.config.sticky_session_force))
            .with_param("Maxattempts", self.config.max_attempts);

        if !self.config.domain.is_empty() {
            msg = msg.with_param("Domain", &self.config.domain);
        }

        msg
    }
}

async fn next_advertisement(
    advertisements: &mut Option<broadcast::Receiver<Advertisement>>,
) -> Option<Advertisement> {
    let receiver = match advertisements {
        Some(receiver) => receiver,
        None => return std::future::pending().await,
    };

    match receiver.recv().await {
        Ok(advertisement) => Some(advertisement),
        Err(RecvError::Lagged(skipped)) => {
            debug!(skipped = skipped, "Listener lagged behind advertisements.");
            None
        },
        Err(RecvError::Closed) => {
            *advertisements = None;
            None
        },
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

fn remove_node_message(route: &str) -> McmpMessage {
    McmpMessage::new(McmpCommand::RemoveApp)
        .with_wildcard()
        .with_param("JVMRoute", route)
}

fn app_message(command: McmpCommand, node: &NodeIdentity, path: &str) -> McmpMessage {
    McmpMessage::new(command)
        .with_param("JVMRoute", &node.name)
        .with_param("Alias", &node.host)
        .with_param("Context", path)
}

fn context_message(node: &NodeIdentity, context: &ContextInfo) -> McmpMessage {
    let command = if context.enabled {
        McmpCommand::EnableApp
    } else {
        McmpCommand::DisableApp
    };
    app_message(command, node, &context.path)
}
