use std::collections::BTreeSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use failover_node::{route_from_session_id, session_id_from_cookie, strip_session_cookie};
use http::header::{CONNECTION, CONTENT_TYPE, COOKIE, HOST};
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::client::HttpConnector;
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::advertise::{AdvertiseGroup, Advertiser, DEFAULT_ADVERTISE_FREQUENCY};
use crate::balancer::{elect, Candidate, Election};
use crate::error::{McmpError, ProxyError};
use crate::mcmp::{error_response, McmpCommand, McmpMessage};
use crate::snapshot::ClusterSnapshot;
use crate::statistics::ProxyStatistics;
use crate::table::ManagerTable;

pub const DEFAULT_BACKEND_TIMEOUT: Duration = if cfg!(test) {
    Duration::from_secs(2)
} else {
    Duration::from_secs(10)
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    listen_addr: SocketAddr,
    server_name: String,
    backend_timeout: Duration,
    advertise_frequency: Duration,
    security_key: Option<String>,
}

impl ProxyConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            server_name: "proxy".to_string(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            advertise_frequency: DEFAULT_ADVERTISE_FREQUENCY,
            security_key: None,
        }
    }

    /// Set the name the proxy advertises itself under.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set how long a node has to answer a forwarded request.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_advertise_frequency(mut self, frequency: Duration) -> Self {
        self.advertise_frequency = frequency;
        self
    }

    /// Sign advertisements with the given key.
    pub fn with_security_key(mut self, key: impl Into<String>) -> Self {
        self.security_key = Some(key.into());
        self
    }
}

struct ProxyState {
    table: ManagerTable,
    statistics: ProxyStatistics,
    client: Client<HttpConnector>,
    backend_timeout: Duration,
}

/// An in-process clustering proxy.
///
/// A single address answers both the manager protocol and the client
/// traffic which is forwarded to the nodes hosting the requested path.
pub struct ProxyServer {
    addr: SocketAddr,
    config: ProxyConfig,
    state: Arc<ProxyState>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    advertisers: Mutex<Vec<Advertiser>>,
}

impl ProxyServer {
    /// Binds the proxy and starts serving requests.
    pub async fn listen(config: ProxyConfig) -> Result<Self, ProxyError> {
        let incoming =
            AddrIncoming::bind(&config.listen_addr).map_err(|source| ProxyError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let addr = incoming.local_addr();

        let state = Arc::new(ProxyState {
            table: ManagerTable::default(),
            statistics: ProxyStatistics::default(),
            client: Client::new(),
            backend_timeout: config.backend_timeout,
        });

        let service_state = state.clone();
        let make_service = make_service_fn(move |_socket: &AddrStream| {
            let state = service_state.clone();

            async move {
                let service = move |req| handle_request(state.clone(), req);
                Ok::<_, Infallible>(service_fn(service))
            }
        });

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = hyper::Server::builder(incoming)
                .tcp_nodelay(true)
                .serve(make_service)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                });

            if let Err(e) = server.await {
                error!(error = ?e, "Proxy failed to handle requests.");
            }
        });

        info!(
            addr = %addr,
            server_name = %config.server_name,
            "Proxy listening."
        );

        Ok(Self {
            addr,
            config,
            state,
            shutdown,
            handle,
            advertisers: Mutex::default(),
        })
    }

    #[inline]
    /// The address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn table(&self) -> &ManagerTable {
        &self.state.table
    }

    #[inline]
    pub fn statistics(&self) -> ProxyStatistics {
        self.state.statistics.clone()
    }

    /// The proxy's current view of the cluster.
    pub fn snapshot(&self) -> Result<ClusterSnapshot, ProxyError> {
        ClusterSnapshot::parse_info(&self.state.table.render_info())
    }

    /// Starts announcing the proxy on the given group.
    pub fn advertise_on(&self, group: AdvertiseGroup) {
        info!(group = %group.addr(), addr = %self.addr, "Proxy advertising.");

        let advertiser = Advertiser::spawn(
            group,
            self.addr,
            self.config.server_name.clone(),
            self.config.security_key.clone(),
            self.config.advertise_frequency,
        );
        self.advertisers.lock().push(advertiser);
    }

    /// Stops advertising and serving requests.
    pub async fn shutdown(self) {
        let advertisers = std::mem::take(&mut *self.advertisers.lock());
        for advertiser in advertisers {
            advertiser.stop().await;
        }

        let _ = self.shutdown.send(());
        let mut handle = self.handle;
        if timeout(SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
            warn!(addr = %self.addr, "Proxy did not shut down in time, aborting.");
            handle.abort();
        }

        info!(addr = %self.addr, "Proxy shut down.");
    }
}

async fn handle_request(
    state: Arc<ProxyState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let response = match McmpCommand::from_method(req.method()) {
        Some(command) => handle_manager_command(&state, command, req).await,
        None => proxy_request(&state, req).await,
    };

    Ok(response)
}

async fn handle_manager_command(
    state: &ProxyState,
    command: McmpCommand,
    req: Request<Body>,
) -> Response<Body> {
    state
        .statistics
        .num_manager_commands
        .fetch_add(1, Ordering::Relaxed);

    let wildcard = req.uri().path() == "/*";
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            warn!(command = %command, error = ?e, "Failed to read manager command.");
            return error_response(&McmpError::MalformedBody);
        },
    };

    let result = std::str::from_utf8(&body)
        .map_err(|_| McmpError::MalformedBody)
        .and_then(|body| McmpMessage::decode(command, wildcard, body))
        .and_then(|msg| {
            debug!(
                command = %command,
                route = ?msg.route(),
                wildcard = wildcard,
                "Applying manager command."
            );
            state.table.apply(&msg)
        });

    match result {
        Ok(body) => text_response(StatusCode::OK, body),
        Err(e) => {
            warn!(command = %command, error = %e, "Manager command rejected.");
            error_response(&e)
        },
    }
}

async fn proxy_request(state: &ProxyState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = ?e, "Failed to read client request.");
            return text_response(StatusCode::BAD_REQUEST, "Unreadable request body");
        },
    };

    let path = parts.uri.path().to_string();
    let mut cookie = parts
        .headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let mut sticky_route = cookie
        .as_deref()
        .and_then(session_id_from_cookie)
        .and_then(route_from_session_id)
        .map(String::from);

    let (_, config) = state.table.candidates(&path);
    let max_attempts = config.max_attempts.max(1);

    let mut tried = BTreeSet::new();
    let mut last_response = None;
    for attempt in 0..max_attempts {
        let (candidates, config) = state.table.candidates(&path);
        let candidate = match elect(&candidates, sticky_route.as_deref(), &tried, &config) {
            Election::Node(candidate) => candidate,
            Election::StickyUnavailable => {
                debug!(path = %path, route = ?sticky_route, "Session node unavailable.");
                return text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "The node owning the session is unavailable",
                );
            },
            Election::Exhausted => break,
        };

        if attempt > 0 {
            state.statistics.num_failovers.fetch_add(1, Ordering::Relaxed);
            debug!(path = %path, route = %candidate.route, attempt = attempt, "Failing over.");

            if config.sticky_session_remove {
                cookie = cookie.as_deref().and_then(strip_session_cookie);
                sticky_route = None;
            }
        }

        state.table.record_election(&candidate.route);
        match forward(state, &parts, cookie.as_deref(), body.clone(), &candidate).await {
            Ok(response) if !is_retryable(response.status()) => {
                state
                    .statistics
                    .num_requests_proxied
                    .fetch_add(1, Ordering::Relaxed);
                return response;
            },
            Ok(response) => {
                debug!(
                    route = %candidate.route,
                    status = %response.status(),
                    "Node could not serve request."
                );
                last_response = Some(response);
            },
            Err(e) => {
                state
                    .statistics
                    .num_backend_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(route = %candidate.route, error = %e, "Failed to reach node.");
            },
        }

        tried.insert(candidate.route);
    }

    match last_response {
        Some(response) => response,
        None => text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("No node is available to serve {path}"),
        ),
    }
}

/// Responses which mean another node may still be able to serve the request.
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::SERVICE_UNAVAILABLE
}

async fn forward(
    state: &ProxyState,
    parts: &Parts,
    cookie: Option<&str>,
    body: Bytes,
    candidate: &Candidate,
) -> Result<Response<Body>, ProxyError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(format!(
            "http://{}:{}{}",
            candidate.host, candidate.port, path_and_query
        ));
    for (name, value) in parts.headers.iter() {
        if name == HOST || name == COOKIE || name == CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(cookie) = cookie {
        builder = builder.header(COOKIE, cookie);
    }

    let request = builder.body(Body::from(body))?;
    let response = timeout(state.backend_timeout, state.client.request(request))
        .await
        .map_err(|_| ProxyError::Timeout(state.backend_timeout))??;

    Ok(response)
}

fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
