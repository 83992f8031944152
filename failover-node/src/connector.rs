use std::convert::Infallible;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::Ordering;
use std::time::Duration;

use http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Body;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::application::AppRequest;
use crate::error::NodeError;
use crate::node::Node;
use crate::session::{session_id_from_cookie, SESSION_COOKIE};

const DRAIN_GRACE: Duration = if cfg!(test) {
    Duration::from_secs(1)
} else {
    Duration::from_secs(5)
};

/// A listening endpoint of a node.
///
/// The port is bound as soon as the connector is created so conflicts are
/// reported up front, serving only begins once the node starts.
pub(crate) struct Connector {
    addr: SocketAddr,
    listener: Option<TcpListener>,
}

impl Connector {
    pub(crate) fn bind(host: &str, port: u16) -> Result<Self, NodeError> {
        let listener = TcpListener::bind((host, port))
            .map_err(|source| NodeError::PortUnavailable { port, source })?;
        let addr = listener.local_addr()?;

        Ok(Self {
            addr,
            listener: Some(listener),
        })
    }

    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Starts serving the node's contexts on this connector.
    ///
    /// A connector which has been served and shut down before rebinds its
    /// previous address.
    pub(crate) fn serve(&mut self, node: Node) -> Result<RunningConnector, NodeError> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(self.addr).map_err(|source| {
                NodeError::PortUnavailable {
                    port: self.addr.port(),
                    source,
                }
            })?,
        };
        listener.set_nonblocking(true)?;

        let builder = hyper::Server::from_tcp(listener)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let make_service = make_service_fn(move |_socket: &AddrStream| {
            let node = node.clone();

            async move {
                let service = move |req| handle_request(node.clone(), req);
                Ok::<_, Infallible>(service_fn(service))
            }
        });

        let addr = self.addr;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = builder
                .tcp_nodelay(true)
                .serve(make_service)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                });

            if let Err(e) = server.await {
                error!(addr = %addr, error = ?e, "Connector failed to handle requests.");
            }
        });

        Ok(RunningConnector {
            addr,
            shutdown,
            handle,
        })
    }
}

/// A connector which is currently serving requests.
pub(crate) struct RunningConnector {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningConnector {
    /// Stops accepting connections and waits for in-flight requests to drain.
    ///
    /// The server task is aborted if it does not finish within the drain grace
    /// period, either way the socket is released once this returns.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown.send(());

        let mut handle = self.handle;
        if timeout(DRAIN_GRACE, &mut handle).await.is_err() {
            warn!(addr = %self.addr, "Connector did not drain in time, aborting.");
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn handle_request(
    node: Node,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let session_id = req
        .headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_id_from_cookie)
        .map(String::from);

    let context = match node.find_context(&path) {
        Some(context) => context,
        None => {
            node.statistics()
                .num_not_found
                .fetch_add(1, Ordering::Relaxed);
            debug!(node_id = %node.name(), path = %path, "No context hosts the request path.");
            return Ok(text_response(
                StatusCode::NOT_FOUND,
                format!("No context hosts {path}"),
            ));
        },
    };

    let route = node.name();
    let (body, created) =
        node.sessions()
            .with_session(session_id.as_deref(), route, |session, new_session| {
                let request = AppRequest {
                    node: route,
                    path: &path,
                    new_session,
                };
                context.application().handle(&request, session)
            });

    let statistics = node.statistics();
    statistics.num_requests_served.fetch_add(1, Ordering::Relaxed);

    let mut response = text_response(StatusCode::OK, body);
    if let Some(id) = created {
        statistics
            .num_sessions_created
            .fetch_add(1, Ordering::Relaxed);

        let cookie = format!("{SESSION_COOKIE}={id}; Path={}", context.mount());
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().insert(SET_COOKIE, value);
            },
            Err(e) => {
                warn!(node_id = %route, error = ?e, "Session cookie is not a valid header value.");
            },
        }
    }

    Ok(response)
}

fn text_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
