use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use failover_node::{route_from_session_id, session_id_from_set_cookie, SESSION_COOKIE};
use http::header::{COOKIE, SET_COOKIE};
use http::{Request, StatusCode};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::error::ClientError;

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = if cfg!(test) {
    Duration::from_secs(2)
} else {
    Duration::from_secs(10)
};

const DEFAULT_PAUSE: Duration = Duration::from_millis(50);
const JOIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Requesting,
    /// Repeatedly requesting within a failover window.
    Retrying,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// The node the client expects to be served by and the session which
/// pinned it there.
pub struct AffinityRecord {
    pub node: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Clone)]
/// The outcome of a single request through the proxy.
pub struct RequestResult {
    pub responding_node: Option<String>,
    pub ok: bool,
    pub latency: Duration,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
}

impl fmt::Display for RequestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.responding_node.as_deref().unwrap_or("<unknown>");
        match (&self.status, &self.error) {
            (_, Some(error)) => write!(f, "node={node} after {:?}: {error}", self.latency),
            (Some(status), None) => write!(f, "node={node} status={status} after {:?}", self.latency),
            (None, None) => write!(f, "node={node} after {:?}", self.latency),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Every request made within a failover window, summarised.
pub struct WindowReport {
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// The number of successful responses per node.
    pub nodes: BTreeMap<String, u64>,
    pub first_failure: Option<RequestResult>,
}

impl WindowReport {
    fn record(&mut self, result: &RequestResult) {
        self.attempts += 1;

        if result.ok {
            self.succeeded += 1;
            if let Some(node) = result.responding_node.as_ref() {
                *self.nodes.entry(node.clone()).or_default() += 1;
            }
        } else {
            self.failed += 1;
            if self.first_failure.is_none() {
                self.first_failure = Some(result.clone());
            }
        }
    }

    /// If at least one request was made and none of them failed.
    pub fn result_ok(&self) -> bool {
        self.attempts > 0 && self.failed == 0
    }
}

impl fmt::Display for WindowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} requests succeeded, served by {:?}",
            self.succeeded, self.attempts, self.nodes,
        )?;
        if let Some(failure) = self.first_failure.as_ref() {
            write!(f, ", first failure: {failure}")?;
        }
        Ok(())
    }
}

/// An HTTP client talking to the cluster through the proxy.
///
/// The client remembers which node served it last and treats a response
/// from any other node as a failure, unless told a change is expected.
pub struct FailoverClient {
    proxy_addr: SocketAddr,
    client: Client<HttpConnector>,
    signature: String,
    affinity: AffinityRecord,
    excluded: BTreeSet<String>,
    state: ClientState,
    attempt_timeout: Duration,
    pause: Duration,
}

impl FailoverClient {
    /// Creates a new client sending requests to `proxy_addr`.
    ///
    /// A response is only correct if its body starts with `signature`.
    pub fn new(proxy_addr: SocketAddr, signature: impl Into<String>) -> Self {
        Self {
            proxy_addr,
            client: Client::new(),
            signature: signature.into(),
            affinity: AffinityRecord::default(),
            excluded: BTreeSet::new(),
            state: ClientState::Idle,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            pause: DEFAULT_PAUSE,
        }
    }

    /// Set how long each request within a failover window may take.
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Set the pause between requests within a failover window.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[inline]
    pub fn affinity(&self) -> &AffinityRecord {
        &self.affinity
    }

    #[inline]
    /// The node the client currently expects to be served by.
    pub fn node(&self) -> Option<&str> {
        self.affinity.node.as_deref()
    }

    /// Pins the client to the given node, keeping the current session.
    pub fn set_node(&mut self, node: impl Into<String>) {
        self.affinity.node = Some(node.into());
    }

    /// Accepts whichever node serves the next request.
    pub fn clear_node(&mut self) {
        self.affinity.node = None;
    }

    /// Treats any response from `node` as a failure.
    pub fn exclude_node(&mut self, node: impl Into<String>) {
        self.excluded.insert(node.into());
    }

    /// Makes a single request to `path` through the proxy.
    ///
    /// On success the affinity is updated to the responding node. A
    /// response from a node other than the pinned one only counts as a
    /// success if `expect_redirect` is set.
    pub async fn request_once(
        &mut self,
        path: &str,
        timeout_after: Duration,
        expect_redirect: bool,
    ) -> RequestResult {
        self.state = ClientState::Requesting;
        let result = self.attempt(path, timeout_after, expect_redirect).await;
        self.state = if result.ok {
            ClientState::Succeeded
        } else {
            ClientState::Failed
        };
        result
    }

    /// Repeatedly requests `path` for `duration` in the background.
    pub fn run_failover_window(mut self, path: impl Into<String>, duration: Duration) -> FailoverWindow {
        let path = path.into();
        let bound = duration + self.attempt_timeout + self.pause + JOIN_GRACE;

        let handle = tokio::spawn(async move {
            self.state = ClientState::Retrying;
            info!(
                path = %path,
                duration = ?duration,
                node = ?self.affinity.node,
                "Starting failover window."
            );

            let mut report = WindowReport::default();
            let deadline = Instant::now() + duration;
            while Instant::now() < deadline {
                let result = self.attempt(&path, self.attempt_timeout, false).await;
                if !result.ok {
                    warn!(attempt = report.attempts + 1, result = %result, "Request failed.");
                }
                report.record(&result);
                sleep(self.pause).await;
            }

            self.state = if report.result_ok() {
                ClientState::Succeeded
            } else {
                ClientState::Failed
            };
            info!(report = %report, "Failover window finished.");

            (self, report)
        });

        FailoverWindow { handle, bound }
    }

    async fn attempt(&mut self, path: &str, timeout_after: Duration, expect_redirect: bool) -> RequestResult {
        let started = Instant::now();
        let outcome = timeout(timeout_after, self.send(path))
            .await
            .map_err(|_| format!("request timed out after {timeout_after:?}"))
            .and_then(|r| r);
        let latency = started.elapsed();

        let (status, session, body) = match outcome {
            Ok(response) => response,
            Err(error) => {
                return RequestResult {
                    responding_node: None,
                    ok: false,
                    latency,
                    status: None,
                    error: Some(error),
                }
            },
        };

        let session = session.or_else(|| self.affinity.session.clone());
        let responding_node = session
            .as_deref()
            .and_then(route_from_session_id)
            .map(String::from);

        let error = self.validate(status, &body, responding_node.as_deref(), expect_redirect);
        if error.is_none() {
            if let Some(node) = responding_node.as_ref() {
                if self.affinity.node.as_ref() != Some(node) {
                    debug!(previous = ?self.affinity.node, node = %node, "Client affinity changed.");
                }
            }
            self.affinity = AffinityRecord {
                node: responding_node.clone(),
                session,
            };
        }

        RequestResult {
            responding_node,
            ok: error.is_none(),
            latency,
            status: Some(status),
            error,
        }
    }

    fn validate(
        &self,
        status: StatusCode,
        body: &str,
        responding_node: Option<&str>,
        expect_redirect: bool,
    ) -> Option<String> {
        if status != StatusCode::OK {
            return Some(format!("unexpected status {status}"));
        }

        if !body.starts_with(&self.signature) {
            return Some(format!("response does not carry the {:?} signature", self.signature));
        }

        let node = match responding_node {
            None => return Some("the responding node could not be determined".to_string()),
            Some(node) => node,
        };

        if self.excluded.contains(node) {
            return Some(format!("served by excluded node {node}"));
        }

        match self.affinity.node.as_deref() {
            Some(expected) if expected != node && !expect_redirect => {
                Some(format!("served by {node} while pinned to {expected}"))
            },
            _ => None,
        }
    }

    /// Sends the request, returning the status, any new session and the body.
    async fn send(&self, path: &str) -> Result<(StatusCode, Option<String>, String), String> {
        let mut builder = Request::get(format!("http://{}{}", self.proxy_addr, path));
        if let Some(session) = self.affinity.session.as_ref() {
            builder = builder.header(COOKIE, format!("{SESSION_COOKIE}={session}"));
        }
        let request = builder.body(Body::empty()).map_err(|e| e.to_string())?;

        let response = self.client.request(request).await.map_err(|e| e.to_string())?;
        let status = response.status();
        let session = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_id_from_set_cookie)
            .map(String::from);

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| e.to_string())?;

        Ok((status, session, String::from_utf8_lossy(&body).into_owned()))
    }
}

/// A failover window running in the background.
pub struct FailoverWindow {
    handle: JoinHandle<(FailoverClient, WindowReport)>,
    bound: Duration,
}

impl FailoverWindow {
    /// Waits for the window to finish, handing back the client.
    ///
    /// The wait is bounded, a window which overruns is aborted.
    pub async fn join(self) -> Result<(FailoverClient, WindowReport), ClientError> {
        let mut handle = self.handle;
        match timeout(self.bound, &mut handle).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(ClientError::Panicked(e.to_string())),
            Err(_) => {
                handle.abort();
                Err(ClientError::JoinTimeout(self.bound))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(node: Option<&str>, ok: bool) -> RequestResult {
        RequestResult {
            responding_node: node.map(String::from),
            ok,
            latency: Duration::from_millis(1),
            status: Some(StatusCode::OK),
            error: (!ok).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_window_report() {
        let mut report = WindowReport::default();
        assert!(!report.result_ok());

        report.record(&result(Some("node4"), true));
        report.record(&result(Some("node4"), true));
        assert!(report.result_ok());
        assert_eq!(report.nodes.get("node4"), Some(&2));

        report.record(&result(Some("node3"), false));
        report.record(&result(None, false));
        assert!(!report.result_ok());
        assert_eq!(report.attempts, 4);
        assert_eq!(report.failed, 2);
        assert_eq!(
            report.first_failure.and_then(|r| r.responding_node).as_deref(),
            Some("node3")
        );
    }

    #[test]
    fn test_validation() {
        let mut client = FailoverClient::new("127.0.0.1:1".parse().unwrap(), "MyCount");
        let body = "MyCount: count=1 node=node3 path=/test/MyCount";

        assert_eq!(client.validate(StatusCode::OK, body, Some("node3"), false), None);
        assert!(client.validate(StatusCode::NOT_FOUND, body, Some("node3"), false).is_some());
        assert!(client.validate(StatusCode::OK, "Other", Some("node3"), false).is_some());
        assert!(client.validate(StatusCode::OK, body, None, false).is_some());

        client.set_node("node4");
        assert!(client.validate(StatusCode::OK, body, Some("node3"), false).is_some());
        assert_eq!(client.validate(StatusCode::OK, body, Some("node3"), true), None);

        client.clear_node();
        client.exclude_node("node3");
        assert!(client.validate(StatusCode::OK, body, Some("node3"), true).is_some());
    }

    #[tokio::test]
    async fn test_unreachable_proxy_fails_fast() {
        let addr = test_helper::get_unused_addr();
        let mut client = FailoverClient::new(addr, "MyCount");

        let result = client
            .request_once("/test/MyCount", Duration::from_secs(1), false)
            .await;
        assert!(!result.ok);
        assert!(result.error.is_some());
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(client.affinity(), &AffinityRecord::default());
    }

    #[tokio::test]
    async fn test_window_against_unreachable_proxy() -> anyhow::Result<()> {
        let addr = test_helper::get_unused_addr();
        let mut client = FailoverClient::new(addr, "MyCount")
            .with_attempt_timeout(Duration::from_millis(200))
            .with_pause(Duration::from_millis(20));
        client.set_node("node4");

        let window = client.run_failover_window("/test/MyCount", Duration::from_millis(300));
        let (client, report) = window.join().await?;

        assert!(report.attempts > 1);
        assert_eq!(report.failed, report.attempts);
        assert_eq!(report.succeeded, 0);
        assert!(!report.result_ok());
        assert!(report.first_failure.and_then(|r| r.error).is_some());
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(client.node(), Some("node4"));

        Ok(())
    }
}
