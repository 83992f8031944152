use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::Session;

/// The request details handed to an [Application].
pub struct AppRequest<'a> {
    /// The name of the node serving the request.
    pub node: &'a str,
    /// The full request path, including the context path.
    pub path: &'a str,
    /// If the session was created for this request.
    pub new_session: bool,
}

/// An application deployed within a node's context.
///
/// Responses are expected to start with `"{name}:"` which is used by
/// clients as the signature of a correct response.
pub trait Application: Send + Sync + 'static {
    /// The name the application is deployed under.
    fn name(&self) -> &str;

    /// Produces the response body for a request within the given session.
    fn handle(&self, request: &AppRequest<'_>, session: &mut Session) -> String;
}

#[derive(Debug, Default)]
/// Counts the requests made within each session.
pub struct MyCount {
    total: AtomicU64,
    sessions: AtomicU64,
}

impl MyCount {
    /// The number of requests handled across all sessions.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// The number of sessions which were started by this application.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }
}

impl Application for MyCount {
    fn name(&self) -> &str {
        "MyCount"
    }

    fn handle(&self, request: &AppRequest<'_>, session: &mut Session) -> String {
        self.total.fetch_add(1, Ordering::Relaxed);
        if request.new_session {
            self.sessions.fetch_add(1, Ordering::Relaxed);
        }

        let count = session
            .get("count")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        session.set("count", count.to_string());

        format!(
            "{}: count={} node={} path={}",
            self.name(),
            count,
            request.node,
            request.path,
        )
    }
}
