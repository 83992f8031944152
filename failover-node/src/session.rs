use std::collections::BTreeMap;

use parking_lot::Mutex;

/// The cookie carrying the session id, shared by nodes, the proxy and clients.
pub static SESSION_COOKIE: &str = "JSESSIONID";

#[derive(Debug, Default, Clone)]
/// The attributes of a single client session held by a node.
pub struct Session {
    attributes: BTreeMap<String, String>,
}

impl Session {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }
}

#[derive(Default)]
/// The sessions a node currently knows about, keyed by session id.
pub(crate) struct SessionStore {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl SessionStore {
    /// Runs `f` against the session with the given id.
    ///
    /// If the id is unknown (or missing) a new session is created for `route`
    /// and its id is returned alongside the result so it can be sent back to
    /// the client.
    pub(crate) fn with_session<T>(
        &self,
        id: Option<&str>,
        route: &str,
        f: impl FnOnce(&mut Session, bool) -> T,
    ) -> (T, Option<String>) {
        let mut lock = self.sessions.lock();

        if let Some(session) = id.and_then(|id| lock.get_mut(id)) {
            return (f(session, false), None);
        }

        let new_id = new_session_id(route);
        let session = lock.entry(new_id.clone()).or_default();
        (f(session, true), Some(new_id))
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.sessions.lock().clear();
    }
}

/// Creates a new session id which carries the route of the node owning it.
pub fn new_session_id(route: &str) -> String {
    format!("{:016X}.{}", rand::random::<u64>(), route)
}

/// Extracts the node route from a session id of the form `<id>.<route>`.
///
/// The generated id never contains a `.`, the route may.
pub fn route_from_session_id(session_id: &str) -> Option<&str> {
    session_id
        .split_once('.')
        .map(|(_, route)| route)
        .filter(|route| !route.is_empty())
}

/// Finds the session id within a `Cookie` header value.
pub fn session_id_from_cookie(header: &str) -> Option<&str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Finds the session id within a `Set-Cookie` header value.
pub fn session_id_from_set_cookie(header: &str) -> Option<&str> {
    let first = header.split(';').next()?;
    let (name, value) = first.trim().split_once('=')?;
    (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
}

/// Removes the session cookie from a `Cookie` header value.
///
/// Returns `None` if no other cookies remain.
pub fn strip_session_cookie(header: &str) -> Option<String> {
    let remaining = header
        .split(';')
        .map(str::trim)
        .filter(|pair| {
            pair.split_once('=')
                .map(|(name, _)| name != SESSION_COOKIE)
                .unwrap_or(true)
        })
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>();

    if remaining.is_empty() {
        None
    } else {
        Some(remaining.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_carries_route() {
        let id = new_session_id("node3");
        assert_eq!(route_from_session_id(&id), Some("node3"));
        assert_eq!(route_from_session_id("ABCDEF"), None);
        assert_eq!(route_from_session_id("ABCDEF."), None);
    }

    #[test]
    fn test_dotted_routes() {
        let id = new_session_id("node.3");
        assert_eq!(route_from_session_id(&id), Some("node.3"));

        let id = new_session_id("dc1.rack2.node4");
        assert_eq!(route_from_session_id(&id), Some("dc1.rack2.node4"));

        let header = format!("JSESSIONID={id}; Path=/test");
        let session = session_id_from_set_cookie(&header).expect("Session cookie is set");
        assert_eq!(route_from_session_id(session), Some("dc1.rack2.node4"));
    }

    #[test]
    fn test_cookie_parsing() {
        let header = "theme=dark; JSESSIONID=0000000000000001.node4; lang=en";
        assert_eq!(
            session_id_from_cookie(header),
            Some("0000000000000001.node4")
        );
        assert_eq!(session_id_from_cookie("theme=dark"), None);
        assert_eq!(
            strip_session_cookie(header).as_deref(),
            Some("theme=dark; lang=en")
        );
        assert_eq!(strip_session_cookie("JSESSIONID=abc.node3"), None);

        let set_cookie = "JSESSIONID=0000000000000002.node3; Path=/test";
        assert_eq!(
            session_id_from_set_cookie(set_cookie),
            Some("0000000000000002.node3")
        );
        assert_eq!(session_id_from_set_cookie("other=1; Path=/"), None);
    }

    #[test]
    fn test_store_reuses_known_sessions() {
        let store = SessionStore::default();

        let (_, created) = store.with_session(None, "node3", |s, _| s.set("count", "1"));
        let id = created.expect("A new session should be created");

        let (count, created) =
            store.with_session(Some(&id), "node3", |s, _| s.get("count").map(String::from));
        assert!(created.is_none());
        assert_eq!(count.as_deref(), Some("1"));

        let (created_new, created) =
            store.with_session(Some("unknown.node4"), "node3", |_, new| new);
        assert!(created_new);
        assert!(created.is_some(), "Unknown ids should start a new session");
        assert_eq!(store.len(), 2);

        store.clear();
        assert_eq!(store.len(), 0);
    }
}
