use std::collections::BTreeSet;

use failover_node::SESSION_COOKIE;
use rand::seq::SliceRandom;

use crate::table::{ContextStatus, DEFAULT_BALANCER};

#[derive(Debug, Clone, PartialEq, Eq)]
/// The balancer settings nodes send along with their configuration.
pub struct BalancerConfig {
    pub name: String,
    /// Route requests carrying a session back to the node owning it.
    pub sticky_session: bool,
    pub sticky_session_cookie: String,
    /// Strip the session cookie when failing over to another node.
    pub sticky_session_remove: bool,
    /// Refuse the request instead of failing over when the session's node
    /// is unavailable.
    pub sticky_session_force: bool,
    /// How many other nodes to try after the first one failed.
    pub max_attempts: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_BALANCER.to_string(),
            sticky_session: true,
            sticky_session_cookie: SESSION_COOKIE.to_string(),
            sticky_session_remove: false,
            sticky_session_force: true,
            max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A node able to serve a request path.
pub struct Candidate {
    pub route: String,
    pub host: String,
    pub port: u16,
    pub status: ContextStatus,
    pub load: i32,
    pub elected: u64,
}

impl Candidate {
    #[inline]
    fn is_usable(&self) -> bool {
        self.load >= 0 && self.status != ContextStatus::Stopped
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Election {
    /// Forward the request to this node.
    Node(Candidate),
    /// The session's node is unavailable and sticky sessions are forced.
    StickyUnavailable,
    /// No node is left to try.
    Exhausted,
}

/// Picks the node a request should be forwarded to.
///
/// The node named by the session route is preferred while it hosts the
/// path, even if the context is disabled. Otherwise the enabled candidate
/// with the fewest elections wins, ties are broken randomly. Nodes in
/// `tried` have already failed this request and are skipped.
pub fn elect(
    candidates: &[Candidate],
    sticky_route: Option<&str>,
    tried: &BTreeSet<String>,
    config: &BalancerConfig,
) -> Election {
    if let Some(route) = sticky_route.filter(|_| config.sticky_session) {
        let sticky = candidates
            .iter()
            .find(|c| c.route == route && c.is_usable() && !tried.contains(&c.route));

        match sticky {
            Some(candidate) => return Election::Node(candidate.clone()),
            None if config.sticky_session_force => return Election::StickyUnavailable,
            None => {},
        }
    }

    let available = candidates
        .iter()
        .filter(|c| {
            c.status == ContextStatus::Enabled && c.is_usable() && !tried.contains(&c.route)
        })
        .collect::<Vec<_>>();

    let fewest = match available.iter().map(|c| c.elected).min() {
        Some(fewest) => fewest,
        None => return Election::Exhausted,
    };

    let ties = available
        .into_iter()
        .filter(|c| c.elected == fewest)
        .collect::<Vec<_>>();

    match ties.choose(&mut rand::thread_rng()) {
        Some(candidate) => Election::Node((*candidate).clone()),
        None => Election::Exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(route: &str, status: ContextStatus, load: i32, elected: u64) -> Candidate {
        Candidate {
            route: route.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8013,
            status,
            load,
            elected,
        }
    }

    fn routed(election: Election) -> String {
        match election {
            Election::Node(c) => c.route,
            other => panic!("Expected a node to be elected, got {other:?}"),
        }
    }

    #[test]
    fn test_least_elected_wins() {
        let candidates = [
            candidate("node3", ContextStatus::Enabled, 1, 4),
            candidate("node4", ContextStatus::Enabled, 1, 2),
            candidate("node5", ContextStatus::Disabled, 1, 0),
            candidate("node6", ContextStatus::Enabled, -1, 0),
        ];
        let config = BalancerConfig::default();

        for _ in 0..16 {
            let election = elect(&candidates, None, &BTreeSet::new(), &config);
            assert_eq!(routed(election), "node4");
        }
    }

    #[test]
    fn test_sticky_routes() {
        let candidates = [
            candidate("node3", ContextStatus::Disabled, 1, 0),
            candidate("node4", ContextStatus::Enabled, 1, 9),
        ];
        let mut config = BalancerConfig::default();

        // Disabled contexts keep serving their sessions.
        let election = elect(&candidates, Some("node3"), &BTreeSet::new(), &config);
        assert_eq!(routed(election), "node3");

        let tried = BTreeSet::from(["node3".to_string()]);
        assert_eq!(
            elect(&candidates, Some("node3"), &tried, &config),
            Election::StickyUnavailable
        );

        config.sticky_session_force = false;
        let election = elect(&candidates, Some("node3"), &tried, &config);
        assert_eq!(routed(election), "node4");

        let tried = BTreeSet::from(["node3".to_string(), "node4".to_string()]);
        assert_eq!(
            elect(&candidates, Some("node3"), &tried, &config),
            Election::Exhausted
        );
    }

    #[test]
    fn test_sticky_disabled_balances() {
        let candidates = [
            candidate("node3", ContextStatus::Enabled, 1, 5),
            candidate("node4", ContextStatus::Enabled, 1, 0),
        ];
        let config = BalancerConfig {
            sticky_session: false,
            ..Default::default()
        };

        let election = elect(&candidates, Some("node3"), &BTreeSet::new(), &config);
        assert_eq!(routed(election), "node4");
    }
}
