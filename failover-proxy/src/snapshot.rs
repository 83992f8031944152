use std::collections::{BTreeMap, BTreeSet};

use crate::error::ProxyError;
use crate::table::ContextStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub balancer: String,
    pub domain: String,
    pub host: String,
    pub port: u16,
    pub elected: u64,
    pub load: i32,
    pub contexts: BTreeMap<String, ContextStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A point in time view of the nodes and contexts a proxy knows about.
pub struct ClusterSnapshot {
    nodes: BTreeMap<String, NodeSnapshot>,
}

impl ClusterSnapshot {
    /// Parses the plain text output of the `INFO` manager command.
    pub fn parse_info(info: &str) -> Result<Self, ProxyError> {
        let mut ids = BTreeMap::new();
        let mut nodes = BTreeMap::new();

        for line in info.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line.starts_with("Node: [") {
                let (id, node) = parse_node(line)?;
                ids.insert(id, node.name.clone());
                nodes.insert(node.name.clone(), node);
            } else if line.starts_with("Context: [") {
                let (id, path, status) = parse_context(line)?;
                let node = ids
                    .get(&id)
                    .and_then(|name| nodes.get_mut(name))
                    .ok_or_else(|| malformed("context of an unknown node", line))?;
                node.contexts.insert(path, status);
            }
            // Vhost lines carry nothing a snapshot keeps.
        }

        Ok(Self { nodes })
    }

    /// The names of every node the proxy knows about.
    pub fn node_names(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, name: &str) -> Option<&NodeSnapshot> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSnapshot> {
        self.nodes.values()
    }

    /// The status of a context on a node, if the proxy knows about it.
    pub fn context_status(&self, node: &str, path: &str) -> Option<ContextStatus> {
        self.nodes.get(node)?.contexts.get(path).copied()
    }

    pub fn has_context(&self, node: &str, path: &str) -> bool {
        self.context_status(node, path).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn malformed(what: &str, line: &str) -> ProxyError {
    ProxyError::MalformedInfo(format!("{what}: {line:?}"))
}

/// Parses a bracketed id list such as `[1:1:2]` at the start of `rest`.
fn parse_ids<'a>(rest: &'a str, line: &str) -> Result<(Vec<u32>, &'a str), ProxyError> {
    let rest = rest
        .strip_prefix('[')
        .ok_or_else(|| malformed("missing id", line))?;
    let (ids, rest) = rest
        .split_once(']')
        .ok_or_else(|| malformed("unterminated id", line))?;
    let ids = ids
        .split(':')
        .map(|id| id.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed("invalid id", line))?;

    Ok((ids, rest))
}

fn fields(rest: &str) -> BTreeMap<&str, &str> {
    rest.split(',')
        .filter_map(|field| field.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

fn parse_node(line: &str) -> Result<(u32, NodeSnapshot), ProxyError> {
    let rest = line.trim_start_matches("Node: ");
    let (ids, rest) = parse_ids(rest, line)?;
    let id = ids.first().copied().ok_or_else(|| malformed("missing id", line))?;
    let fields = fields(rest);

    let name = fields
        .get("Name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| malformed("missing node name", line))?;
    let get = |key: &str| fields.get(key).copied().unwrap_or_default().to_string();
    let number = |key: &str| fields.get(key).and_then(|v| v.parse::<i64>().ok());

    let node = NodeSnapshot {
        name: name.to_string(),
        balancer: get("Balancer"),
        domain: get("LBGroup"),
        host: get("Host"),
        port: number("Port")
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| malformed("invalid port", line))?,
        elected: number("Elected")
            .and_then(|e| u64::try_from(e).ok())
            .unwrap_or_default(),
        load: number("Load")
            .and_then(|l| i32::try_from(l).ok())
            .unwrap_or_default(),
        contexts: BTreeMap::new(),
    };

    Ok((id, node))
}

fn parse_context(line: &str) -> Result<(u32, String, ContextStatus), ProxyError> {
    let rest = line.trim_start_matches("Context: ");
    let (ids, rest) = parse_ids(rest, line)?;
    let id = ids.first().copied().ok_or_else(|| malformed("missing id", line))?;
    let fields = fields(rest);

    let path = fields
        .get("Context")
        .ok_or_else(|| malformed("missing context path", line))?;
    let status = fields
        .get("Status")
        .ok_or_else(|| malformed("missing context status", line))?
        .parse::<ContextStatus>()
        .map_err(|e| malformed(&e, line))?;

    Ok((id, path.to_string(), status))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &str = "\
Node: [1],Name: node3,Balancer: mycluster,LBGroup: dom1,Host: 127.0.0.1,Port: 8013,Type: http,Flushpackets: Off,Flushwait: 10,Ping: 10,Smax: 1,Ttl: 60,Elected: 3,Read: 0,Transfered: 0,Connected: 0,Load: 1
Node: [2],Name: node4,Balancer: mycluster,LBGroup: dom1,Host: 127.0.0.1,Port: 8014,Type: http,Flushpackets: Off,Flushwait: 10,Ping: 10,Smax: 1,Ttl: 60,Elected: 0,Read: 0,Transfered: 0,Connected: 0,Load: -1
Vhost: [1:1:1], Alias: localhost
Vhost: [2:1:1], Alias: localhost
Context: [1:1:1], Context: /test, Status: ENABLED
Context: [2:1:1], Context: /test, Status: DISABLED
";

    #[test]
    fn test_parse_info() {
        let snapshot = ClusterSnapshot::parse_info(INFO).expect("Parse info");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.node_names(),
            BTreeSet::from(["node3".to_string(), "node4".to_string()])
        );

        let node3 = snapshot.node("node3").unwrap();
        assert_eq!(node3.port, 8013);
        assert_eq!(node3.elected, 3);
        assert_eq!(node3.domain, "dom1");
        assert_eq!(snapshot.node("node4").unwrap().load, -1);

        assert_eq!(
            snapshot.context_status("node3", "/test"),
            Some(ContextStatus::Enabled)
        );
        assert_eq!(
            snapshot.context_status("node4", "/test"),
            Some(ContextStatus::Disabled)
        );
        assert!(!snapshot.has_context("node3", "/other"));
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert!(ClusterSnapshot::parse_info("").unwrap().is_empty());

        let orphan = "Context: [7:1:1], Context: /test, Status: ENABLED";
        assert!(matches!(
            ClusterSnapshot::parse_info(orphan),
            Err(ProxyError::MalformedInfo(_))
        ));

        let bad_status = "Node: [1],Name: node3,Port: 8013\nContext: [1:1:1], Context: /test, Status: GONE";
        assert!(ClusterSnapshot::parse_info(bad_status).is_err());
    }
}
