use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Write};
use std::str::FromStr;

use parking_lot::RwLock;

use crate::balancer::{BalancerConfig, Candidate};
use crate::error::McmpError;
use crate::mcmp::{McmpCommand, McmpMessage, VERSION_PROTOCOL};

pub static DEFAULT_BALANCER: &str = "mycluster";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextStatus {
    Enabled,
    Disabled,
    Stopped,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::Enabled => "ENABLED",
            ContextStatus::Disabled => "DISABLED",
            ContextStatus::Stopped => "STOPPED",
        }
    }
}

impl Display for ContextStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ENABLED" => Ok(ContextStatus::Enabled),
            "DISABLED" => Ok(ContextStatus::Disabled),
            "STOPPED" => Ok(ContextStatus::Stopped),
            other => Err(format!("unknown context status {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
/// A node as the manager knows it.
pub struct NodeEntry {
    pub id: u32,
    pub route: String,
    pub balancer: String,
    pub domain: String,
    pub host: String,
    pub port: u16,
    pub kind: String,
    /// The load factor last reported, `-1` marks the node as broken.
    pub load: i32,
    pub elected: u64,
    pub aliases: Vec<String>,
    pub contexts: BTreeMap<String, ContextStatus>,
}

impl NodeEntry {
    /// The status of the context with the longest path covering
    /// `request_path`.
    pub fn context_for(&self, request_path: &str) -> Option<ContextStatus> {
        self.contexts
            .iter()
            .filter(|(path, _)| path_matches(path, request_path))
            .max_by_key(|(path, _)| path.len())
            .map(|(_, status)| *status)
    }
}

fn path_matches(context: &str, request_path: &str) -> bool {
    if context == "/" {
        return true;
    }

    match request_path.strip_prefix(context) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Default)]
struct TableState {
    nodes: BTreeMap<String, NodeEntry>,
    balancers: BTreeMap<String, BalancerConfig>,
    next_id: u32,
}

#[derive(Default)]
/// The node, balancer and context registry fed by manager commands.
pub struct ManagerTable {
    state: RwLock<TableState>,
}

impl ManagerTable {
    /// Applies a manager command, returning the response body.
    pub fn apply(&self, msg: &McmpMessage) -> Result<String, McmpError> {
        match msg.command {
            McmpCommand::Config => self.config(msg),
            McmpCommand::EnableApp => self.app_command(msg, Some(ContextStatus::Enabled)),
            McmpCommand::DisableApp => self.app_command(msg, Some(ContextStatus::Disabled)),
            McmpCommand::StopApp => self.app_command(msg, Some(ContextStatus::Stopped)),
            McmpCommand::RemoveApp => self.app_command(msg, None),
            McmpCommand::Status => self.status(msg),
            McmpCommand::Ping => self.ping(msg),
            McmpCommand::Info => Ok(self.render_info()),
            McmpCommand::Version => Ok(format!(
                "release: {}, protocol: {}\n",
                env!("CARGO_PKG_VERSION"),
                VERSION_PROTOCOL,
            )),
        }
    }

    fn config(&self, msg: &McmpMessage) -> Result<String, McmpError> {
        let mut balancer = BalancerConfig::default();
        let mut route = None;
        let mut domain = String::new();
        let mut host = "localhost".to_string();
        let mut port = 8009;
        let mut kind = "ajp".to_string();
        let mut aliases = Vec::new();
        let mut contexts = Vec::new();

        for (key, value) in &msg.params {
            match key.to_ascii_lowercase().as_str() {
                "balancer" => balancer.name = value.to_ascii_lowercase(),
                "stickysession" => balancer.sticky_session = parse_flag(key, value)?,
                "stickysessioncookie" => balancer.sticky_session_cookie = value.clone(),
                "stickysessionremove" => balancer.sticky_session_remove = parse_flag(key, value)?,
                "stickysessionforce" => balancer.sticky_session_force = parse_flag(key, value)?,
                "maxattempts" => {
                    balancer.max_attempts = value
                        .parse()
                        .map_err(|_| McmpError::InvalidField(key.clone()))?
                },
                "jvmroute" => route = Some(value.clone()),
                "domain" => domain = value.clone(),
                "host" => host = value.clone(),
                "port" => {
                    port = value
                        .parse()
                        .map_err(|_| McmpError::InvalidField(key.clone()))?
                },
                "type" => kind = value.clone(),
                "alias" => aliases.extend(value.split(',').map(String::from)),
                "context" => contexts.extend(value.split(',').map(String::from)),
                // Connection tuning the in-process proxy has no use for.
                "stickysessionpath" | "waitworker" | "reversed" | "flushpackets"
                | "flushwait" | "ping" | "smax" | "ttl" | "timeout" => {},
                _ => return Err(McmpError::InvalidField(key.clone())),
            }
        }

        let route = route.filter(|r| !r.is_empty()).ok_or(McmpError::EmptyRoute)?;
        if !aliases.is_empty() && contexts.is_empty() {
            return Err(McmpError::AliasWithoutContext);
        }
        if !contexts.is_empty() && aliases.is_empty() {
            return Err(McmpError::ContextWithoutAlias);
        }

        let mut state = self.state.write();
        let state = &mut *state;
        let is_new = !state.nodes.contains_key(&route);
        if is_new {
            state.next_id += 1;
        }

        let id = state.next_id;
        let entry = state.nodes.entry(route.clone()).or_insert_with(|| NodeEntry {
            id,
            route: route.clone(),
            balancer: String::new(),
            domain: String::new(),
            host: host.clone(),
            port,
            kind: kind.clone(),
            load: 1,
            elected: 0,
            aliases: Vec::new(),
            contexts: BTreeMap::new(),
        });

        if !is_new && (entry.host != host || entry.port != port) {
            // The route now points at a different endpoint, nothing it
            // previously hosted can be assumed to be there.
            entry.contexts.clear();
            entry.aliases.clear();
            entry.elected = 0;
        }

        entry.balancer = balancer.name.clone();
        entry.domain = domain;
        entry.host = host;
        entry.port = port;
        entry.kind = kind;
        for alias in aliases {
            if !entry.aliases.contains(&alias) {
                entry.aliases.push(alias);
            }
        }
        for context in contexts {
            entry.contexts.entry(context).or_insert(ContextStatus::Stopped);
        }

        state.balancers.insert(balancer.name.clone(), balancer);
        Ok(String::new())
    }

    fn app_command(
        &self,
        msg: &McmpMessage,
        status: Option<ContextStatus>,
    ) -> Result<String, McmpError> {
        let mut route = None;
        let mut alias = None;
        let mut context = None;
        for (key, value) in &msg.params {
            match key.to_ascii_lowercase().as_str() {
                "jvmroute" => route = Some(value.as_str()),
                "alias" => alias = Some(value.as_str()),
                "context" => context = Some(value.as_str()),
                _ => return Err(McmpError::InvalidField(key.clone())),
            }
        }

        let route = route.filter(|r| !r.is_empty()).ok_or(McmpError::EmptyRoute)?;
        if alias.is_some() && context.is_none() {
            return Err(McmpError::AliasWithoutContext);
        }
        if context.is_some() && alias.is_none() {
            return Err(McmpError::ContextWithoutAlias);
        }

        let mut state = self.state.write();
        let entry = match state.nodes.get_mut(route) {
            Some(entry) => entry,
            // Removing something already gone is not an error.
            None if status.is_none() => return Ok(String::new()),
            None => return Err(McmpError::UnknownNode(route.to_string())),
        };

        if msg.wildcard {
            match status {
                Some(status) => {
                    for value in entry.contexts.values_mut() {
                        *value = status;
                    }
                },
                None => {
                    state.nodes.remove(route);
                },
            }
            return Ok(String::new());
        }

        let (alias, context) = alias.zip(context).ok_or(McmpError::MissingField)?;
        match status {
            Some(status) => {
                if !entry.aliases.iter().any(|a| a == alias) {
                    entry.aliases.push(alias.to_string());
                }
                entry.contexts.insert(context.to_string(), status);
            },
            None => {
                entry.contexts.remove(context);
            },
        }

        Ok(String::new())
    }

    fn status(&self, msg: &McmpMessage) -> Result<String, McmpError> {
        let mut route = None;
        let mut load = None;
        for (key, value) in &msg.params {
            match key.to_ascii_lowercase().as_str() {
                "jvmroute" => route = Some(value.as_str()),
                "load" => load = value.parse::<i32>().ok(),
                _ => return Err(McmpError::InvalidField(key.clone())),
            }
        }

        let route = route.filter(|r| !r.is_empty()).ok_or(McmpError::EmptyRoute)?;
        let mut state = self.state.write();
        let entry = state
            .nodes
            .get_mut(route)
            .ok_or_else(|| McmpError::UnknownNode(route.to_string()))?;
        if let Some(load) = load {
            entry.load = load;
        }

        let state = if entry.load < 0 { "NOTOK" } else { "OK" };
        Ok(format!(
            "Type=STATUS-RSP&JVMRoute={route}&State={state}&id={}\n",
            entry.id
        ))
    }

    fn ping(&self, msg: &McmpMessage) -> Result<String, McmpError> {
        let route = match msg.route() {
            None => return Ok("Type=PING-RSP&State=OK\n".to_string()),
            Some(route) => route,
        };

        let state = self.state.read();
        let entry = state
            .nodes
            .get(route)
            .ok_or_else(|| McmpError::UnknownNode(route.to_string()))?;
        let state = if entry.load < 0 { "NOTOK" } else { "OK" };
        Ok(format!(
            "Type=PING-RSP&JVMRoute={route}&State={state}&id={}\n",
            entry.id
        ))
    }

    /// Renders the table in the plain text `INFO` format.
    pub fn render_info(&self) -> String {
        let state = self.state.read();
        let mut out = String::new();

        for node in state.nodes.values() {
            let _ = writeln!(
                out,
                "Node: [{}],Name: {},Balancer: {},LBGroup: {},Host: {},Port: {},Type: {},\
                 Flushpackets: Off,Flushwait: 10,Ping: 10,Smax: 1,Ttl: 60,\
                 Elected: {},Read: 0,Transfered: 0,Connected: 0,Load: {}",
                node.id,
                node.route,
                node.balancer,
                node.domain,
                node.host,
                node.port,
                node.kind,
                node.elected,
                node.load,
            );
        }

        for node in state.nodes.values() {
            for (i, alias) in node.aliases.iter().enumerate() {
                let _ = writeln!(out, "Vhost: [{}:1:{}], Alias: {}", node.id, i + 1, alias);
            }
        }

        for node in state.nodes.values() {
            for (i, (path, status)) in node.contexts.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "Context: [{}:1:{}], Context: {}, Status: {}",
                    node.id,
                    i + 1,
                    path,
                    status,
                );
            }
        }

        out
    }

    /// The nodes able to serve `request_path` and the balancer they belong to.
    pub fn candidates(&self, request_path: &str) -> (Vec<Candidate>, BalancerConfig) {
        let state = self.state.read();
        let candidates = state
            .nodes
            .values()
            .filter_map(|node| {
                let status = node.context_for(request_path)?;
                (status != ContextStatus::Stopped).then(|| Candidate {
                    route: node.route.clone(),
                    host: node.host.clone(),
                    port: node.port,
                    status,
                    load: node.load,
                    elected: node.elected,
                })
            })
            .collect::<Vec<_>>();

        let balancer = candidates
            .first()
            .and_then(|c| state.nodes.get(&c.route))
            .and_then(|node| state.balancers.get(&node.balancer))
            .cloned()
            .unwrap_or_default();

        (candidates, balancer)
    }

    /// Marks a node as elected for one more request.
    pub fn record_election(&self, route: &str) {
        if let Some(node) = self.state.write().nodes.get_mut(route) {
            node.elected += 1;
        }
    }

    pub fn node(&self, route: &str) -> Option<NodeEntry> {
        self.state.read().nodes.get(route).cloned()
    }

    pub fn balancer(&self, name: &str) -> Option<BalancerConfig> {
        self.state.read().balancers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, McmpError> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "1" => Ok(true),
        "no" | "off" | "false" | "0" => Ok(false),
        _ => Err(McmpError::InvalidField(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(route: &str, port: u16) -> McmpMessage {
        McmpMessage::new(McmpCommand::Config)
            .with_param("JVMRoute", route)
            .with_param("Host", "127.0.0.1")
            .with_param("Port", port)
            .with_param("Type", "http")
            .with_param("StickySessionForce", "No")
            .with_param("Maxattempts", 3)
    }

    fn app(command: McmpCommand, route: &str, path: &str) -> McmpMessage {
        McmpMessage::new(command)
            .with_param("JVMRoute", route)
            .with_param("Alias", "localhost")
            .with_param("Context", path)
    }

    #[test]
    fn test_config_and_app_commands() {
        let table = ManagerTable::default();
        table.apply(&config("node3", 8013)).unwrap();
        table.apply(&config("node4", 8014)).unwrap();
        table.apply(&app(McmpCommand::EnableApp, "node3", "/test")).unwrap();
        table.apply(&app(McmpCommand::DisableApp, "node4", "/test")).unwrap();

        let node = table.node("node3").expect("node3 is registered");
        assert_eq!(node.id, 1);
        assert_eq!(node.contexts.get("/test"), Some(&ContextStatus::Enabled));
        assert_eq!(table.node("node4").unwrap().id, 2);

        let balancer = table.balancer(DEFAULT_BALANCER).unwrap();
        assert!(!balancer.sticky_session_force);
        assert_eq!(balancer.max_attempts, 3);

        let (candidates, _) = table.candidates("/test/MyCount");
        assert_eq!(candidates.len(), 2);
        assert!(table.candidates("/other").0.is_empty());

        table.apply(&app(McmpCommand::StopApp, "node3", "/test")).unwrap();
        assert_eq!(table.candidates("/test/MyCount").0.len(), 1);

        table.apply(&app(McmpCommand::RemoveApp, "node3", "/test")).unwrap();
        assert!(table.node("node3").unwrap().contexts.is_empty());

        // Reconfiguring with the same endpoint keeps what the node hosts.
        table.apply(&config("node4", 8014)).unwrap();
        assert_eq!(table.node("node4").unwrap().contexts.len(), 1);
        table.apply(&config("node4", 9014)).unwrap();
        assert!(table.node("node4").unwrap().contexts.is_empty());
    }

    #[test]
    fn test_remove_node() {
        let table = ManagerTable::default();
        table.apply(&config("node3", 8013)).unwrap();
        table.apply(&app(McmpCommand::EnableApp, "node3", "/test")).unwrap();

        let remove = McmpMessage::new(McmpCommand::RemoveApp)
            .with_wildcard()
            .with_param("JVMRoute", "node3");
        table.apply(&remove).unwrap();
        assert!(table.is_empty());

        // Removing an unknown node succeeds, anything else fails.
        table.apply(&remove).unwrap();
        let err = table
            .apply(&app(McmpCommand::EnableApp, "node3", "/test"))
            .unwrap_err();
        assert_eq!(err, McmpError::UnknownNode("node3".to_string()));
    }

    #[test]
    fn test_syntax_errors() {
        let table = ManagerTable::default();
        let err = table
            .apply(&McmpMessage::new(McmpCommand::Config).with_param("JVMRoute", ""))
            .unwrap_err();
        assert_eq!(err.to_string(), "SYNTAX: JVMRoute can't be empty");

        table.apply(&config("node3", 8013)).unwrap();
        let alias_only = McmpMessage::new(McmpCommand::EnableApp)
            .with_param("JVMRoute", "node3")
            .with_param("Alias", "localhost");
        assert_eq!(table.apply(&alias_only), Err(McmpError::AliasWithoutContext));

        let context_only = McmpMessage::new(McmpCommand::EnableApp)
            .with_param("JVMRoute", "node3")
            .with_param("Context", "/test");
        assert_eq!(table.apply(&context_only), Err(McmpError::ContextWithoutAlias));

        let bad_field = config("node3", 8013).with_param("Colour", "blue");
        assert_eq!(
            table.apply(&bad_field),
            Err(McmpError::InvalidField("Colour".to_string()))
        );
    }

    #[test]
    fn test_status_and_ping() {
        let table = ManagerTable::default();
        assert_eq!(
            table.apply(&McmpMessage::new(McmpCommand::Ping)).unwrap(),
            "Type=PING-RSP&State=OK\n"
        );

        table.apply(&config("node3", 8013)).unwrap();
        let status = McmpMessage::new(McmpCommand::Status)
            .with_param("JVMRoute", "node3")
            .with_param("Load", -1);
        let body = table.apply(&status).unwrap();
        assert!(body.starts_with("Type=STATUS-RSP&JVMRoute=node3&State=NOTOK"));

        let ping = McmpMessage::new(McmpCommand::Ping).with_param("JVMRoute", "node9");
        assert!(matches!(table.apply(&ping), Err(McmpError::UnknownNode(_))));
    }

    #[test]
    fn test_render_info() {
        let table = ManagerTable::default();
        table.apply(&config("node3", 8013)).unwrap();
        table.apply(&app(McmpCommand::EnableApp, "node3", "/test")).unwrap();
        table.record_election("node3");

        let info = table.render_info();
        let lines = info.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with(
            "Node: [1],Name: node3,Balancer: mycluster,LBGroup: ,Host: 127.0.0.1,Port: 8013,Type: http,"
        ));
        assert!(lines[0].ends_with(",Elected: 1,Read: 0,Transfered: 0,Connected: 0,Load: 1"));
        assert_eq!(lines[1], "Vhost: [1:1:1], Alias: localhost");
        assert_eq!(lines[2], "Context: [1:1:1], Context: /test, Status: ENABLED");
    }
}
