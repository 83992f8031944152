#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use failover::harness::{NodeSpec, PollPolicy, Scenario, ScenarioConfig};
use failover::proxy::{
    AdvertiseGroup,
    ListenerConfig,
    ProxyConfig,
    ProxyServer,
    DEFAULT_ADVERTISE_GROUP,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = Args::parse();

    let nodes = node_specs(&args.nodes, args.base_port)?;

    let group = AdvertiseGroup::new(args.advertise_group);
    let proxy_config = ProxyConfig::new(args.proxy_listen_addr)
        .with_security_key(args.security_key.clone())
        .with_advertise_frequency(Duration::from_millis(args.advertise_frequency_ms));
    let proxy = ProxyServer::listen(proxy_config).await?;
    proxy.advertise_on(group.clone());

    let listener = ListenerConfig::new(group.addr())
        .with_domain(args.domain.clone())
        .with_security_key(args.security_key.clone())
        .with_sticky_session(true)
        .with_sticky_session_remove(false)
        .with_sticky_session_force(false);

    let config = ScenarioConfig::new(nodes, listener)
        .with_poll_policy(PollPolicy::new(Duration::from_millis(args.poll_interval_ms)))
        .with_window(Duration::from_secs(args.window_secs));

    let result = Scenario::new(config, proxy.addr(), group).run().await;
    proxy.shutdown().await;

    let report = result?;
    info!(
        withdrawn = ?report.withdrawn_node,
        survivor = ?report.final_node,
        window = ?report.window.as_ref().map(|w| w.to_string()),
        "Failover verified."
    );

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:6666")]
    /// The address the proxy listens on.
    proxy_listen_addr: SocketAddr,

    #[arg(long, default_value_t = DEFAULT_ADVERTISE_GROUP)]
    advertise_group: SocketAddr,

    #[arg(long, default_value_t = 1000)]
    advertise_frequency_ms: u64,

    #[arg(long, default_value = "secret")]
    /// The key advertisements are signed with.
    security_key: String,

    #[arg(long, default_value = "dom1")]
    domain: String,

    #[arg(long = "node", default_values = ["node3", "node4"])]
    /// The nodes to start, each serving `/test` on consecutive ports.
    nodes: Vec<String>,

    #[arg(long, default_value_t = 8013)]
    base_port: u16,

    #[arg(long, default_value_t = 30)]
    /// How long to keep requesting after the context is withdrawn.
    window_secs: u64,

    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
}

/// Assigns consecutive ports starting at `base_port` to the named nodes.
fn node_specs(names: &[String], base_port: u16) -> Result<Vec<NodeSpec>> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            u16::try_from(i)
                .ok()
                .and_then(|offset| base_port.checked_add(offset))
                .map(|port| NodeSpec::new(name.clone(), port))
                .ok_or_else(|| anyhow!("Node {name:?} would need a port beyond {}", u16::MAX))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ports() -> Result<()> {
        let names = vec!["node3".to_string(), "node4".to_string()];

        let specs = node_specs(&names, 8013)?;
        assert_eq!(specs.iter().map(|s| s.port).collect::<Vec<_>>(), vec![8013, 8014]);

        let specs = node_specs(&names, u16::MAX - 1)?;
        assert_eq!(specs[1].port, u16::MAX);

        let err = node_specs(&names, u16::MAX).expect_err("The second node has no port left");
        assert!(err.to_string().contains("node4"));

        Ok(())
    }
}
