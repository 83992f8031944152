use std::sync::Arc;
use std::time::Duration;

use failover_harness::{ClusterMonitor, ConvergenceOracle, MonitorError, PollPolicy};
use failover_node::{MyCount, Node, Server};
use failover_proxy::{AdvertiseGroup, ClusterListener, ListenerConfig, ProxyConfig, ProxyServer};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_monitor_tracks_registration() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let proxy = ProxyServer::listen(ProxyConfig::new(test_helper::get_unused_addr())).await?;

    let server = Server::default();
    let node = Node::create("node3", "127.0.0.1");
    node.add_connector(0)?;
    node.add_context("/test", "/test", Arc::new(MyCount::default()), true)?;
    server.add_service(node.clone())?;

    let config = ListenerConfig::default()
        .with_advertise(false)
        .with_proxy(proxy.addr())
        .with_status_interval(Duration::from_millis(100));
    let listener = ClusterListener::create(&server, config, AdvertiseGroup::default());
    let monitor = ClusterMonitor::new(listener, PollPolicy::new(Duration::from_millis(50)));

    let attempts = monitor.wait_for_initial_advertisement(TIMEOUT).await?;
    assert!(attempts >= 1);
    assert!(ConvergenceOracle::ping(monitor.oracle()).await?);

    server.start().await?;
    assert!(monitor.wait_for_exact_node_set(["node3"], TIMEOUT).await);

    // A context added then removed disappears from the proxy again.
    node.add_context("/other", "/other", Arc::new(MyCount::default()), true)?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !monitor.oracle().snapshot().await?.has_context("node3", "/other") {
        assert!(tokio::time::Instant::now() < deadline, "Context was never registered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    node.remove_context("/other")?;
    assert!(monitor.wait_for_context_absent("node3", "/other", TIMEOUT).await);
    assert!(proxy.snapshot()?.has_context("node3", "/test"));

    // Later status rounds and resynchronisations do not bring it back.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = monitor.oracle().snapshot().await?;
        assert!(!snapshot.has_context("node3", "/other"));
        assert!(snapshot.has_context("node3", "/test"));
    }
    assert!(monitor.wait_for_context_absent("node3", "/other", Duration::ZERO).await);

    server.stop().await;
    assert!(monitor.wait_for_no_nodes(TIMEOUT).await);
    assert!(monitor.wait_for_no_nodes(TIMEOUT).await);

    monitor.stop().await;
    monitor.stop().await;
    assert!(!monitor.oracle().is_running());
    assert!(matches!(
        monitor.wait_for_initial_advertisement(TIMEOUT).await,
        Err(MonitorError::Stopped)
    ));

    proxy.shutdown().await;
    Ok(())
}
