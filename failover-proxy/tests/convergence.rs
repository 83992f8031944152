use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use failover_node::{route_from_session_id, session_id_from_set_cookie, MyCount, Node, Server};
use failover_proxy::mcmp::{McmpCommand, McmpMessage};
use failover_proxy::{
    AdvertiseGroup,
    ClusterListener,
    ContextStatus,
    ListenerConfig,
    ProxyConfig,
    ProxyError,
    ProxyServer,
};
use hyper::header::SET_COOKIE;
use hyper::{Body, Client, Request, StatusCode};

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + CONVERGENCE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn node(name: &str) -> anyhow::Result<Node> {
    let node = Node::create(name, "127.0.0.1");
    node.add_connector(0)?;
    node.add_context("/test", "/test", Arc::new(MyCount::default()), true)?;
    Ok(node)
}

/// Sends a request through the proxy, returning the status and the node
/// which owns the session that served it.
async fn request(addr: SocketAddr, path: &str) -> anyhow::Result<(StatusCode, Option<String>)> {
    let request = Request::get(format!("http://{addr}{path}")).body(Body::empty())?;
    let response = Client::new().request(request).await?;

    let route = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_id_from_set_cookie)
        .and_then(route_from_session_id)
        .map(String::from);

    Ok((response.status(), route))
}

#[tokio::test]
async fn test_listener_converges_proxy() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let proxy_config = ProxyConfig::new(test_helper::get_unused_addr())
        .with_security_key("secret")
        .with_advertise_frequency(Duration::from_millis(50));
    let proxy = ProxyServer::listen(proxy_config).await?;
    let group = AdvertiseGroup::new(test_helper::get_unused_addr());
    proxy.advertise_on(group.clone());

    let server = Server::default();
    let node3 = node("node3")?;
    let node4 = node("node4")?;
    server.add_service(node3.clone())?;
    server.add_service(node4.clone())?;

    let config = ListenerConfig::new(group.addr())
        .with_domain("dom1")
        .with_security_key("secret")
        .with_status_interval(Duration::from_millis(100));
    let listener = ClusterListener::create(&server, config, group);

    server.start().await?;

    let expected = BTreeSet::from(["node3".to_string(), "node4".to_string()]);
    let converged = wait_until(|| {
        proxy
            .snapshot()
            .map(|s| {
                s.node_names() == expected
                    && s.context_status("node3", "/test") == Some(ContextStatus::Enabled)
                    && s.context_status("node4", "/test") == Some(ContextStatus::Enabled)
            })
            .unwrap_or(false)
    })
    .await;
    assert!(converged, "Proxy never learned about both nodes");
    assert!(listener.ping().await?.contains("Type=PING-RSP"));
    assert_eq!(listener.proxy_info().await?.node_names(), expected);
    assert_eq!(listener.proxies(), vec![proxy.addr()]);

    let (status, route) = request(proxy.addr(), "/test/MyCount").await?;
    assert_eq!(status, StatusCode::OK);
    let served = route.expect("The first request creates a session");
    assert!(expected.contains(&served));

    let (serving, survivor) = if served == "node3" {
        (&node3, "node4")
    } else {
        (&node4, "node3")
    };
    serving.remove_context("/test")?;

    // Whether or not the proxy has caught up, the request lands on the survivor.
    let (status, route) = request(proxy.addr(), "/test/MyCount").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(route.as_deref(), Some(survivor));

    let removed = wait_until(|| {
        proxy
            .snapshot()
            .map(|s| !s.has_context(serving.name(), "/test"))
            .unwrap_or(false)
    })
    .await;
    assert!(removed, "Proxy still reports the removed context");

    server.stop().await;
    let emptied = wait_until(|| proxy.table().is_empty()).await;
    assert!(emptied, "Proxy still reports stopped nodes");

    listener.stop().await;
    listener.stop().await;
    assert!(!listener.is_running());
    proxy.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn test_static_proxy_is_synchronised() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let proxy = ProxyServer::listen(ProxyConfig::new(test_helper::get_unused_addr())).await?;

    // Nodes already running before the listener exists are picked up by the
    // initial synchronisation.
    let server = Server::default();
    let node3 = node("node3")?;
    server.add_service(node3.clone())?;
    server.start().await?;

    let config = ListenerConfig::default()
        .with_advertise(false)
        .with_proxy(proxy.addr())
        .with_status_interval(Duration::from_millis(100));
    let listener = ClusterListener::create(&server, config, AdvertiseGroup::default());

    let synced = wait_until(|| proxy.table().node("node3").is_some()).await;
    assert!(synced, "Static proxy was never synchronised");

    let balancer = proxy
        .table()
        .balancer(failover_proxy::DEFAULT_BALANCER)
        .expect("Balancer is configured");
    assert!(balancer.sticky_session);
    assert!(!balancer.sticky_session_force);
    assert_eq!(balancer.max_attempts, 3);

    // The proxy forgets everything, the listener notices and rebuilds it.
    let remove = McmpMessage::new(McmpCommand::RemoveApp)
        .with_wildcard()
        .with_param("JVMRoute", "node3");
    proxy.table().apply(&remove)?;
    let rebuilt = wait_until(|| proxy.table().node("node3").is_some()).await;
    assert!(rebuilt, "Listener never resynchronised the proxy");
    assert!(listener.statistics().num_full_syncs() >= 2);

    server.stop().await;
    listener.stop().await;
    proxy.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn test_unsigned_proxy_is_ignored() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let proxy_config = ProxyConfig::new(test_helper::get_unused_addr())
        .with_advertise_frequency(Duration::from_millis(20));
    let proxy = ProxyServer::listen(proxy_config).await?;
    let group = AdvertiseGroup::new(test_helper::get_unused_addr());
    proxy.advertise_on(group.clone());

    let server = Server::default();
    let config = ListenerConfig::new(group.addr()).with_security_key("secret");
    let listener = ClusterListener::create(&server, config, group);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(listener.proxies().is_empty());
    assert!(matches!(listener.ping().await, Err(ProxyError::NoProxy)));

    listener.stop().await;
    proxy.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn test_removed_service_leaves_proxy() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let proxy = ProxyServer::listen(ProxyConfig::new(test_helper::get_unused_addr())).await?;

    let server = Server::default();
    let node3 = node("node3")?;
    let node4 = node("node4")?;
    server.add_service(node3.clone())?;
    server.add_service(node4.clone())?;
    server.start().await?;

    let config = ListenerConfig::default()
        .with_advertise(false)
        .with_proxy(proxy.addr())
        .with_status_interval(Duration::from_millis(100));
    let listener = ClusterListener::create(&server, config, AdvertiseGroup::default());

    let expected = BTreeSet::from(["node3".to_string(), "node4".to_string()]);
    let synced = wait_until(|| {
        proxy
            .snapshot()
            .map(|s| s.node_names() == expected)
            .unwrap_or(false)
    })
    .await;
    assert!(synced, "Proxy never learned about both nodes");

    // The node keeps serving after it is taken off the server.
    server.remove_service("node3");
    let removed = wait_until(|| proxy.table().node("node3").is_none()).await;
    assert!(removed, "Proxy still reports the removed node");
    assert!(proxy.table().node("node4").is_some());

    node3.stop().await?;
    server.stop().await;
    let emptied = wait_until(|| proxy.table().is_empty()).await;
    assert!(emptied, "Proxy still reports stopped nodes");

    listener.stop().await;
    proxy.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn test_resync_drops_unknown_nodes() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let proxy = ProxyServer::listen(ProxyConfig::new(test_helper::get_unused_addr())).await?;

    let server = Server::default();
    server.add_service(node("node3")?)?;
    server.start().await?;

    let config = ListenerConfig::default()
        .with_advertise(false)
        .with_proxy(proxy.addr())
        .with_status_interval(Duration::from_millis(100));
    let listener = ClusterListener::create(&server, config, AdvertiseGroup::default());

    let synced = wait_until(|| proxy.table().node("node3").is_some()).await;
    assert!(synced, "Static proxy was never synchronised");

    // A node in the listener's balancer which the server never held, plus
    // one in another balancer which must be left alone.
    let ghost = McmpMessage::new(McmpCommand::Config)
        .with_param("JVMRoute", "ghost")
        .with_param("Host", "127.0.0.1")
        .with_param("Port", test_helper::get_unused_addr().port())
        .with_param("Type", "http");
    proxy.table().apply(&ghost)?;
    let foreign = McmpMessage::new(McmpCommand::Config)
        .with_param("JVMRoute", "foreign")
        .with_param("Balancer", "otherbalancer")
        .with_param("Host", "127.0.0.1")
        .with_param("Port", test_helper::get_unused_addr().port())
        .with_param("Type", "http");
    proxy.table().apply(&foreign)?;

    // Forgetting node3 makes the listener resynchronise the whole proxy.
    let remove = McmpMessage::new(McmpCommand::RemoveApp)
        .with_wildcard()
        .with_param("JVMRoute", "node3");
    proxy.table().apply(&remove)?;

    let cleaned = wait_until(|| {
        proxy.table().node("ghost").is_none() && proxy.table().node("node3").is_some()
    })
    .await;
    assert!(cleaned, "Resynchronisation kept the unknown node");
    assert!(proxy.table().node("foreign").is_some());

    server.stop().await;
    listener.stop().await;
    proxy.shutdown().await;

    Ok(())
}
