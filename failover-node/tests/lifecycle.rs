use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use failover_node::{
    route_from_session_id,
    session_id_from_set_cookie,
    LifecycleError,
    LifecycleExit,
    MyCount,
    Node,
    NodeState,
    Server,
    ServerLifecycle,
    SESSION_COOKIE,
};
use hyper::header::{COOKIE, SET_COOKIE};
use hyper::{Body, Client, Request, StatusCode};

async fn get(
    addr: SocketAddr,
    path: &str,
    session: Option<&str>,
) -> anyhow::Result<(StatusCode, Option<String>, String)> {
    let mut request = Request::get(format!("http://{addr}{path}"));
    if let Some(id) = session {
        request = request.header(COOKIE, format!("{SESSION_COOKIE}={id}"));
    }

    let resp = Client::new().request(request.body(Body::empty())?).await?;
    let status = resp.status();
    let cookie = resp
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_id_from_set_cookie)
        .map(String::from);
    let body = hyper::body::to_bytes(resp.into_body()).await?;

    Ok((status, cookie, String::from_utf8(body.to_vec())?))
}

#[tokio::test]
async fn test_node_serves_contexts() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let app = Arc::new(MyCount::default());
    let node = Node::create("node3", "127.0.0.1");
    let addr = node.add_connector(test_helper::get_unused_port())?;
    node.add_context("/test", "/test", app.clone(), true)?;
    node.start().await?;

    let (status, cookie, body) = get(addr, "/test/MyCount", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("MyCount: count=1"), "Unexpected body: {body}");
    let session = cookie.expect("A session should be created");
    assert_eq!(route_from_session_id(&session), Some("node3"));

    let (status, cookie, body) = get(addr, "/test/MyCount", Some(&session)).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(cookie.is_none(), "Known sessions should be reused");
    assert!(body.starts_with("MyCount: count=2"), "Unexpected body: {body}");
    assert_eq!(node.num_active_sessions(), 1);

    let (status, _, _) = get(addr, "/other", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    node.remove_context("/test")?;
    let (status, _, _) = get(addr, "/test/MyCount", Some(&session)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let stats = node.statistics();
    assert_eq!(stats.num_requests_served(), 2);
    assert_eq!(stats.num_not_found(), 2);
    assert_eq!(stats.num_sessions_created(), 1);
    assert_eq!(app.total(), 2);

    node.stop().await?;
    assert_eq!(node.num_active_sessions(), 0);
    std::net::TcpListener::bind(addr).expect("Port should be released after stop");

    Ok(())
}

#[tokio::test]
async fn test_lifecycle_stop_early() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let server = Server::default();
    let node = Node::create("node4", "127.0.0.1");
    let addr = node.add_connector(0)?;
    node.add_context("/test", "/test", Arc::new(MyCount::default()), true)?;
    server.add_service(node.clone())?;

    let mut lifecycle =
        ServerLifecycle::new(server).with_grace_period(Duration::from_secs(5));
    lifecycle.start(Duration::from_secs(60))?;
    assert!(lifecycle.is_running());
    assert!(matches!(
        lifecycle.start(Duration::from_secs(60)),
        Err(LifecycleError::AlreadyRunning)
    ));

    // The unit starts the nodes in the background.
    for _ in 0..50 {
        if node.state() == NodeState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(node.state(), NodeState::Running);

    let (status, _, _) = get(addr, "/test/MyCount", None).await?;
    assert_eq!(status, StatusCode::OK);

    let exit = lifecycle.stop_early().await?;
    assert_eq!(exit, LifecycleExit::Stopped);
    assert_eq!(node.state(), NodeState::Stopped);
    assert!(matches!(
        lifecycle.stop_early().await,
        Err(LifecycleError::NotRunning)
    ));

    // The lifecycle can be started again once the previous unit exited.
    lifecycle.start(Duration::from_secs(60))?;
    assert!(matches!(lifecycle.stop_early().await, Ok(LifecycleExit::Stopped)));

    Ok(())
}
