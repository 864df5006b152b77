// ABOUTME: Integration tests for the server connection cache.
// ABOUTME: Exercises direct and bastion routes against the shared SSH container.

mod support;

use jumpwire::cache::{Error, ServerConnectionCache, bastion_tunnel_id};
use jumpwire::config::{Endpoint, PortRange, ServerConfig};
use jumpwire::tunnel::{Tunnel, TunnelConfig, TunnelRegistry, TunnelState};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::loopback::{LoopbackTransport, echo_server, stalling_server};
use support::ssh_container::shared_container;

fn cache(start: u16, end: u16) -> ServerConnectionCache {
    ServerConnectionCache::new(Arc::new(TunnelRegistry::new()), PortRange { start, end })
}

/// Test: A direct server is connected once and then served from the cache.
#[tokio::test]
async fn direct_session_is_cached() {
    support::init_tracing();
    let container = shared_container().await;
    let cache = cache(41000, 41010);
    let server = ServerConfig::new("direct", container.endpoint());

    let first = cache.get_session(&server).await.expect("connect should succeed");
    let second = cache.get_session(&server).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second), "same session is reused");
    assert!(cache.contains("direct"));
    assert!(cache.registry().is_empty().await, "direct route needs no tunnel");
    assert_eq!(cache.ports().available(), 10);

    let output = first.exec("echo cached").await.unwrap();
    assert_eq!(output.stdout.trim(), "cached");

    cache.close_connection("direct").await.unwrap();
    assert!(!cache.contains("direct"));
    assert!(!first.is_connected());
}

/// Test: Concurrent first requests share a single connection.
#[tokio::test]
async fn concurrent_requests_share_one_session() {
    let container = shared_container().await;
    let cache = Arc::new(cache(41020, 41030));
    let server = ServerConfig::new("shared", container.endpoint());

    let requests = (0..5).map(|_| {
        let cache = Arc::clone(&cache);
        let server = server.clone();
        tokio::spawn(async move { cache.get_session(&server).await })
    });
    let sessions: Vec<_> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("connect should succeed"))
        .collect();

    for session in &sessions[1..] {
        assert!(Arc::ptr_eq(&sessions[0], session));
    }

    cache.close_all().await.unwrap();
}

/// Test: A server behind a bastion is reached through an on-demand tunnel.
#[tokio::test]
async fn bastion_route_tunnels_the_session() {
    let container = shared_container().await;
    let cache = cache(41040, 41050);
    let server = ServerConfig::new("inner", container.internal_endpoint()).via(container.endpoint());

    let session = cache
        .get_session(&server)
        .await
        .expect("connect through bastion should succeed");

    let output = session.exec("echo hi").await.unwrap();
    assert_eq!(output.stdout, "hi\n");

    let tunnel_id = bastion_tunnel_id("inner");
    let tunnel = cache.registry().get(tunnel_id.as_str()).await.unwrap();
    assert_eq!(tunnel.state(), TunnelState::Active);
    let port = tunnel.local_addr().unwrap().port();
    assert!((41040..41050).contains(&port));
    assert_eq!(session.config().port, port);
    assert_eq!(cache.ports().available(), 9);

    // Served from the cache, no second tunnel
    let again = cache.get_session(&server).await.unwrap();
    assert!(Arc::ptr_eq(&session, &again));
    assert_eq!(cache.registry().len().await, 1);

    cache.close_connection("inner").await.unwrap();
    assert!(!cache.registry().contains(tunnel_id.as_str()).await);
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(cache.ports().available(), 10, "port returns to the pool");
}

/// Test: A failed connection is not cached and leaves no tunnel behind.
#[tokio::test]
async fn failed_connection_leaves_nothing_behind() {
    let container = shared_container().await;
    let cache = cache(41060, 41070);

    let mut inner = container.internal_endpoint();
    inner.password = Some("wrong-password".to_string());
    let server = ServerConfig::new("locked", inner).via(container.endpoint());

    let err = cache.get_session(&server).await.unwrap_err();
    assert!(matches!(err, Error::Ssh(ref e) if e.is_authentication()), "got {err:?}");

    assert!(!cache.contains("locked"));
    assert!(cache.registry().is_empty().await);
    assert_eq!(cache.ports().available(), 10);
}

/// Test: An exhausted port pool is reported instead of colliding.
#[tokio::test]
async fn empty_port_pool_is_exhausted() {
    let cache = cache(41080, 41080);
    let server = ServerConfig::new("nowhere", Endpoint::parse("app@10.0.0.5").unwrap())
        .via(Endpoint::parse("jump@127.0.0.1:1").unwrap());

    let err = cache.get_session(&server).await.unwrap_err();
    assert!(matches!(err, Error::PortsExhausted { .. }), "got {err:?}");
}

/// Test: Closing an unknown server is a no-op.
#[tokio::test]
async fn close_unknown_server_is_noop() {
    let cache = cache(41090, 41095);
    cache.close_connection("ghost").await.unwrap();
    cache.close_all().await.unwrap();
}

/// Test: A direct server that refuses connections surfaces the SSH error.
#[tokio::test]
async fn unreachable_direct_server_is_not_cached() {
    let cache = cache(41100, 41105);
    let mut endpoint = Endpoint::parse("nobody@127.0.0.1:1").unwrap();
    endpoint.password = Some("irrelevant".to_string());
    endpoint.timeout = Duration::from_secs(2);
    let server = ServerConfig::new("down", endpoint);

    let err = cache.get_session(&server).await.unwrap_err();
    assert!(matches!(err, Error::Ssh(_)), "got {err:?}");
    assert!(!cache.contains("down"));
}

/// Test: Replacing a bastion tunnel that is no longer active returns its
/// port to the pool.
#[tokio::test]
async fn stale_bastion_tunnel_port_is_released() {
    let (remote, _server) = echo_server().await;
    let cache = cache(41140, 41142);
    let tunnel_id = bastion_tunnel_id("stale");

    // A bastion tunnel left registered after it stopped
    let port = cache.ports().claim().unwrap();
    let stale = cache
        .registry()
        .start_tunnel(Tunnel::new(
            tunnel_id.clone(),
            LoopbackTransport::new(),
            TunnelConfig::new(format!("127.0.0.1:{port}"), remote.to_string()),
        ))
        .await
        .expect("stale tunnel should start");
    stale.stop().await.unwrap();
    assert_eq!(cache.ports().available(), 1);

    let server = ServerConfig::new("stale", Endpoint::parse("app@10.0.0.5").unwrap())
        .via(Endpoint::parse("jump@127.0.0.1:1").unwrap());
    let err = cache.get_session(&server).await.unwrap_err();
    assert!(matches!(err, Error::Tunnel(_)), "got {err:?}");

    assert!(!cache.registry().contains(tunnel_id.as_str()).await);
    assert_eq!(cache.ports().available(), 2, "stale port returns to the pool");
}

async fn wait_for_accepted(accepted: &std::sync::atomic::AtomicUsize, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while accepted.load(Ordering::SeqCst) < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server should accept the connection");
}

/// Test: After a failed attempt, later callers join the retry in flight
/// instead of dialing again.
#[tokio::test]
async fn retry_after_failure_stays_single_flight() {
    let (addr, accepted, _server) = stalling_server().await;
    let cache = Arc::new(cache(41110, 41115));
    let mut endpoint = Endpoint::parse(&format!("nobody@{addr}")).unwrap();
    endpoint.password = Some("irrelevant".to_string());
    endpoint.timeout = Duration::from_secs(3);
    let server = ServerConfig::new("flaky", endpoint);

    let request = |cache: &Arc<ServerConnectionCache>| {
        let cache = Arc::clone(cache);
        let server = server.clone();
        tokio::spawn(async move { cache.get_session(&server).await })
    };

    // One caller's attempt is dropped, the other retries on a held connection
    let first = request(&cache);
    let second = request(&cache);
    wait_for_accepted(&accepted, 2).await;

    let third = request(&cache);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        accepted.load(Ordering::SeqCst),
        2,
        "a caller arriving during the retry must not dial"
    );

    let outcomes = [first, second]
        .into_iter()
        .map(|task| async move { task.await.expect("task panicked") });
    for outcome in futures::future::join_all(outcomes).await {
        assert!(outcome.is_err());
    }
    third.abort();
    assert!(!cache.contains("flaky"));
}

/// Test: Closing a server while its bastion connection is being set up
/// leaves no session, tunnel or port behind.
#[tokio::test]
async fn close_during_connect_leaves_nothing_behind() {
    let container = shared_container().await;
    let cache = Arc::new(cache(41120, 41130));
    let server = ServerConfig::new("racing", container.internal_endpoint()).via(container.endpoint());
    let tunnel_id = bastion_tunnel_id("racing");

    let pending = {
        let cache = Arc::clone(&cache);
        let server = server.clone();
        tokio::spawn(async move { cache.get_session(&server).await })
    };

    // The bastion tunnel appears before the inner session is ready
    tokio::time::timeout(Duration::from_secs(30), async {
        while !cache.registry().contains(tunnel_id.as_str()).await && !pending.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tunnel should start");

    cache.close_connection("racing").await.unwrap();
    let outcome = pending.await.expect("task panicked");
    if let Ok(session) = &outcome {
        // The connect won the race; close_connection tore it down
        assert!(!session.is_connected());
    }

    assert!(!cache.contains("racing"));
    assert!(cache.registry().is_empty().await);
    assert_eq!(cache.ports().available(), 10);
}
