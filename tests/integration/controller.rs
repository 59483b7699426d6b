//! Tunnel session controller integration tests
//!
//! Drives `TunnelController` against real loopback sockets with a mock
//! secure channel, checking the published state sequence for each outcome.
//!
//! # Test Categories
//!
//! 1. **Failure Tests**: refused, unresolvable, rejected credentials
//! 2. **Lifecycle Tests**: connect, stop, idempotent start/stop
//! 3. **Reconnect Tests**: backoff after a lost session

use std::sync::Arc;
use std::time::Duration;

use disguise_tunnel::channel::SecureChannel;
use disguise_tunnel::controller::{ControllerSettings, StateContext, TunnelController};
use disguise_tunnel::protect::default_protector;
use disguise_tunnel::{
    BroadcastSink, ConnectionState, ConnectionType, TunnelConfig, TunnelEvent, TunnelTunables,
};
use tokio::sync::broadcast;

use super::support::{
    collect_states, spawn_banner_server, unused_port, wait_until, ChannelBehavior, MockFactory,
};

const WAIT: Duration = Duration::from_secs(5);

fn settings() -> ControllerSettings {
    ControllerSettings {
        forwarding_port: 0,
        connect_timeout: Duration::from_secs(2),
        backoff_initial: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
    }
}

fn controller(
    behavior: ChannelBehavior,
) -> (
    TunnelController,
    Arc<MockFactory>,
    broadcast::Receiver<TunnelEvent>,
) {
    let factory = MockFactory::new(behavior);
    let context = Arc::new(StateContext::new());
    let sink = Arc::new(BroadcastSink::new(256));
    let events = sink.subscribe();
    context.add_sink(sink);

    let controller = TunnelController::new(
        factory.clone(),
        default_protector(),
        context,
        settings(),
    );
    (controller, factory, events)
}

fn profile(port: u16) -> TunnelConfig {
    TunnelConfig::new("local", "Local", "127.0.0.1", port).with_credentials("alice", "secret")
}

fn names(states: &[(ConnectionState, Option<String>)]) -> Vec<ConnectionState> {
    states.iter().map(|(state, _)| *state).collect()
}

// ============================================================================
// Failure Tests
// ============================================================================

#[tokio::test]
async fn test_unreachable_direct_ends_idle_with_refused_reason() {
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);
    let port = unused_port().await;

    assert!(controller.start(profile(port), TunnelTunables::default()));
    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;

    assert_eq!(
        names(&states),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Idle
        ]
    );
    let reason = states[1].1.clone().unwrap();
    assert!(reason.starts_with("connection-refused"), "reason: {reason}");

    // Worker finished on its own
    assert!(wait_until(|| !controller.is_running(), WAIT).await);
    assert_eq!(factory.created(), 1);
    assert_eq!(controller.context().forwarding_port(), None);
}

#[tokio::test]
async fn test_invalid_profile_fails_without_dialing() {
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);
    let (addr, _accepted) = spawn_banner_server().await.unwrap();
    // socks5 without a proxy host would greet the SSH server itself
    let config = profile(addr.port()).with_connection_type(ConnectionType::Socks5);

    assert!(controller.start(config, TunnelTunables::default()));
    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;

    assert_eq!(
        names(&states),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Idle
        ]
    );
    let reason = states[1].1.clone().unwrap();
    assert!(reason.starts_with("generic"), "reason: {reason}");
    assert!(reason.contains("proxy_host"), "reason: {reason}");
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_invalid_tunables_fail_without_dialing() {
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);
    let tunables = TunnelTunables {
        mtu: 10,
        ..TunnelTunables::default()
    };

    assert!(controller.start(profile(unused_port().await), tunables));
    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;

    let reason = states[1].1.clone().unwrap();
    assert!(reason.contains("mtu"), "reason: {reason}");
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_stop_after_worker_ended_reports_nothing_stopped() {
    let (controller, _factory, mut events) = controller(ChannelBehavior::Accept);
    let port = unused_port().await;

    assert!(controller.start(profile(port), TunnelTunables::default()));
    collect_states(&mut events, ConnectionState::Idle, WAIT).await;
    assert!(wait_until(|| !controller.is_running(), WAIT).await);

    assert!(!controller.stop("user requested").await);
    assert!(!controller.stop("user requested").await);
}

#[tokio::test]
#[ignore = "requires a working system resolver"]
async fn test_unresolvable_host_reports_host_not_found() {
    let (controller, _factory, mut events) = controller(ChannelBehavior::Accept);
    let config = TunnelConfig::new("bad", "Bad", "no-such-host.invalid", 22);

    assert!(controller.start(config, TunnelTunables::default()));
    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;

    assert_eq!(states.len(), 3);
    let reason = states[1].1.clone().unwrap();
    assert!(reason.starts_with("host-not-found"), "reason: {reason}");
}

#[tokio::test]
async fn test_rejected_credentials_report_authentication_failure() {
    let (addr, _accepted) = spawn_banner_server().await.unwrap();
    let (controller, _factory, mut events) = controller(ChannelBehavior::RejectAuth);

    assert!(controller.start(profile(addr.port()), TunnelTunables::default()));

    let mut log_seen = false;
    let mut reason = None;
    let deadline = tokio::time::Instant::now() + WAIT;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        match event {
            TunnelEvent::Log { .. } => log_seen = true,
            TunnelEvent::State {
                state: ConnectionState::Disconnected,
                reason: r,
            } => reason = r,
            TunnelEvent::State {
                state: ConnectionState::Idle,
                ..
            } => break,
            _ => {}
        }
    }

    assert!(log_seen);
    let reason = reason.unwrap();
    assert!(reason.starts_with("authentication-failure"), "reason: {reason}");
}

#[tokio::test]
async fn test_failure_before_first_connect_is_not_retried() {
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);
    let port = unused_port().await;
    let tunables = TunnelTunables {
        use_auto_reconnect: true,
        ..TunnelTunables::default()
    };

    assert!(controller.start(profile(port), tunables));
    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;

    assert!(!names(&states).contains(&ConnectionState::Reconnecting));
    assert_eq!(factory.created(), 1);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_connect_publishes_port_then_stop_clears_it() {
    let (addr, accepted) = spawn_banner_server().await.unwrap();
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);

    assert!(controller.start(profile(addr.port()), TunnelTunables::default()));
    let states = collect_states(&mut events, ConnectionState::Connected, WAIT).await;
    assert_eq!(
        names(&states),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    let port = controller.context().forwarding_port().unwrap();
    assert_ne!(port, 0);
    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);

    assert!(controller.stop("user requested").await);
    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;
    assert_eq!(
        states,
        vec![
            (ConnectionState::Disconnected, Some("user requested".to_string())),
            (ConnectionState::Idle, None),
        ]
    );

    assert_eq!(controller.context().forwarding_port(), None);
    assert!(!controller.is_running());
    assert!(!factory.last().unwrap().is_connected());
}

#[tokio::test]
async fn test_second_start_is_ignored() {
    let (addr, _accepted) = spawn_banner_server().await.unwrap();
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);

    assert!(controller.start(profile(addr.port()), TunnelTunables::default()));
    assert!(!controller.start(profile(addr.port()), TunnelTunables::default()));

    collect_states(&mut events, ConnectionState::Connected, WAIT).await;
    assert_eq!(factory.created(), 1);

    controller.stop("done").await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (addr, _accepted) = spawn_banner_server().await.unwrap();
    let (controller, _factory, mut events) = controller(ChannelBehavior::Accept);

    assert!(!controller.stop("nothing running").await);

    controller.start(profile(addr.port()), TunnelTunables::default());
    collect_states(&mut events, ConnectionState::Connected, WAIT).await;

    let (first, second) = tokio::join!(controller.stop("first"), controller.stop("second"));
    assert!(first ^ second);
    assert!(!controller.stop("third").await);

    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;
    assert_eq!(names(&states), vec![ConnectionState::Disconnected, ConnectionState::Idle]);
    assert_eq!(controller.context().state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_stop_during_connect_uses_reason() {
    // Accepts but never sends a banner, so the channel connect hangs
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let (controller, _factory, mut events) = controller(ChannelBehavior::Accept);
    controller.start(profile(port), TunnelTunables::default());
    collect_states(&mut events, ConnectionState::Connecting, WAIT).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.stop("cancelled by user").await);

    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;
    assert_eq!(
        states[0],
        (
            ConnectionState::Disconnected,
            Some("cancelled by user".to_string())
        )
    );
}

#[tokio::test]
async fn test_restart_after_stop() {
    let (addr, accepted) = spawn_banner_server().await.unwrap();
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);

    for round in 1..=2u32 {
        assert!(controller.start(profile(addr.port()), TunnelTunables::default()));
        collect_states(&mut events, ConnectionState::Connected, WAIT).await;
        assert!(controller.stop("round done").await);
        collect_states(&mut events, ConnectionState::Idle, WAIT).await;
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), round);
    }
    assert_eq!(factory.created(), 2);
}

// ============================================================================
// Reconnect Tests
// ============================================================================

#[tokio::test]
async fn test_lost_session_reconnects_with_backoff() {
    let (addr, accepted) = spawn_banner_server().await.unwrap();
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);
    let tunables = TunnelTunables {
        use_auto_reconnect: true,
        ..TunnelTunables::default()
    };

    controller.start(profile(addr.port()), tunables);
    collect_states(&mut events, ConnectionState::Connected, WAIT).await;

    factory.last().unwrap().drop_session("server closed");
    let states = collect_states(&mut events, ConnectionState::Connected, WAIT).await;

    assert_eq!(
        names(&states),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
    assert_eq!(
        states[0].1.as_deref(),
        Some("session-terminated: server closed")
    );
    assert_eq!(factory.created(), 2);
    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(controller.context().forwarding_port().is_some());

    controller.stop("done").await;
    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;
    assert_eq!(names(&states), vec![ConnectionState::Disconnected, ConnectionState::Idle]);
}

#[tokio::test]
async fn test_lost_session_without_auto_reconnect_goes_idle() {
    let (addr, _accepted) = spawn_banner_server().await.unwrap();
    let (controller, factory, mut events) = controller(ChannelBehavior::Accept);

    controller.start(profile(addr.port()), TunnelTunables::default());
    collect_states(&mut events, ConnectionState::Connected, WAIT).await;

    factory.last().unwrap().drop_session("server closed");
    let states = collect_states(&mut events, ConnectionState::Idle, WAIT).await;

    assert_eq!(names(&states), vec![ConnectionState::Disconnected, ConnectionState::Idle]);
    assert!(wait_until(|| !controller.is_running(), WAIT).await);
    assert_eq!(factory.created(), 1);
}
