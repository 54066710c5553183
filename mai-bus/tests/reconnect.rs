// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Reconnect and keepalive behaviour of agent connections.

mod common;

use std::time::Duration;

use common::*;
use mai_bus::{Agent, ConnectionState, ReconnectConfig, Service, ServiceConfig};
use tokio::net::TcpListener;

fn agent_for(config: mai_bus::ConnectionConfig) -> Agent {
    Agent::builder(config)
        .options(agent_options())
        .build()
        .expect("agent builds")
}

/// The old listener is released asynchronously, so binding may need a retry.
async fn restart_on(port: u16) -> Service {
    for _ in 0..50 {
        let config = ServiceConfig {
            port,
            ..service_config()
        };
        if let Ok(service) = Service::builder(config).start().await {
            return service;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("port {} never became free", port);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    init_tracing();
    let service = Service::builder(service_config()).start().await.unwrap();
    let agent = agent_for(connection_config(service.local_addr(), "k1", "qq"));
    assert!(agent.connect().await);
    assert_eq!(agent.state(), ConnectionState::Connected);

    service.stop().await;

    assert!(eventually(WAIT, || async { agent.stats().reconnect_attempts == 3 }).await);
    assert!(
        eventually(WAIT, || async {
            agent.state() == ConnectionState::Disconnected
        })
        .await
    );
    // Longer than the largest backoff: no fourth attempt.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(agent.stats().reconnect_attempts, 3);
    assert_eq!(agent.state(), ConnectionState::Disconnected);

    agent.stop().await;
}

#[tokio::test]
async fn test_failed_initial_connect_does_not_retry() {
    init_tracing();
    let service = Service::builder(service_config()).start().await.unwrap();
    let addr = service.local_addr();
    service.stop().await;

    let agent = agent_for(connection_config(addr, "k1", "qq"));
    assert!(!agent.connect().await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.stats().reconnect_attempts, 0);
    assert_eq!(agent.state(), ConnectionState::Disconnected);
    agent.stop().await;
}

#[tokio::test]
async fn test_reconnects_when_service_returns() {
    init_tracing();
    let service = Service::builder(service_config()).start().await.unwrap();
    let addr = service.local_addr();
    let mut config = connection_config(addr, "k1", "qq");
    config.reconnect = ReconnectConfig {
        max_attempts: 50,
        delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(100),
    };
    let agent = agent_for(config);
    assert!(agent.connect().await);

    service.stop().await;
    assert!(eventually(WAIT, || async { agent.stats().reconnect_attempts >= 1 }).await);

    let restarted = restart_on(addr.port()).await;

    assert!(
        eventually(WAIT, || async {
            agent.state() == ConnectionState::Connected
        })
        .await
    );
    assert_eq!(agent.reconnect_attempts(), 0);
    assert!(eventually(WAIT, || async { restarted.connection_count().await == 1 }).await);
    assert_eq!(agent.stats().connections_total, 2);

    agent.stop().await;
    restarted.stop().await;
}

#[tokio::test]
async fn test_explicit_disconnect_stays_down() {
    init_tracing();
    let service = Service::builder(service_config()).start().await.unwrap();
    let agent = agent_for(connection_config(service.local_addr(), "k1", "qq"));
    assert!(agent.connect().await);
    assert!(eventually(WAIT, || async { service.connection_count().await == 1 }).await);

    agent.disconnect().await;
    assert_eq!(agent.state(), ConnectionState::Disconnected);
    assert!(eventually(WAIT, || async { service.connection_count().await == 0 }).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.stats().reconnect_attempts, 0);
    assert_eq!(service.connection_count().await, 0);

    agent.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    init_tracing();
    let service = Service::builder(service_config()).start().await.unwrap();
    let agent = agent_for(connection_config(service.local_addr(), "k1", "qq"));

    assert!(agent.connect().await);
    assert!(agent.connect().await);
    assert!(agent.is_online().await);
    assert!(eventually(WAIT, || async { service.connection_count().await == 1 }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.connection_count().await, 1);
    assert_eq!(agent.stats().connections_total, 1);

    agent.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn test_unanswered_pings_trigger_reconnect() {
    init_tracing();
    // Completes the handshake, then never reads: pings go unanswered.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        (listener, ws)
    });

    let mut config = connection_config(addr, "k1", "qq");
    config.ping_interval = Duration::from_millis(100);
    config.ping_timeout = Duration::from_millis(100);
    let agent = agent_for(config);
    assert!(agent.connect().await);
    let (_listener, _silent) = server.await.unwrap();

    assert!(eventually(WAIT, || async { agent.stats().reconnect_attempts >= 1 }).await);
    assert_ne!(agent.state(), ConnectionState::Connected);
    assert_eq!(agent.stats().connections_total, 1);

    agent.stop().await;
}

#[tokio::test]
async fn test_answered_pings_keep_connection_up() {
    init_tracing();
    let service = Service::builder(service_config()).start().await.unwrap();
    let mut config = connection_config(service.local_addr(), "k1", "qq");
    config.ping_interval = Duration::from_millis(50);
    config.ping_timeout = Duration::from_millis(200);
    let agent = agent_for(config);
    assert!(agent.connect().await);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(agent.state(), ConnectionState::Connected);
    assert_eq!(agent.stats().reconnect_attempts, 0);
    assert_eq!(agent.stats().connections_total, 1);

    agent.stop().await;
    service.stop().await;
}
