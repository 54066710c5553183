// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! A router holding named connections to several services.

mod common;

use common::*;
use mai_bus::{AgentError, Router, Service, StandardMessage};
use tokio::sync::mpsc;

async fn recording_service(
    label: &'static str,
    tx: mpsc::UnboundedSender<(&'static str, String)>,
) -> Service {
    Service::builder(service_config())
        .on_message(move |message, _ctx| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((label, message.plain_text()));
                Ok(())
            }
        })
        .start()
        .await
        .expect("service starts")
}

#[tokio::test]
async fn test_messages_go_to_the_named_connection() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let alpha = recording_service("alpha", tx.clone()).await;
    let beta = recording_service("beta", tx).await;

    let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
    let router = Router::builder(agent_options())
        .connection("alpha", connection_config(alpha.local_addr(), "k1", "qq"))
        .connection("beta", connection_config(beta.local_addr(), "k1", "qq"))
        .on_message(move |message, ctx| {
            let tx = inbox_tx.clone();
            async move {
                let _ = tx.send((ctx.connection_id, message.plain_text()));
                Ok(())
            }
        })
        .build()
        .expect("router builds");

    let results = router.connect_all().await;
    assert_eq!(results.len(), 2);
    assert!(results.values().all(|ok| *ok));
    assert_eq!(router.connection_names(), vec!["alpha", "beta"]);
    assert!(eventually(WAIT, || async { router.online_connections().await.len() == 2 }).await);

    assert!(router.send_message("beta", &StandardMessage::text("qq", "k1", "to beta")).await);
    let received = tokio::time::timeout(WAIT, rx.recv()).await.ok().flatten();
    assert_eq!(received, Some(("beta", "to beta".to_string())));

    assert!(eventually(WAIT, || async { alpha.connection_count().await == 1 }).await);
    alpha.send(&StandardMessage::text("qq", "k1", "from alpha")).await;
    let received = tokio::time::timeout(WAIT, inbox.recv()).await.ok().flatten();
    assert_eq!(received, Some(("alpha".to_string(), "from alpha".to_string())));

    router.stop().await;
    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn test_connection_registry_errors() {
    init_tracing();
    let service = Service::builder(service_config()).start().await.unwrap();
    let config = connection_config(service.local_addr(), "k1", "qq");
    let router = Router::builder(agent_options())
        .connection("main", config.clone())
        .build()
        .unwrap();

    assert!(matches!(
        router.add_connection("main", config.clone()),
        Err(AgentError::DuplicateConnection(name)) if name == "main"
    ));
    assert!(matches!(
        router.add_connection("  ", config.clone()),
        Err(AgentError::InvalidName)
    ));
    assert!(matches!(
        router.connect("missing").await,
        Err(AgentError::UnknownConnection(_))
    ));
    assert!(!router.send_custom("missing", "ping", serde_json::json!({})).await);
    assert_eq!(router.connection_state("missing"), None);

    router.add_connection("spare", config).unwrap();
    assert_eq!(router.connect("spare").await.unwrap(), true);
    assert!(router.is_online("spare").await);
    assert!(eventually(WAIT, || async { service.connection_count().await == 1 }).await);

    router.remove_connection("spare").await.unwrap();
    assert_eq!(router.connection_names(), vec!["main"]);
    assert!(eventually(WAIT, || async { service.connection_count().await == 0 }).await);
    assert!(matches!(
        router.remove_connection("spare").await,
        Err(AgentError::UnknownConnection(_))
    ));

    router.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn test_offline_connection_caches_until_connected() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let service = recording_service("svc", tx).await;
    let router = Router::builder(agent_options())
        .connection("late", connection_config(service.local_addr(), "k1", "qq"))
        .build()
        .unwrap();

    assert!(!router.send_message("late", &StandardMessage::text("qq", "k1", "held")).await);
    assert!(eventually(WAIT, || async { router.cached_message_count().await == 1 }).await);

    assert!(router.connect("late").await.unwrap());
    let received = tokio::time::timeout(WAIT, rx.recv()).await.ok().flatten();
    assert_eq!(received, Some(("svc", "held".to_string())));
    assert!(eventually(WAIT, || async { router.cached_message_count().await == 0 }).await);

    router.stop().await;
    service.stop().await;
}
