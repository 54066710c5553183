// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay
//!
//! Standard messages whose `message_dim` names another user are forwarded
//! to that user's connections on the addressed platform. Messages that
//! resolve back to their sender are only logged.

use std::sync::{Arc, OnceLock};

use mai_bus::{HandlerResult, MessageContext, Service, StandardMessage};
use tracing::{debug, info};

use crate::auth::ApiKeyTable;
use crate::metrics::HubMetrics;

/// What the relay did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Delivered to (or cached for) `user_id`; `delivered` counts live
    /// connections that accepted it.
    Forwarded { user_id: String, delivered: usize },
    /// Addressed to its own sender.
    Loopback,
    /// `message_dim` names no known user.
    UnknownTarget,
}

#[derive(Clone)]
pub struct Relay {
    service: Arc<OnceLock<Arc<Service>>>,
    keys: ApiKeyTable,
    metrics: HubMetrics,
}

impl Relay {
    pub fn new(keys: ApiKeyTable, metrics: HubMetrics) -> Self {
        Self {
            service: Arc::new(OnceLock::new()),
            keys,
            metrics,
        }
    }

    /// Installs the running service. The handler is registered before the
    /// service exists, so messages arriving earlier are dropped.
    pub fn attach(&self, service: Arc<Service>) -> bool {
        self.service.set(service).is_ok()
    }

    pub async fn handle(&self, message: StandardMessage, ctx: MessageContext) -> HandlerResult {
        let outcome = self.forward(&message, &ctx).await?;
        debug!(
            "Message {} from {:?}: {:?}",
            message.message_info.message_id, ctx.user_id, outcome
        );
        Ok(())
    }

    pub async fn forward(
        &self,
        message: &StandardMessage,
        ctx: &MessageContext,
    ) -> Result<RelayOutcome, mai_bus::HandlerError> {
        let service = self.service.get().ok_or("relay not attached to a service")?;
        let dim = &message.message_dim;
        let Some(target) = self.keys.user_for(&dim.api_key) else {
            info!(
                "Dropping message {}: no user for its target on {}",
                message.message_info.message_id, dim.platform
            );
            return Ok(RelayOutcome::UnknownTarget);
        };

        if ctx.user_id.as_deref() == Some(target.as_str()) {
            info!(
                "Message {} from {} on {}: {}",
                message.message_info.message_id,
                target,
                dim.platform,
                message.plain_text()
            );
            return Ok(RelayOutcome::Loopback);
        }

        let results = service.send(message).await;
        let delivered = results.values().filter(|ok| **ok).count();
        self.metrics.messages_relayed.inc();
        info!(
            "Relayed message {} to {} on {} ({} connections)",
            message.message_info.message_id, target, dim.platform, delivered
        );
        Ok(RelayOutcome::Forwarded {
            user_id: target,
            delivered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mai_bus::{ConnectionIdentity, ServiceConfig};
    use serde_json::Map;
    use std::collections::HashMap;

    fn keys() -> ApiKeyTable {
        ApiKeyTable::new(HashMap::from([
            ("alice-key".to_string(), "alice".to_string()),
            ("bob-key".to_string(), "bob".to_string()),
        ]))
    }

    fn ctx(user: &str) -> MessageContext {
        MessageContext {
            connection_id: "c1".to_string(),
            user_id: Some(user.to_string()),
            identity: ConnectionIdentity::for_routing("alice-key", "qq"),
            msg_id: "m1".to_string(),
            meta: Map::new(),
        }
    }

    async fn attached_relay() -> (Relay, Arc<Service>) {
        let config = ServiceConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let service = Arc::new(Service::builder(config).hooks(keys()).start().await.unwrap());
        let relay = Relay::new(keys(), HubMetrics::new().unwrap());
        assert!(relay.attach(service.clone()));
        (relay, service)
    }

    #[tokio::test]
    async fn test_unattached_relay_fails() {
        let relay = Relay::new(keys(), HubMetrics::new().unwrap());
        let message = StandardMessage::text("qq", "bob-key", "hi");
        assert!(relay.forward(&message, &ctx("alice")).await.is_err());
    }

    #[tokio::test]
    async fn test_message_to_self_is_not_forwarded() {
        let (relay, service) = attached_relay().await;
        let message = StandardMessage::text("qq", "alice-key", "note to self");
        let outcome = relay.forward(&message, &ctx("alice")).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Loopback);
        assert_eq!(relay.metrics.messages_relayed.get(), 0);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_target_is_dropped() {
        let (relay, service) = attached_relay().await;
        let message = StandardMessage::text("qq", "stranger", "hello?");
        let outcome = relay.forward(&message, &ctx("alice")).await.unwrap();
        assert_eq!(outcome, RelayOutcome::UnknownTarget);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_offline_target_is_cached() {
        let (relay, service) = attached_relay().await;
        let message = StandardMessage::text("qq", "bob-key", "hi bob");
        let outcome = relay.forward(&message, &ctx("alice")).await.unwrap();
        assert_eq!(
            outcome,
            RelayOutcome::Forwarded {
                user_id: "bob".to_string(),
                delivered: 0
            }
        );
        assert_eq!(relay.metrics.messages_relayed.get(), 1);
        service.stop().await;
    }
}
