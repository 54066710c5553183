// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Agent (Spoke)
//!
//! Two modes share one implementation:
//!
//! - [`Router`]: any number of named connections, each with its own
//!   reconnect policy, feeding one dispatcher.
//! - [`Agent`]: a single implicit connection named [`DEFAULT_CONNECTION`].
//!
//! Undelivered business messages are cached per connection and replayed
//! once the dispatcher sees that connection come back up.

mod router;

pub use router::{Router, RouterBuilder};

use std::future::Future;

use serde_json::Value;
use thiserror::Error;

use crate::config::{AgentOptions, ConnectionConfig};
use crate::dispatcher::{CustomMessage, HandlerResult, MessageContext, UnhandledReason};
use crate::protocol::{Envelope, ProtocolError, StandardMessage};
use crate::stats::StatsSnapshot;
use crate::transport::ConnectionState;

/// Name of the connection used in simple mode.
pub const DEFAULT_CONNECTION: &str = "default";

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Connection already exists: {0}")]
    DuplicateConnection(String),

    #[error("Connection name must not be empty")]
    InvalidName,

    #[error("Connection registry lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Configures an [`Agent`].
pub struct AgentBuilder {
    inner: RouterBuilder,
    config: ConnectionConfig,
}

impl AgentBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: RouterBuilder::new(AgentOptions::default()),
            config,
        }
    }

    pub fn options(mut self, options: AgentOptions) -> Self {
        self.inner = self.inner.options(options);
        self
    }

    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(StandardMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner = self.inner.on_message(handler);
        self
    }

    pub fn on_custom<F, Fut>(mut self, name: &str, handler: F) -> Result<Self, ProtocolError>
    where
        F: Fn(CustomMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner = self.inner.on_custom(name, handler)?;
        Ok(self)
    }

    pub fn on_default_custom<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CustomMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner = self.inner.on_default_custom(handler);
        self
    }

    pub fn on_unhandled<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Envelope, UnhandledReason, Option<MessageContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner = self.inner.on_unhandled(handler);
        self
    }

    pub fn on_stats<F>(mut self, callback: F) -> Self
    where
        F: Fn(StatsSnapshot) + Send + Sync + 'static,
    {
        self.inner = self.inner.on_stats(callback);
        self
    }

    /// Starts the dispatcher; call [`Agent::connect`] to dial.
    pub fn build(self) -> Result<Agent, AgentError> {
        let router = self
            .inner
            .connection(DEFAULT_CONNECTION, self.config)
            .build()?;
        Ok(Agent { router })
    }
}

/// Agent with a single connection.
pub struct Agent {
    router: Router,
}

impl Agent {
    pub fn builder(config: ConnectionConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub async fn connect(&self) -> bool {
        self.router
            .connect(DEFAULT_CONNECTION)
            .await
            .unwrap_or(false)
    }

    pub async fn disconnect(&self) {
        let _ = self.router.disconnect(DEFAULT_CONNECTION).await;
    }

    pub async fn send_message(&self, message: &StandardMessage) -> bool {
        self.router.send_message(DEFAULT_CONNECTION, message).await
    }

    pub async fn send_custom(&self, msg_type: &str, payload: Value) -> bool {
        self.router
            .send_custom(DEFAULT_CONNECTION, msg_type, payload)
            .await
    }

    pub async fn send_envelope(&self, envelope: Envelope) -> bool {
        self.router.send_envelope(DEFAULT_CONNECTION, envelope).await
    }

    pub fn state(&self) -> ConnectionState {
        self.router
            .connection_state(DEFAULT_CONNECTION)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn is_online(&self) -> bool {
        self.router.is_online(DEFAULT_CONNECTION).await
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.router
            .reconnect_attempts(DEFAULT_CONNECTION)
            .unwrap_or_default()
    }

    pub async fn cached_message_count(&self) -> usize {
        self.router.cached_message_count().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.router.stats()
    }

    /// The underlying router, for multi-connection features.
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub async fn stop(&self) {
        self.router.stop().await;
    }
}
