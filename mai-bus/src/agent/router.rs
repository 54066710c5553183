// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Multi-connection agent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::AgentError;
use crate::config::{AgentOptions, ConnectionConfig};
use crate::dispatcher::{
    Core, CustomMessage, Dispatcher, DispatcherHandle, HandlerRegistry, HandlerResult,
    MessageContext, Role, UnhandledReason,
};
use crate::protocol::{Envelope, ProtocolError, StandardMessage};
use crate::reliability::CacheTarget;
use crate::stats::{Stats, StatsSnapshot};
use crate::transport::{
    ClientTransport, ConnectionIdentity, ConnectionState, EventSender, FrameSink,
};

const COMMAND_BUFFER: usize = 256;

/// Named client transports.
#[derive(Default)]
struct ClientPool {
    clients: RwLock<HashMap<String, Arc<ClientTransport>>>,
}

impl ClientPool {
    fn get(&self, name: &str) -> Option<Arc<ClientTransport>> {
        self.clients.read().ok()?.get(name).cloned()
    }

    fn insert(&self, client: Arc<ClientTransport>) -> Result<(), AgentError> {
        let mut clients = self.clients.write().map_err(|_| AgentError::Poisoned)?;
        if clients.contains_key(client.name()) {
            return Err(AgentError::DuplicateConnection(client.name().to_string()));
        }
        clients.insert(client.name().to_string(), client);
        Ok(())
    }

    fn remove(&self, name: &str) -> Option<Arc<ClientTransport>> {
        self.clients.write().ok()?.remove(name)
    }

    fn all(&self) -> Vec<Arc<ClientTransport>> {
        self.clients
            .read()
            .map(|clients| clients.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FrameSink for ClientPool {
    async fn send(&self, connection_id: &str, envelope: &Envelope) -> bool {
        match self.get(connection_id) {
            Some(client) => client.send(envelope).await,
            None => false,
        }
    }
}

enum RouterCommand {
    Cache {
        envelope: Envelope,
        connection: String,
    },
    IsOnline {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Online {
        reply: oneshot::Sender<Vec<String>>,
    },
    CachedCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Connections whose CONNECT the dispatcher has processed.
#[derive(Default)]
struct AgentRole {
    online: HashMap<String, ConnectionIdentity>,
}

impl Role for AgentRole {
    type Command = RouterCommand;

    fn on_connect(&mut self, core: &mut Core, identity: ConnectionIdentity) {
        let name = identity.connection_id().to_string();
        info!("Connection '{}' online", name);
        self.online.insert(name.clone(), identity);
        core.replay(&CacheTarget::Connection(name.clone()), &name);
    }

    fn on_disconnect(&mut self, _core: &mut Core, connection_id: &str, reason: &str) {
        if self.online.remove(connection_id).is_some() {
            info!("Connection '{}' offline: {}", connection_id, reason);
        }
    }

    fn on_command(&mut self, core: &mut Core, command: RouterCommand) {
        match command {
            RouterCommand::Cache {
                envelope,
                connection,
            } => {
                let target = CacheTarget::Connection(connection.clone());
                core.cache_undelivered(envelope, Some(target.clone()));
                // The connection may have come back before this command ran.
                if self.online.contains_key(&connection) {
                    core.replay(&target, &connection);
                }
            }
            RouterCommand::IsOnline { name, reply } => {
                let _ = reply.send(self.online.contains_key(&name));
            }
            RouterCommand::Online { reply } => {
                let mut names: Vec<_> = self.online.keys().cloned().collect();
                names.sort();
                let _ = reply.send(names);
            }
            RouterCommand::CachedCount { reply } => {
                let _ = reply.send(core.cache.len());
            }
        }
    }

    fn context_for(&self, connection_id: &str, envelope: &Envelope) -> Option<MessageContext> {
        let identity = self.online.get(connection_id)?;
        Some(MessageContext {
            connection_id: connection_id.to_string(),
            user_id: None,
            identity: identity.clone(),
            msg_id: envelope.msg_id.clone(),
            meta: envelope.meta.clone(),
        })
    }
}

/// Configures a [`Router`].
pub struct RouterBuilder {
    options: AgentOptions,
    handlers: HandlerRegistry,
    connections: Vec<(String, ConnectionConfig)>,
}

impl RouterBuilder {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            handlers: HandlerRegistry::new(),
            connections: Vec::new(),
        }
    }

    pub fn options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn connection(mut self, name: &str, config: ConnectionConfig) -> Self {
        self.connections.push((name.to_string(), config));
        self
    }

    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(StandardMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.on_message(handler);
        self
    }

    pub fn on_custom<F, Fut>(mut self, name: &str, handler: F) -> Result<Self, ProtocolError>
    where
        F: Fn(CustomMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.on_custom(name, handler)?;
        Ok(self)
    }

    pub fn on_default_custom<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CustomMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.on_default_custom(handler);
        self
    }

    pub fn on_unhandled<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Envelope, UnhandledReason, Option<MessageContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.on_unhandled(handler);
        self
    }

    pub fn on_stats<F>(mut self, callback: F) -> Self
    where
        F: Fn(StatsSnapshot) + Send + Sync + 'static,
    {
        self.handlers.on_stats(callback);
        self
    }

    /// Starts the dispatcher. Must be called inside a tokio runtime;
    /// connections are not dialed until `connect`.
    pub fn build(self) -> Result<Router, AgentError> {
        let stats = Arc::new(Stats::default());
        let dispatch = self.options.dispatch.clone();
        let (event_tx, event_rx) = mpsc::channel(dispatch.queue_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let events = EventSender::new(event_tx, dispatch.enqueue_timeout, Arc::clone(&stats));
        let pool = Arc::new(ClientPool::default());

        let sink: Arc<dyn FrameSink> = pool.clone();
        let core = Core::new(
            self.options.message_cache.clone(),
            dispatch.dedup_ttl,
            self.handlers,
            sink,
            Arc::clone(&stats),
        );
        let dispatcher =
            Dispatcher::new(AgentRole::default(), core, event_rx, command_rx, dispatch).spawn();

        let router = Router {
            options: self.options,
            pool,
            events,
            commands: command_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
            stats,
        };
        for (name, config) in self.connections {
            router.add_connection(&name, config)?;
        }
        Ok(router)
    }
}

/// Agent with any number of named connections sharing one dispatcher.
pub struct Router {
    options: AgentOptions,
    pool: Arc<ClientPool>,
    events: EventSender,
    commands: mpsc::Sender<RouterCommand>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    stats: Arc<Stats>,
}

impl Router {
    pub fn builder(options: AgentOptions) -> RouterBuilder {
        RouterBuilder::new(options)
    }

    pub fn add_connection(&self, name: &str, config: ConnectionConfig) -> Result<(), AgentError> {
        if name.trim().is_empty() {
            return Err(AgentError::InvalidName);
        }
        let client = ClientTransport::new(name, config, self.events.clone(), Arc::clone(&self.stats));
        self.pool.insert(Arc::new(client))?;
        debug!("Connection '{}' added", name);
        Ok(())
    }

    /// Disconnects and forgets a connection. Cached messages for it stay
    /// until they expire.
    pub async fn remove_connection(&self, name: &str) -> Result<(), AgentError> {
        let client = self
            .pool
            .remove(name)
            .ok_or_else(|| AgentError::UnknownConnection(name.to_string()))?;
        client.disconnect().await;
        info!("Connection '{}' removed", name);
        Ok(())
    }

    fn client(&self, name: &str) -> Result<Arc<ClientTransport>, AgentError> {
        self.pool
            .get(name)
            .ok_or_else(|| AgentError::UnknownConnection(name.to_string()))
    }

    /// Dials one connection; `Ok(false)` when the dial failed.
    pub async fn connect(&self, name: &str) -> Result<bool, AgentError> {
        Ok(self.client(name)?.connect().await)
    }

    /// Dials every connection concurrently.
    pub async fn connect_all(&self) -> HashMap<String, bool> {
        let clients = self.pool.all();
        let dials = clients.iter().map(|client| async move {
            (client.name().to_string(), client.connect().await)
        });
        join_all(dials).await.into_iter().collect()
    }

    pub async fn disconnect(&self, name: &str) -> Result<(), AgentError> {
        self.client(name)?.disconnect().await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        join_all(self.pool.all().iter().map(|client| client.disconnect())).await;
    }

    /// Sends a standard message; caches it for replay when not delivered.
    pub async fn send_message(&self, name: &str, message: &StandardMessage) -> bool {
        match Envelope::standard(message) {
            Ok(envelope) => self.send_envelope(name, envelope).await,
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                false
            }
        }
    }

    pub async fn send_custom(&self, name: &str, msg_type: &str, payload: Value) -> bool {
        match Envelope::custom(msg_type, payload) {
            Ok(envelope) => self.send_envelope(name, envelope).await,
            Err(e) => {
                warn!("Refusing to send custom message: {}", e);
                false
            }
        }
    }

    pub async fn send_envelope(&self, name: &str, envelope: Envelope) -> bool {
        let Some(client) = self.pool.get(name) else {
            warn!("Send on unknown connection '{}'", name);
            return false;
        };
        if client.send(&envelope).await {
            self.stats.messages_sent.incr();
            return true;
        }
        self.stats.send_failures.incr();
        debug!("Connection '{}' unavailable, caching {}", name, envelope.msg_id);
        let command = RouterCommand::Cache {
            envelope,
            connection: name.to_string(),
        };
        if self.commands.send(command).await.is_err() {
            debug!("Dispatcher is not running; message not cached");
        }
        false
    }

    pub fn connection_state(&self, name: &str) -> Option<ConnectionState> {
        self.pool.get(name).map(|client| client.state())
    }

    /// Consecutive reconnect attempts of the current outage.
    pub fn reconnect_attempts(&self, name: &str) -> Option<u32> {
        self.pool.get(name).map(|client| client.reconnect_attempts())
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RouterCommand) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).await.ok()?;
        response.await.ok()
    }

    /// Whether the dispatcher has seen this connection come up.
    pub async fn is_online(&self, name: &str) -> bool {
        self.request(|reply| RouterCommand::IsOnline {
            name: name.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn online_connections(&self) -> Vec<String> {
        self.request(|reply| RouterCommand::Online { reply })
            .await
            .unwrap_or_default()
    }

    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .pool
            .all()
            .iter()
            .map(|client| client.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub async fn cached_message_count(&self) -> usize {
        self.request(|reply| RouterCommand::CachedCount { reply })
            .await
            .unwrap_or_default()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Disconnects everything and stops the dispatcher. Idempotent.
    pub async fn stop(&self) {
        let Some(dispatcher) = self.dispatcher.lock().await.take() else {
            return;
        };
        self.disconnect_all().await;
        dispatcher.stop(self.options.dispatch.shutdown_grace).await;
        info!("Router stopped");
    }
}
