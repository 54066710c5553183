// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Service (Hub)
//!
//! Accepts agent connections, authenticates them through [`ServiceHooks`],
//! maps each connection to a logical user and routes outgoing messages by
//! `(user, platform)`. Messages for users without a live connection are
//! cached and replayed when the user reconnects.
//!
//! # Example
//!
//! ```ignore
//! let service = ServiceBuilder::new(ServiceConfig::default())
//!     .on_message(|message, ctx| async move {
//!         println!("{} says {}", ctx.user_id.unwrap_or_default(), message.plain_text());
//!         Ok(())
//!     })
//!     .start()
//!     .await?;
//! ```

mod routing;

pub use routing::RoutingTable;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::dispatcher::{
    Core, CustomMessage, Dispatcher, DispatcherHandle, HandlerError, HandlerRegistry,
    HandlerResult, MessageContext, Role, UnhandledReason,
};
use crate::protocol::{Envelope, ProtocolError, StandardMessage};
use crate::reliability::CacheTarget;
use crate::stats::{Stats, StatsSnapshot};
use crate::transport::{
    short_id, ConnectionIdentity, EventSender, FrameSink, ServerTransport, TransportError,
};

/// Error type returned by hooks.
pub type HookError = HandlerError;

/// Result of a send: connection uuid to write outcome. Empty when no
/// connection matched.
pub type SendResult = HashMap<String, bool>;

/// Predicate selecting broadcast recipients.
pub type ConnectionFilter = Box<dyn Fn(&ConnectionInfo) -> bool + Send>;

const COMMAND_BUFFER: usize = 256;

/// Reason sent to connections rejected by [`ServiceHooks::authenticate`].
pub const AUTH_FAILED: &str = "authentication failed";

/// Reason sent when no logical user can be derived for a connection.
pub const IDENTITY_UNRESOLVED: &str = "unable to resolve identity";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Service is not running")]
    NotRunning,
}

/// Collaborator hooks deciding who may connect and who they are.
pub trait ServiceHooks: Send + Sync + 'static {
    /// Accepts or rejects a new connection. Defaults to accepting everyone.
    fn authenticate(&self, identity: &ConnectionIdentity) -> Result<bool, HookError> {
        let _ = identity;
        Ok(true)
    }

    /// Maps a connection (or an outgoing message's api key) to a logical
    /// user id. Defaults to the api key.
    fn extract_logical_id(&self, identity: &ConnectionIdentity) -> Result<String, HookError> {
        Ok(identity.api_key.clone())
    }
}

/// Accepts every connection; the logical id is the api key.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ServiceHooks for AllowAll {}

fn run_hook<T>(hook: impl FnOnce() -> Result<T, HookError>) -> Result<T, HookError> {
    catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|_| Err("hook panicked".into()))
}

fn resolve_user(hooks: &dyn ServiceHooks, identity: &ConnectionIdentity) -> Result<String, HookError> {
    let user_id = run_hook(|| hooks.extract_logical_id(identity))?;
    if user_id.trim().is_empty() {
        return Err("empty logical id".into());
    }
    Ok(user_id)
}

/// A registered connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub user_id: String,
    #[serde(flatten)]
    pub identity: ConnectionIdentity,
}

/// Addressing for [`Service::send_custom`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendTarget {
    pub user_id: Option<String>,
    pub platform: Option<String>,
    /// Narrows delivery to one connection.
    pub connection: Option<String>,
}

impl SendTarget {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn route(user_id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            platform: Some(platform.into()),
            connection: None,
        }
    }

    pub fn connection(connection_uuid: impl Into<String>) -> Self {
        Self {
            connection: Some(connection_uuid.into()),
            ..Default::default()
        }
    }

    pub fn on_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Cache key when nothing could be delivered; only a full route is cacheable.
    fn cache_target(&self) -> Option<CacheTarget> {
        match (&self.user_id, &self.platform) {
            (Some(user_id), Some(platform)) => Some(CacheTarget::Route {
                user_id: user_id.clone(),
                platform: platform.clone(),
            }),
            _ => None,
        }
    }
}

enum ServiceCommand {
    Resolve {
        target: SendTarget,
        reply: oneshot::Sender<Vec<String>>,
    },
    Cache {
        envelope: Envelope,
        target: CacheTarget,
    },
    Select {
        filter: Option<ConnectionFilter>,
        reply: oneshot::Sender<Vec<String>>,
    },
    ConnectionsByUser {
        user_id: String,
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    ConnectionsFor {
        user_id: String,
        platform: String,
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Connection {
        connection_uuid: String,
        reply: oneshot::Sender<Option<ConnectionInfo>>,
    },
    Counts {
        reply: oneshot::Sender<(usize, usize, usize)>,
    },
    CachedCount {
        reply: oneshot::Sender<usize>,
    },
}

struct ServiceRole {
    routing: RoutingTable,
    hooks: Arc<dyn ServiceHooks>,
    transport: Arc<ServerTransport>,
}

impl ServiceRole {
    fn info(&self, connection_uuid: &str) -> Option<ConnectionInfo> {
        Some(ConnectionInfo {
            user_id: self.routing.user_of(connection_uuid)?.to_string(),
            identity: self.routing.identity(connection_uuid)?.clone(),
        })
    }

    fn infos(&self, connections: Vec<String>) -> Vec<ConnectionInfo> {
        connections.iter().filter_map(|c| self.info(c)).collect()
    }

    fn resolve(&self, target: &SendTarget) -> Vec<String> {
        if let Some(uuid) = &target.connection {
            let Some(identity) = self.routing.identity(uuid) else {
                return Vec::new();
            };
            let user_matches = target
                .user_id
                .as_deref()
                .map_or(true, |user| self.routing.user_of(uuid) == Some(user));
            let platform_matches = target
                .platform
                .as_deref()
                .map_or(true, |platform| identity.platform == platform);
            return if user_matches && platform_matches {
                vec![uuid.clone()]
            } else {
                Vec::new()
            };
        }
        match (&target.user_id, &target.platform) {
            (Some(user), Some(platform)) => self.routing.connections_for(user, platform),
            (Some(user), None) => self.routing.connections_for_user(user),
            (None, Some(platform)) => self.routing.connections_on_platform(platform),
            (None, None) => Vec::new(),
        }
    }

    fn reject(&self, core: &mut Core, connection_uuid: &str, reason: &str, auth_failure: bool) {
        if auth_failure {
            core.stats.auth_failures.incr();
        }
        self.transport.close(connection_uuid, reason);
    }
}

impl Role for ServiceRole {
    type Command = ServiceCommand;

    fn on_connect(&mut self, core: &mut Core, identity: ConnectionIdentity) {
        let uuid = identity.connection_uuid.clone();
        match run_hook(|| self.hooks.authenticate(&identity)) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Connection {} rejected by authentication", short_id(&uuid));
                self.reject(core, &uuid, AUTH_FAILED, true);
                return;
            }
            Err(e) => {
                warn!("Authentication of {} failed: {}", short_id(&uuid), e);
                self.reject(core, &uuid, AUTH_FAILED, true);
                return;
            }
        }

        let user_id = match resolve_user(self.hooks.as_ref(), &identity) {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!("Cannot route connection {}: {}", short_id(&uuid), e);
                self.reject(core, &uuid, IDENTITY_UNRESOLVED, false);
                return;
            }
        };

        let platform = identity.platform.clone();
        self.routing.register(identity, &user_id);
        info!(
            "Connection {} registered for user {} on {}",
            short_id(&uuid),
            user_id,
            platform
        );
        core.replay(&CacheTarget::Route { user_id, platform }, &uuid);
    }

    fn on_disconnect(&mut self, _core: &mut Core, connection_id: &str, reason: &str) {
        match self.routing.unregister(connection_id) {
            Some((user_id, platform)) => info!(
                "Connection {} of user {} on {} removed: {}",
                short_id(connection_id),
                user_id,
                platform,
                reason
            ),
            None => debug!(
                "Unregistered connection {} closed: {}",
                short_id(connection_id),
                reason
            ),
        }
    }

    fn on_command(&mut self, core: &mut Core, command: ServiceCommand) {
        match command {
            ServiceCommand::Resolve { target, reply } => {
                let _ = reply.send(self.resolve(&target));
            }
            ServiceCommand::Cache { envelope, target } => {
                core.cache_undelivered(envelope, Some(target.clone()));
                if let CacheTarget::Route { user_id, platform } = &target {
                    // A connection for the route may have registered meanwhile.
                    if let Some(uuid) = self.routing.connections_for(user_id, platform).first() {
                        core.replay(&target, uuid);
                    }
                }
            }
            ServiceCommand::Select { filter, reply } => {
                let selected = self
                    .routing
                    .entries()
                    .filter(|(identity, user_id)| match &filter {
                        Some(filter) => filter(&ConnectionInfo {
                            user_id: user_id.to_string(),
                            identity: (*identity).clone(),
                        }),
                        None => true,
                    })
                    .map(|(identity, _)| identity.connection_uuid.clone())
                    .collect();
                let _ = reply.send(selected);
            }
            ServiceCommand::ConnectionsByUser { user_id, reply } => {
                let _ = reply.send(self.infos(self.routing.connections_for_user(&user_id)));
            }
            ServiceCommand::ConnectionsFor {
                user_id,
                platform,
                reply,
            } => {
                let _ = reply.send(self.infos(self.routing.connections_for(&user_id, &platform)));
            }
            ServiceCommand::Connection {
                connection_uuid,
                reply,
            } => {
                let _ = reply.send(self.info(&connection_uuid));
            }
            ServiceCommand::Counts { reply } => {
                let _ = reply.send((
                    self.routing.connection_count(),
                    self.routing.user_count(),
                    self.routing.platform_count(),
                ));
            }
            ServiceCommand::CachedCount { reply } => {
                let _ = reply.send(core.cache.len());
            }
        }
    }

    fn context_for(&self, connection_id: &str, envelope: &Envelope) -> Option<MessageContext> {
        let identity = self.routing.identity(connection_id)?;
        Some(MessageContext {
            connection_id: connection_id.to_string(),
            user_id: self.routing.user_of(connection_id).map(str::to_string),
            identity: identity.clone(),
            msg_id: envelope.msg_id.clone(),
            meta: envelope.meta.clone(),
        })
    }
}

/// Configures and starts a [`Service`].
pub struct ServiceBuilder {
    config: ServiceConfig,
    hooks: Arc<dyn ServiceHooks>,
    handlers: HandlerRegistry,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            hooks: Arc::new(AllowAll),
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn hooks(mut self, hooks: impl ServiceHooks) -> Self {
        self.hooks = Arc::new(hooks);
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

    /// Binds the listener and starts the dispatcher.
    pub async fn start(self) -> Result<Service, ServiceError> {
        let stats = Arc::new(Stats::default());
        let dispatch = self.config.dispatch.clone();
        let (event_tx, event_rx) = mpsc::channel(dispatch.queue_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let events = EventSender::new(event_tx, dispatch.enqueue_timeout, Arc::clone(&stats));

        let transport = Arc::new(ServerTransport::new(
            self.config.clone(),
            events,
            Arc::clone(&stats),
        )?);
        let local_addr = transport.bind().await?;

        let role = ServiceRole {
            routing: RoutingTable::new(),
            hooks: Arc::clone(&self.hooks),
            transport: Arc::clone(&transport),
        };
        let sink: Arc<dyn FrameSink> = transport.clone();
        let core = Core::new(
            self.config.message_cache.clone(),
            dispatch.dedup_ttl,
            self.handlers,
            sink,
            Arc::clone(&stats),
        );
        let dispatcher = Dispatcher::new(role, core, event_rx, command_rx, dispatch).spawn();

        info!("Service started on {}", local_addr);
        Ok(Service {
            config: self.config,
            hooks: self.hooks,
            transport,
            commands: command_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
            stats,
            local_addr,
        })
    }
}

/// A running service endpoint.
pub struct Service {
    config: ServiceConfig,
    hooks: Arc<dyn ServiceHooks>,
    transport: Arc<ServerTransport>,
    commands: mpsc::Sender<ServiceCommand>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    stats: Arc<Stats>,
    local_addr: SocketAddr,
}

impl Service {
    pub fn builder(config: ServiceConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn is_running(&self) -> bool {
        self.dispatcher.lock().await.is_some()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ServiceCommand) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(build(reply)).await.is_err() {
            debug!("Dispatcher is not running");
            return None;
        }
        response.await.ok()
    }

    /// Sends a standard message to the user behind `message_dim`.
    pub async fn send(&self, message: &StandardMessage) -> SendResult {
        let envelope = match Envelope::standard(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to serialize message {}: {}", message.message_info.message_id, e);
                return SendResult::new();
            }
        };
        let dim = &message.message_dim;
        let lookup = ConnectionIdentity::for_routing(&dim.api_key, &dim.platform);
        let user_id = match resolve_user(self.hooks.as_ref(), &lookup) {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!("No logical user for outgoing message on {}: {}", dim.platform, e);
                return SendResult::new();
            }
        };
        self.deliver(envelope, SendTarget::route(user_id, dim.platform.clone()))
            .await
    }

    /// Sends a `custom_<msg_type>` envelope.
    pub async fn send_custom(&self, msg_type: &str, payload: Value, target: SendTarget) -> SendResult {
        match Envelope::custom(msg_type, payload) {
            Ok(envelope) => self.deliver(envelope, target).await,
            Err(e) => {
                warn!("Refusing to send custom message: {}", e);
                SendResult::new()
            }
        }
    }

    /// Sends a pre-built envelope to `user_id` on `platform`.
    pub async fn send_envelope(&self, envelope: Envelope, user_id: &str, platform: &str) -> SendResult {
        self.deliver(envelope, SendTarget::route(user_id, platform))
            .await
    }

    async fn deliver(&self, mut envelope: Envelope, target: SendTarget) -> SendResult {
        if !envelope.meta.contains_key("sender_user") {
            envelope.set_meta("sender_user", "service");
        }
        if let Some(user_id) = &target.user_id {
            envelope.set_meta("target_user", user_id.as_str());
        }
        if let Some(platform) = &target.platform {
            envelope.set_meta("target_platform", platform.as_str());
        }

        let connections = self
            .request(|reply| ServiceCommand::Resolve {
                target: target.clone(),
                reply,
            })
            .await
            .unwrap_or_default();

        let results = self.write_all(&connections, &envelope).await;
        if !results.values().any(|ok| *ok) {
            if connections.is_empty() {
                warn!(
                    "No connection for user {:?} on {:?}",
                    target.user_id, target.platform
                );
            }
            if let Some(cache_target) = target.cache_target() {
                self.request_cache(envelope, cache_target).await;
            }
        }
        results
    }

    async fn write_all(&self, connections: &[String], envelope: &Envelope) -> SendResult {
        let sends = connections.iter().map(|uuid| async move {
            let ok = self.transport.send(uuid, envelope).await;
            if ok {
                self.stats.messages_sent.incr();
            } else {
                self.stats.send_failures.incr();
            }
            (uuid.clone(), ok)
        });
        join_all(sends).await.into_iter().collect()
    }

    async fn request_cache(&self, envelope: Envelope, target: CacheTarget) {
        let command = ServiceCommand::Cache { envelope, target };
        if self.commands.send(command).await.is_err() {
            debug!("Dispatcher is not running; message not cached");
        }
    }

    /// Sends `envelope` to every connection accepted by `filter`. Nothing is cached.
    pub async fn broadcast(&self, envelope: Envelope, filter: Option<ConnectionFilter>) -> SendResult {
        let connections = self
            .request(|reply| ServiceCommand::Select { filter, reply })
            .await
            .unwrap_or_default();
        self.write_all(&connections, &envelope).await
    }

    pub async fn connections_by_user(&self, user_id: &str) -> Vec<ConnectionInfo> {
        self.request(|reply| ServiceCommand::ConnectionsByUser {
            user_id: user_id.to_string(),
            reply,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn connections_for(&self, user_id: &str, platform: &str) -> Vec<ConnectionInfo> {
        self.request(|reply| ServiceCommand::ConnectionsFor {
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            reply,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn connection_info(&self, connection_uuid: &str) -> Option<ConnectionInfo> {
        self.request(|reply| ServiceCommand::Connection {
            connection_uuid: connection_uuid.to_string(),
            reply,
        })
        .await
        .flatten()
    }

    async fn counts(&self) -> (usize, usize, usize) {
        self.request(|reply| ServiceCommand::Counts { reply })
            .await
            .unwrap_or_default()
    }

    /// Registered (authenticated) connections.
    pub async fn connection_count(&self) -> usize {
        self.counts().await.0
    }

    pub async fn user_count(&self) -> usize {
        self.counts().await.1
    }

    pub async fn platform_count(&self) -> usize {
        self.counts().await.2
    }

    pub async fn cached_message_count(&self) -> usize {
        self.request(|reply| ServiceCommand::CachedCount { reply })
            .await
            .unwrap_or_default()
    }

    /// Closes all connections, then stops the dispatcher. Idempotent.
    pub async fn stop(&self) {
        let Some(dispatcher) = self.dispatcher.lock().await.take() else {
            return;
        };
        info!("Stopping service on {}", self.local_addr);
        self.transport.shutdown().await;
        dispatcher.stop(self.config.dispatch.shutdown_grace).await;
        info!("Service stopped");
    }
}
