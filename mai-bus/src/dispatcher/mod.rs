// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Event Dispatcher
//!
//! Exactly one loop per role instance consumes transport events and API
//! commands. The loop owns the reliability state (cache, dedup table) and
//! the role's bookkeeping, so none of it needs locking. Business handlers
//! run as tracked tasks and are never awaited inline.

mod registry;

pub use registry::{
    CustomHandler, CustomMessage, HandlerError, HandlerRegistry, HandlerResult, MessageContext,
    StandardHandler, StatsCallback, UnhandledHandler, UnhandledReason,
};

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, DispatchConfig};
use crate::protocol::{Envelope, MessageType};
use crate::reliability::{CacheTarget, DedupTable, InsertOutcome, MessageCache};
use crate::stats::Stats;
use crate::transport::{ConnectionIdentity, FrameSink, TransportEvent};

/// What the dispatcher did with one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the standard handler.
    Standard,
    /// Handed to the handler for this custom type.
    Custom(String),
    /// An ack arrived; `removed` tells whether it matched a cached message.
    Acknowledged { acked: String, removed: bool },
    PingAnswered,
    PongReceived,
    /// Seen before within the dedup window; acked but not redelivered.
    Duplicate,
    /// Arrived on a connection the role does not know (e.g. not yet authenticated).
    UnknownConnection,
    Unhandled(UnhandledReason),
}

/// State and helpers shared by every role.
pub(crate) struct Core {
    pub cache: MessageCache,
    pub dedup: DedupTable,
    pub handlers: HandlerRegistry,
    pub sink: Arc<dyn FrameSink>,
    pub stats: Arc<Stats>,
    tasks: JoinSet<()>,
}

impl Core {
    pub fn new(
        cache: CacheConfig,
        dedup_ttl: Duration,
        handlers: HandlerRegistry,
        sink: Arc<dyn FrameSink>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            cache: MessageCache::new(cache),
            dedup: DedupTable::new(dedup_ttl),
            handlers,
            sink,
            stats,
            tasks: JoinSet::new(),
        }
    }

    /// Runs a business callback as a tracked task.
    pub fn spawn_handler(&mut self, label: String, handler: BoxFuture<'static, HandlerResult>) {
        let stats = Arc::clone(&self.stats);
        self.tasks.spawn(async move {
            if let Err(e) = handler.await {
                warn!("Handler {} failed: {}", label, e);
                stats.handler_errors.incr();
            }
        });
    }

    /// Sends envelopes in order from a tracked task.
    pub fn send_in_background(&mut self, connection_id: &str, envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let stats = Arc::clone(&self.stats);
        let connection_id = connection_id.to_string();
        self.tasks.spawn(async move {
            for envelope in envelopes {
                if sink.send(&connection_id, &envelope).await {
                    stats.messages_sent.incr();
                } else {
                    stats.send_failures.incr();
                    debug!("Background send of {} to {} failed", envelope.msg_type, connection_id);
                }
            }
        });
    }

    /// Retransmits cached envelopes for `target` over `connection_id`.
    pub fn replay(&mut self, target: &CacheTarget, connection_id: &str) -> usize {
        let envelopes = self.cache.take_for_replay(target);
        let count = envelopes.len();
        if count > 0 {
            info!("Replaying {} cached messages to {}", count, connection_id);
            self.stats.cache_retries.add(count as u64);
            self.send_in_background(connection_id, envelopes);
        }
        count
    }

    /// Keeps an undelivered business envelope for later replay.
    pub fn cache_undelivered(&mut self, envelope: Envelope, target: Option<CacheTarget>) {
        if !envelope.msg_type.is_cacheable() {
            return;
        }
        let msg_id = envelope.msg_id.clone();
        match self.cache.insert(envelope, target) {
            InsertOutcome::Stored => {
                debug!("Cached undelivered message {}", msg_id);
                self.stats.messages_cached.incr();
            }
            InsertOutcome::Evicted(old) => {
                warn!(
                    "Message cache full ({} entries), evicted {}",
                    self.cache.config().max_size,
                    old.message_id
                );
                self.stats.cache_evictions.incr();
                self.stats.messages_cached.incr();
            }
            InsertOutcome::AlreadyCached | InsertOutcome::Disabled => {}
        }
    }

    /// Collects finished handler tasks and records panics.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Handler task panicked: {}", e);
                    self.stats.handler_errors.incr();
                }
            }
        }
    }

    fn maintain(&mut self, now: Instant) {
        let expired = self.cache.sweep_expired(now.into_std());
        if expired > 0 {
            warn!("Dropped {} cached messages past their TTL", expired);
            self.stats.cache_expired.add(expired as u64);
        }
        let purged = self.dedup.purge_expired(now.into_std());
        if purged > 0 {
            debug!("Purged {} dedup entries", purged);
        }
    }

    pub fn outstanding_tasks(&self) -> usize {
        self.tasks.len()
    }
}

/// Role-specific connection bookkeeping plugged into the dispatcher.
pub(crate) trait Role: Send + 'static {
    type Command: Send + 'static;

    fn on_connect(&mut self, core: &mut Core, identity: ConnectionIdentity);

    fn on_disconnect(&mut self, core: &mut Core, connection_id: &str, reason: &str);

    fn on_command(&mut self, core: &mut Core, command: Self::Command);

    /// Context for a message on `connection_id`; `None` drops the message.
    fn context_for(&self, connection_id: &str, envelope: &Envelope) -> Option<MessageContext>;
}

pub(crate) enum Inbound<C> {
    Event(TransportEvent),
    Command(C),
}

pub(crate) struct Dispatcher<R: Role> {
    role: R,
    core: Core,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<R::Command>,
    config: DispatchConfig,
    stopping: bool,
}

/// Handle used to stop a spawned dispatcher.
pub(crate) struct DispatcherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Signals the loop and waits for it, bounded by `grace` plus a margin.
    pub async fn stop(self, grace: Duration) {
        let _ = self.stop.send(true);
        let abort = self.task.abort_handle();
        if timeout(grace + Duration::from_secs(1), self.task).await.is_err() {
            warn!("Dispatcher did not stop within {:?}, aborting", grace);
            abort.abort();
        }
    }
}

impl<R: Role> Dispatcher<R> {
    pub fn new(
        role: R,
        core: Core,
        events: mpsc::Receiver<TransportEvent>,
        commands: mpsc::Receiver<R::Command>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            role,
            core,
            events,
            commands,
            config,
            stopping: false,
        }
    }

    pub fn spawn(self) -> DispatcherHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        DispatcherHandle { stop, task }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let cleanup_interval = self.core.cache.config().cleanup_interval;
        let mut last_cleanup = Instant::now();
        let mut last_stats = Instant::now();
        debug!("Dispatcher started");

        while !self.stopping && !*stop.borrow() {
            match self.recv_timeout(&mut stop).await {
                Some(Inbound::Event(event)) => self.handle_event(event),
                Some(Inbound::Command(command)) => self.role.on_command(&mut self.core, command),
                None => {}
            }
            self.core.reap();

            let now = Instant::now();
            if now.duration_since(last_cleanup) >= cleanup_interval {
                self.core.maintain(now);
                last_cleanup = now;
            }
            if now.duration_since(last_stats) >= self.config.stats_interval {
                self.report_stats();
                last_stats = now;
            }
        }

        self.shutdown().await;
    }

    /// Waits for the next event or command; `None` after `poll_timeout`
    /// or when stopped.
    async fn recv_timeout(&mut self, stop: &mut watch::Receiver<bool>) -> Option<Inbound<R::Command>> {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() {
                    self.stopping = true;
                }
                None
            }
            Some(event) = self.events.recv() => Some(Inbound::Event(event)),
            Some(command) = self.commands.recv() => Some(Inbound::Command(command)),
            _ = tokio::time::sleep(self.config.poll_timeout) => None,
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connect { identity } => self.role.on_connect(&mut self.core, identity),
            TransportEvent::Disconnect {
                connection_id,
                reason,
            } => self
                .role
                .on_disconnect(&mut self.core, &connection_id, &reason),
            TransportEvent::Message {
                connection_id,
                envelope,
            } => {
                let outcome = self.dispatch(&connection_id, envelope);
                debug!("Dispatched message on {}: {:?}", connection_id, outcome);
            }
        }
    }

    /// Routes one inbound envelope.
    pub fn dispatch(&mut self, connection_id: &str, envelope: Envelope) -> DispatchOutcome {
        let Some(ctx) = self.role.context_for(connection_id, &envelope) else {
            warn!(
                "Dropping {} from unknown connection {}",
                envelope.msg_type, connection_id
            );
            return DispatchOutcome::UnknownConnection;
        };
        self.core.stats.messages_received.incr();

        // Ack before dedup so a lost ack is repaired by the retransmission.
        if envelope.requires_ack() {
            self.core
                .send_in_background(connection_id, vec![Envelope::ack_for(&envelope.msg_id)]);
            self.core.stats.acks_sent.incr();
        }

        match &envelope.msg_type {
            MessageType::Ack => {
                self.core.stats.acks_received.incr();
                let acked = envelope.acked_msg_id().unwrap_or_default().to_string();
                let removed = self.core.cache.acknowledge(&acked).is_some();
                if removed {
                    debug!("Message {} acknowledged", acked);
                }
                return DispatchOutcome::Acknowledged { acked, removed };
            }
            MessageType::Ping => {
                self.core
                    .send_in_background(connection_id, vec![Envelope::pong()]);
                return DispatchOutcome::PingAnswered;
            }
            MessageType::Pong => return DispatchOutcome::PongReceived,
            _ => {}
        }

        if !self.core.dedup.observe(&ctx.identity.peer_key(), &envelope.msg_id) {
            self.core.stats.duplicate_messages_ignored.incr();
            debug!("Ignoring duplicate message {} from {}", envelope.msg_id, connection_id);
            return DispatchOutcome::Duplicate;
        }

        match envelope.msg_type.clone() {
            MessageType::Standard => match envelope.standard_message() {
                Ok(message) => match self.core.handlers.standard() {
                    Some(handler) => {
                        self.core
                            .spawn_handler("on_message".to_string(), handler(message, ctx));
                        DispatchOutcome::Standard
                    }
                    None => self.unhandled(
                        envelope,
                        UnhandledReason::NoHandler("sys_std".to_string()),
                        Some(ctx),
                    ),
                },
                Err(e) => self.unhandled(
                    envelope,
                    UnhandledReason::InvalidPayload(e.to_string()),
                    Some(ctx),
                ),
            },
            MessageType::Custom(name) => match self.core.handlers.custom(&name) {
                Some(handler) => {
                    let message = CustomMessage {
                        name: name.clone(),
                        payload: envelope.payload,
                    };
                    self.core
                        .spawn_handler(format!("custom_{}", name), handler(message, ctx));
                    DispatchOutcome::Custom(name)
                }
                None => {
                    warn!("No handler registered for custom type '{}'", name);
                    self.unhandled(envelope, UnhandledReason::NoHandler(name), Some(ctx))
                }
            },
            MessageType::Unrecognized(raw) if raw.is_empty() => {
                let error = envelope
                    .payload
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unparseable frame")
                    .to_string();
                warn!("Malformed frame on {}: {}", connection_id, error);
                self.unhandled(envelope, UnhandledReason::Malformed(error), Some(ctx))
            }
            MessageType::Unrecognized(raw) => {
                warn!("Unrecognized message type '{}' on {}", raw, connection_id);
                self.unhandled(envelope, UnhandledReason::UnknownType(raw), Some(ctx))
            }
            MessageType::Ack | MessageType::Ping | MessageType::Pong => {
                DispatchOutcome::Unhandled(UnhandledReason::NoHandler(envelope.msg_type.wire_name()))
            }
        }
    }

    fn unhandled(
        &mut self,
        envelope: Envelope,
        reason: UnhandledReason,
        ctx: Option<MessageContext>,
    ) -> DispatchOutcome {
        self.core.stats.unhandled_messages.incr();
        if let Some(handler) = self.core.handlers.unhandled() {
            self.core
                .spawn_handler("on_unhandled".to_string(), handler(envelope, reason.clone(), ctx));
        }
        DispatchOutcome::Unhandled(reason)
    }

    fn report_stats(&mut self) {
        let Some(callback) = self.core.handlers.stats_callback() else {
            return;
        };
        let snapshot = self.core.stats.snapshot();
        self.core.spawn_handler(
            "stats_callback".to_string(),
            Box::pin(async move {
                callback(snapshot);
                Ok::<(), HandlerError>(())
            }),
        );
    }

    async fn shutdown(mut self) {
        let outstanding = self.core.outstanding_tasks();
        self.core.tasks.abort_all();
        let grace = self.config.shutdown_grace;
        let tasks = &mut self.core.tasks;
        let drained = timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Handler tasks still running after {:?}", grace);
        }
        info!("Dispatcher stopped ({} handler tasks cancelled)", outstanding);
    }
}
