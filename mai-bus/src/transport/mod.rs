// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Transport
//!
//! Connection plumbing shared by both roles:
//!
//! - [`ServerTransport`] accepts connections (optionally over TLS) and
//!   resolves handshake credentials into a [`ConnectionIdentity`].
//! - [`ClientTransport`] dials one named connection and reconnects with
//!   exponential backoff after unexpected drops.
//!
//! Both translate socket activity into [`TransportEvent`]s handed to the
//! dispatcher over a bounded channel, and both implement [`FrameSink`].

mod client;
mod identity;
mod server;
mod session;
mod state;
mod tls;

pub use client::ClientTransport;
pub use identity::{ConnectionIdentity, Credentials, HandshakeRequest};
pub use server::ServerTransport;
pub use state::{ConnectionState, StateCell};
pub use tls::build_acceptor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, warn};

use crate::protocol::Envelope;
use crate::stats::Stats;

/// Transport setup errors. Runtime faults surface as events or `false`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Something that happened on a connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connect {
        identity: ConnectionIdentity,
    },
    /// `connection_id` is the connection uuid on the server and the
    /// connection name on the client.
    Disconnect {
        connection_id: String,
        reason: String,
    },
    Message {
        connection_id: String,
        envelope: Envelope,
    },
}

/// Delivers envelopes to a connection by id.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Writes one envelope. A missing connection, a write failure or a
    /// serialization failure yields `false`.
    async fn send(&self, connection_id: &str, envelope: &Envelope) -> bool;
}

/// Producer side of the dispatcher queue.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TransportEvent>,
    enqueue_timeout: Duration,
    stats: Arc<Stats>,
}

impl EventSender {
    pub(crate) fn new(
        tx: mpsc::Sender<TransportEvent>,
        enqueue_timeout: Duration,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            tx,
            enqueue_timeout,
            stats,
        }
    }

    /// Enqueues an inbound message, giving up after the enqueue timeout.
    pub(crate) async fn emit(&self, event: TransportEvent) -> bool {
        match self.tx.send_timeout(event, self.enqueue_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(event)) => {
                warn!(
                    "Dispatcher queue full for {:?}, dropping event",
                    self.enqueue_timeout
                );
                debug!("Dropped event: {:?}", event);
                self.stats.dropped_events.incr();
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Enqueues a connect/disconnect event. These drive bookkeeping and
    /// wait for queue space; the call only fails once the dispatcher is gone.
    pub(crate) async fn emit_control(&self, event: TransportEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Command for a connection's writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame {
        text: String,
        done: oneshot::Sender<bool>,
    },
    Close {
        code: CloseCode,
        reason: String,
    },
}

/// Per-connection outbound queue depth.
pub(crate) const OUTBOUND_BUFFER: usize = 256;

/// Queues a frame and waits until the writer reports the outcome.
pub(crate) async fn send_outbound(tx: &mpsc::Sender<Outbound>, text: String) -> bool {
    let (done, result) = oneshot::channel();
    if tx.send(Outbound::Frame { text, done }).await.is_err() {
        return false;
    }
    result.await.unwrap_or(false)
}

pub(crate) fn ws_config(max_message_size: usize) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(max_message_size),
        max_frame_size: Some(max_message_size),
        ..Default::default()
    }
}

/// Current unix time in whole seconds.
pub(crate) fn unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// First eight characters of an id, for log lines.
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
