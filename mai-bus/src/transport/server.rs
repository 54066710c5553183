// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Accepting side of the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::identity::{HandshakeRequest, DEFAULT_PLATFORM};
use super::session::{run_session, SessionParams};
use super::{
    build_acceptor, send_outbound, short_id, unix_secs, ws_config, ConnectionIdentity,
    EventSender, FrameSink, Outbound, TransportError, TransportEvent, OUTBOUND_BUFFER,
};
use crate::config::ServiceConfig;
use crate::protocol::{encode, Envelope};
use crate::stats::Stats;

/// Reason sent when a handshake carries no api key.
pub const MISSING_CREDENTIALS: &str = "missing credentials";

struct ConnectionHandle {
    outbound: mpsc::Sender<Outbound>,
}

/// Listens for agent connections and keeps one writer per connection.
pub struct ServerTransport {
    config: ServiceConfig,
    tls: Option<TlsAcceptor>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    events: EventSender,
    stats: Arc<Stats>,
    shutdown: watch::Sender<bool>,
}

impl ServerTransport {
    /// Prepares the transport; TLS material is loaded here.
    pub fn new(
        config: ServiceConfig,
        events: EventSender,
        stats: Arc<Stats>,
    ) -> Result<Self, TransportError> {
        let tls = build_acceptor(&config.tls)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            tls,
            connections: RwLock::new(HashMap::new()),
            events,
            stats,
            shutdown,
        })
    }

    /// Binds the listener and starts accepting in the background.
    pub async fn bind(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        info!("Listening on {}://{}{}", scheme, local_addr, self.config.path);

        let this = Arc::clone(self);
        let stop = self.shutdown.subscribe();
        tokio::spawn(async move { this.accept_loop(listener, stop).await });
        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let this = Arc::clone(&self);
                        let stop = stop.clone();
                        tokio::spawn(async move { this.handle_stream(stream, addr, stop).await });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = stop.changed() => break,
            }
        }
        debug!("Accept loop stopped");
    }

    async fn handle_stream(&self, stream: TcpStream, addr: SocketAddr, stop: watch::Receiver<bool>) {
        let _ = stream.set_nodelay(true);
        match &self.tls {
            Some(acceptor) => {
                match timeout(self.config.handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => self.serve(tls_stream, addr, stop).await,
                    Ok(Err(e)) => warn!("TLS handshake with {} failed: {}", addr, e),
                    Err(_) => warn!("TLS handshake with {} timed out", addr),
                }
            }
            None => self.serve(stream, addr, stop).await,
        }
    }

    async fn serve<S>(&self, stream: S, addr: SocketAddr, stop: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut handshake = None;
        let expected_path = self.config.path.as_str();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() != expected_path {
                let mut rejection = ErrorResponse::new(Some("unknown path".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }
            handshake = Some(HandshakeRequest::from_request(request));
            Ok(response)
        };

        let accepted = timeout(
            self.config.handshake_timeout,
            accept_hdr_async_with_config(
                stream,
                callback,
                Some(ws_config(self.config.max_message_size)),
            ),
        )
        .await;
        let mut ws = match accepted {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                debug!("WebSocket handshake with {} failed: {}", addr, e);
                return;
            }
            Err(_) => {
                warn!("WebSocket handshake with {} timed out", addr);
                return;
            }
        };
        let Some(handshake) = handshake else {
            return;
        };

        let credentials = handshake.credentials(self.config.prefer_query_credentials);
        let Some(api_key) = credentials.api_key else {
            warn!("Rejecting connection from {}: {}", addr, MISSING_CREDENTIALS);
            self.stats.auth_failures.incr();
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: MISSING_CREDENTIALS.into(),
            };
            let _ = timeout(self.config.close_timeout, ws.close(Some(frame))).await;
            return;
        };

        let connection_uuid = Uuid::new_v4().to_string();
        let identity = ConnectionIdentity {
            connection_uuid: connection_uuid.clone(),
            api_key,
            platform: credentials
                .platform
                .unwrap_or_else(|| DEFAULT_PLATFORM.to_string()),
            client_uuid: credentials.client_uuid,
            headers: handshake.headers,
            client_addr: Some(addr),
            connected_at: unix_secs(),
            connection_name: None,
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        if let Ok(mut connections) = self.connections.write() {
            connections.insert(
                connection_uuid.clone(),
                ConnectionHandle {
                    outbound: outbound_tx,
                },
            );
        }
        self.stats.connections_total.incr();
        self.stats.connections_active.incr();
        info!(
            "Connection {} opened from {} (platform {})",
            short_id(&connection_uuid),
            addr,
            identity.platform
        );

        self.events
            .emit_control(TransportEvent::Connect { identity })
            .await;

        let params = SessionParams {
            connection_id: connection_uuid.clone(),
            ping_interval: self.config.ping_interval,
            ping_timeout: self.config.ping_timeout,
            close_timeout: self.config.close_timeout,
        };
        let end = run_session(ws, &params, outbound_rx, &self.events, stop).await;

        if let Ok(mut connections) = self.connections.write() {
            connections.remove(&connection_uuid);
        }
        self.stats.connections_active.decr();
        info!(
            "Connection {} closed: {}",
            short_id(&connection_uuid),
            end.reason()
        );
        self.events
            .emit_control(TransportEvent::Disconnect {
                connection_id: connection_uuid,
                reason: end.reason(),
            })
            .await;
    }

    fn outbound(&self, connection_id: &str) -> Option<mpsc::Sender<Outbound>> {
        self.connections
            .read()
            .ok()?
            .get(connection_id)
            .map(|handle| handle.outbound.clone())
    }

    /// Asks a connection to close with a policy-violation frame.
    /// Returns `false` if the connection is unknown.
    pub fn close(&self, connection_id: &str, reason: &str) -> bool {
        let Some(outbound) = self.outbound(connection_id) else {
            return false;
        };
        let command = Outbound::Close {
            code: CloseCode::Policy,
            reason: reason.to_string(),
        };
        match outbound.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                // Writer is busy; queue the close behind pending frames.
                tokio::spawn(async move {
                    let _ = outbound.send(command).await;
                });
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Stops accepting, closes every connection and waits up to the close
    /// timeout for sessions to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let deadline = Instant::now() + self.config.close_timeout;
        while self.connection_count() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.connection_count();
        if remaining > 0 {
            warn!("{} connections still open after shutdown timeout", remaining);
        }
    }
}

#[async_trait]
impl FrameSink for ServerTransport {
    async fn send(&self, connection_id: &str, envelope: &Envelope) -> bool {
        let text = match encode(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", envelope.msg_type, e);
                return false;
            }
        };
        match self.outbound(connection_id) {
            Some(outbound) => send_outbound(&outbound, text).await,
            None => {
                debug!("Send to unknown connection {}", short_id(connection_id));
                false
            }
        }
    }
}
