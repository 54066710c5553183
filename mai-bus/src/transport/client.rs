// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Dialing side of the transport.
//!
//! A [`ClientTransport`] owns one named connection. After the first
//! successful [`connect`](ClientTransport::connect) a supervisor task runs
//! the session and, when the connection drops unexpectedly, redials with
//! exponential backoff until the attempt budget is spent. The initial
//! connect never retries and an explicit
//! [`disconnect`](ClientTransport::disconnect) never triggers a redial.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::identity::{HEADER_API_KEY, HEADER_PLATFORM, HEADER_UUID};
use super::session::{run_session, SessionParams};
use super::{
    send_outbound, unix_secs, ws_config, ConnectionIdentity, ConnectionState, EventSender,
    Outbound, StateCell, TransportError, TransportEvent, OUTBOUND_BUFFER,
};
use crate::config::ConnectionConfig;
use crate::protocol::{encode, Envelope};
use crate::stats::Stats;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Extra time granted to the supervisor beyond the close timeout.
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Lifecycle {
    supervisor: Option<JoinHandle<()>>,
    stop: Option<watch::Sender<bool>>,
}

/// One named outgoing connection.
pub struct ClientTransport {
    name: String,
    config: ConnectionConfig,
    /// Sent as `x-uuid` on every dial.
    client_uuid: String,
    state: StateCell,
    events: EventSender,
    stats: Arc<Stats>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    lifecycle: AsyncMutex<Lifecycle>,
    reconnect_attempts: AtomicU32,
}

impl ClientTransport {
    pub(crate) fn new(
        name: &str,
        config: ConnectionConfig,
        events: EventSender,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            client_uuid: Uuid::new_v4().to_string(),
            state: StateCell::new(),
            events,
            stats,
            outbound: Mutex::new(None),
            lifecycle: AsyncMutex::new(Lifecycle::default()),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Attempts made in the current reconnect cycle; reset on success.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Dials the server. Returns `true` once connected; calling it on a
    /// live connection is a no-op.
    pub async fn connect(self: &Arc<Self>) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state.get().is_connected() {
            return true;
        }
        if let Some(supervisor) = &lifecycle.supervisor {
            if !supervisor.is_finished() {
                // A reconnect cycle is running; wait for it instead of dialing twice.
                return self.wait_connected(self.config.connect_timeout).await;
            }
        }

        self.state.transition(ConnectionState::Connecting);
        let socket = match self.dial().await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Connection '{}' to {} failed: {}", self.name, self.config.url, e);
                self.state.transition(ConnectionState::Error);
                self.state.transition(ConnectionState::Disconnected);
                return false;
            }
        };

        let outbound = self.install_outbound();
        self.state.transition(ConnectionState::Connected);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        info!("Connection '{}' established to {}", self.name, self.config.url);

        let (stop_tx, stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        lifecycle.supervisor = Some(tokio::spawn(async move {
            this.supervise(socket, outbound, stop_rx).await
        }));
        lifecycle.stop = Some(stop_tx);
        true
    }

    /// Closes the connection and cancels any reconnect cycle.
    pub async fn disconnect(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(stop) = lifecycle.stop.take() else {
            self.state.force(ConnectionState::Disconnected);
            return;
        };
        if self.state.get().is_connected() {
            self.state.transition(ConnectionState::Disconnecting);
        }
        let _ = stop.send(true);

        if let Some(supervisor) = lifecycle.supervisor.take() {
            let abort = supervisor.abort_handle();
            if timeout(self.config.close_timeout + STOP_GRACE, supervisor)
                .await
                .is_err()
            {
                warn!("Connection '{}' did not close in time, aborting", self.name);
                abort.abort();
                self.clear_outbound();
                self.events
                    .emit_control(TransportEvent::Disconnect {
                        connection_id: self.name.clone(),
                        reason: "aborted".to_string(),
                    })
                    .await;
            }
        }
        self.state.force(ConnectionState::Disconnected);
        info!("Connection '{}' disconnected", self.name);
    }

    /// Writes one envelope; `false` when not connected or the write fails.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        let text = match encode(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", envelope.msg_type, e);
                return false;
            }
        };
        let outbound = self.outbound.lock().ok().and_then(|guard| guard.clone());
        match outbound {
            Some(outbound) => send_outbound(&outbound, text).await,
            None => false,
        }
    }

    async fn wait_connected(&self, limit: Duration) -> bool {
        let mut rx = self.state.subscribe();
        // The watch::Ref must be dropped before `rx`.
        let connected = matches!(
            timeout(limit, rx.wait_for(|s| s.is_connected())).await,
            Ok(Ok(_))
        );
        connected
    }

    fn build_request(&self) -> Result<Request, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.config.url, e)))?;

        let mut headers: Vec<(&str, &str)> = vec![
            (HEADER_UUID, self.client_uuid.as_str()),
            (HEADER_API_KEY, self.config.api_key.as_str()),
            (HEADER_PLATFORM, self.config.platform.as_str()),
        ];
        headers.extend(
            self.config
                .headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Handshake(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Handshake(format!("header {}: {}", name, e)))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    async fn dial(&self) -> Result<Socket, TransportError> {
        let request = self.build_request()?;
        let config = ws_config(self.config.max_message_size);
        match timeout(
            self.config.connect_timeout,
            connect_async_with_config(request, Some(config), true),
        )
        .await
        {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(TransportError::Handshake(e.to_string())),
            Err(_) => Err(TransportError::Timeout("connect")),
        }
    }

    fn install_outbound(&self) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(tx);
        }
        rx
    }

    fn clear_outbound(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = None;
        }
    }

    fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity {
            connection_uuid: Uuid::new_v4().to_string(),
            api_key: self.config.api_key.clone(),
            platform: self.config.platform.clone(),
            client_uuid: Some(self.client_uuid.clone()),
            headers: self.config.headers.clone(),
            client_addr: None,
            connected_at: unix_secs(),
            connection_name: Some(self.name.clone()),
        }
    }

    async fn supervise(
        self: Arc<Self>,
        socket: Socket,
        outbound: mpsc::Receiver<Outbound>,
        mut stop: watch::Receiver<bool>,
    ) {
        let params = SessionParams {
            connection_id: self.name.clone(),
            ping_interval: self.config.ping_interval,
            ping_timeout: self.config.ping_timeout,
            close_timeout: self.config.close_timeout,
        };
        let mut session = Some((socket, outbound));

        while let Some((socket, outbound)) = session.take() {
            self.stats.connections_total.incr();
            self.stats.connections_active.incr();
            self.events
                .emit_control(TransportEvent::Connect {
                    identity: self.identity(),
                })
                .await;

            let end = run_session(socket, &params, outbound, &self.events, stop.clone()).await;
            self.clear_outbound();
            self.stats.connections_active.decr();

            let explicit = end.is_local() || *stop.borrow();
            if explicit {
                self.state.force(ConnectionState::Disconnected);
            } else {
                self.state.transition(ConnectionState::Error);
                self.state.transition(ConnectionState::Disconnected);
                warn!("Connection '{}' lost: {}", self.name, end.reason());
            }
            self.events
                .emit_control(TransportEvent::Disconnect {
                    connection_id: self.name.clone(),
                    reason: end.reason(),
                })
                .await;

            if !explicit {
                session = self.reconnect(&mut stop).await;
            }
        }
        debug!("Supervisor for '{}' finished", self.name);
    }

    /// Redials with backoff. `None` when stopped or out of attempts.
    async fn reconnect(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<(Socket, mpsc::Receiver<Outbound>)> {
        let policy = &self.config.reconnect;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if !policy.allows(attempt) {
                error!(
                    "Connection '{}': giving up after {} reconnect attempts",
                    self.name, policy.max_attempts
                );
                return None;
            }

            let delay = policy.delay_for_attempt(attempt);
            info!(
                "Connection '{}': reconnect attempt {} in {:?}",
                self.name, attempt, delay
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop.changed() => return None,
            }
            if *stop.borrow() {
                return None;
            }

            self.reconnect_attempts.store(attempt, Ordering::Relaxed);
            self.stats.reconnect_attempts.incr();
            self.state.transition(ConnectionState::Connecting);

            let dialed = tokio::select! {
                result = self.dial() => result,
                _ = stop.changed() => {
                    self.state.transition(ConnectionState::Disconnected);
                    return None;
                }
            };
            match dialed {
                Ok(socket) => {
                    let outbound = self.install_outbound();
                    self.state.transition(ConnectionState::Connected);
                    self.reconnect_attempts.store(0, Ordering::Relaxed);
                    info!(
                        "Connection '{}' re-established after {} attempts",
                        self.name, attempt
                    );
                    return Some((socket, outbound));
                }
                Err(e) => {
                    warn!("Connection '{}': attempt {} failed: {}", self.name, attempt, e);
                    self.state.transition(ConnectionState::Error);
                    self.state.transition(ConnectionState::Disconnected);
                }
            }
        }
    }
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport")
            .field("name", &self.name)
            .field("url", &self.config.url)
            .field("state", &self.state.get())
            .finish()
    }
}
