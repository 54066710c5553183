// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-connection read/write loop shared by server and client.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use super::{EventSender, Outbound, TransportEvent};
use crate::protocol::decode;

/// Keepalive and close timing for one session.
#[derive(Debug, Clone)]
pub(crate) struct SessionParams {
    pub connection_id: String,
    /// Zero disables keepalive pings.
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub close_timeout: Duration,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    PeerClosed(Option<String>),
    ReadError(String),
    WriteError(String),
    PingTimeout,
    /// Closed through an [`Outbound::Close`] command.
    LocalClose(String),
    /// Stop signal or all senders gone.
    Stopped,
}

impl SessionEnd {
    pub fn reason(&self) -> String {
        match self {
            SessionEnd::PeerClosed(Some(reason)) if !reason.is_empty() => {
                format!("closed by peer: {}", reason)
            }
            SessionEnd::PeerClosed(_) => "closed by peer".to_string(),
            SessionEnd::ReadError(e) => format!("read error: {}", e),
            SessionEnd::WriteError(e) => format!("write error: {}", e),
            SessionEnd::PingTimeout => "ping timeout".to_string(),
            SessionEnd::LocalClose(reason) => reason.clone(),
            SessionEnd::Stopped => "shutdown".to_string(),
        }
    }

    /// Ended by this side rather than by the peer or the network.
    pub fn is_local(&self) -> bool {
        matches!(self, SessionEnd::LocalClose(_) | SessionEnd::Stopped)
    }
}

/// Runs a connection until it closes, forwarding decoded envelopes to
/// `events` and writing frames queued on `outbound`.
pub(crate) async fn run_session<S>(
    ws: WebSocketStream<S>,
    params: &SessionParams,
    mut outbound: mpsc::Receiver<Outbound>,
    events: &EventSender,
    mut stop: watch::Receiver<bool>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();

    let keepalive = !params.ping_interval.is_zero();
    let period = if keepalive {
        params.ping_interval
    } else {
        Duration::from_secs(3600)
    };
    let mut ping_timer = interval_at(Instant::now() + period, period);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    if *stop.borrow() {
        return SessionEnd::Stopped;
    }

    let end = loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    forward(events, &params.connection_id, &text).await;
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => forward(events, &params.connection_id, &text).await,
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame on {}", params.connection_id),
                },
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    // Flush the automatic close reply.
                    let _ = write.close().await;
                    break SessionEnd::PeerClosed(frame.map(|f| f.reason.into_owned()));
                }
                Some(Err(e)) => break SessionEnd::ReadError(e.to_string()),
                None => break SessionEnd::PeerClosed(None),
            },

            command = outbound.recv() => match command {
                Some(Outbound::Frame { text, done }) => {
                    match write.send(Message::Text(text)).await {
                        Ok(()) => {
                            let _ = done.send(true);
                        }
                        Err(e) => {
                            let _ = done.send(false);
                            break SessionEnd::WriteError(e.to_string());
                        }
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame { code, reason: reason.clone().into() };
                    if write.send(Message::Close(Some(frame))).await.is_ok() {
                        drain_until_closed(&mut read, params.close_timeout).await;
                    }
                    break SessionEnd::LocalClose(reason);
                }
                None => {
                    close_normal(&mut write, &mut read, params.close_timeout).await;
                    break SessionEnd::Stopped;
                }
            },

            _ = ping_timer.tick(), if keepalive => {
                if pong_deadline.is_none() {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        break SessionEnd::WriteError(e.to_string());
                    }
                    pong_deadline = Some(Instant::now() + params.ping_timeout);
                }
            }

            _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                warn!("No pong from {} within {:?}", params.connection_id, params.ping_timeout);
                break SessionEnd::PingTimeout;
            }

            _ = stop.changed() => {
                close_normal(&mut write, &mut read, params.close_timeout).await;
                break SessionEnd::Stopped;
            }
        }
    };

    debug!("Session {} ended: {}", params.connection_id, end.reason());
    end
}

async fn forward(events: &EventSender, connection_id: &str, text: &str) {
    let envelope = decode(text);
    events
        .emit(TransportEvent::Message {
            connection_id: connection_id.to_string(),
            envelope,
        })
        .await;
}

async fn close_normal<S>(
    write: &mut SplitSink<WebSocketStream<S>, Message>,
    read: &mut SplitStream<WebSocketStream<S>>,
    wait: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "shutdown".into(),
    };
    if write.send(Message::Close(Some(frame))).await.is_ok() {
        drain_until_closed(read, wait).await;
    }
}

/// Reads until the peer's close reply arrives or `wait` elapses.
async fn drain_until_closed<S>(read: &mut SplitStream<WebSocketStream<S>>, wait: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let drained = timeout(wait, async {
        while let Some(Ok(message)) = read.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!("Peer did not answer close within {:?}", wait);
    }
}
