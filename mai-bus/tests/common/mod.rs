// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common Test Utilities
//!
//! Loopback fixtures for services, agents and raw WebSocket peers.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mai_bus::{
    AgentOptions, CacheConfig, ConnectionConfig, DispatchConfig, ReconnectConfig, ServiceConfig,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_dispatch() -> DispatchConfig {
    DispatchConfig {
        poll_timeout: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Service on an ephemeral loopback port.
pub fn service_config() -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        close_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(2),
        dispatch: fast_dispatch(),
        ..Default::default()
    }
}

pub fn agent_options() -> AgentOptions {
    AgentOptions {
        message_cache: CacheConfig::default(),
        dispatch: fast_dispatch(),
    }
}

pub fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}/ws", addr)
}

pub fn connection_config(addr: SocketAddr, api_key: &str, platform: &str) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(ws_url(addr), api_key, platform);
    config.connect_timeout = Duration::from_secs(2);
    config.close_timeout = Duration::from_secs(1);
    config.reconnect = ReconnectConfig {
        max_attempts: 3,
        delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
    };
    config
}

/// Polls `check` until it returns true or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Dials with arbitrary query and headers, bypassing the agent.
pub async fn raw_connect(
    addr: SocketAddr,
    path_and_query: &str,
    headers: &[(&'static str, &str)],
) -> Result<RawSocket, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{}{}", addr, path_and_query).into_client_request()?;
    for (name, value) in headers {
        request
            .headers_mut()
            .insert(*name, HeaderValue::from_str(value).expect("header value"));
    }
    let (socket, _) = connect_async(request).await?;
    Ok(socket)
}

/// Next text frame, skipping control frames.
pub async fn next_text(socket: &mut RawSocket) -> Option<String> {
    let read = async {
        while let Some(Ok(message)) = socket.next().await {
            match message {
                Message::Text(text) => return Some(text),
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    };
    tokio::time::timeout(WAIT, read).await.ok().flatten()
}

/// Reason of the close frame sent by the peer.
pub async fn close_reason(socket: &mut RawSocket) -> Option<String> {
    let read = async {
        while let Some(Ok(message)) = socket.next().await {
            if let Message::Close(frame) = message {
                return frame.map(|f| f.reason.into_owned());
            }
        }
        None
    };
    tokio::time::timeout(WAIT, read).await.ok().flatten()
}

pub async fn send_text(socket: &mut RawSocket, text: &str) {
    socket
        .send(Message::Text(text.to_string()))
        .await
        .expect("send frame");
}
