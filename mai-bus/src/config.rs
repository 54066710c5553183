// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Configuration
//!
//! Every option has a default. Durations are (fractional) seconds when
//! serialized, so a config file reads `ping_interval = 20.0`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// TLS settings for the service endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM certificate chain.
    pub cert: Option<PathBuf>,
    /// PEM private key.
    pub key: Option<PathBuf>,
    /// PEM CA bundle used to verify client certificates.
    pub ca: Option<PathBuf>,
    /// Require and verify client certificates against `ca`.
    pub verify: bool,
}

/// Reconnect policy for dialing connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts per outage; 0 retries forever.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    /// Upper bound for the doubled delay.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based): `min(delay * 2^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Whether `attempt` (1-based) is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

/// Sender-side message cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Age after which an unacknowledged message is dropped.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Maximum number of cached messages; the oldest is evicted beyond it.
    pub max_size: usize,
    /// Interval of the expiry sweep.
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_size: 1000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Capacity of the transport event queue.
    pub queue_capacity: usize,
    /// How long a transport task waits for queue space before dropping an event.
    #[serde(with = "duration_secs")]
    pub enqueue_timeout: Duration,
    /// Idle wake-up period of the dispatch loop.
    #[serde(with = "duration_secs")]
    pub poll_timeout: Duration,
    /// Window in which a repeated msg_id is suppressed.
    #[serde(with = "duration_secs")]
    pub dedup_ttl: Duration,
    /// Interval of the stats callback.
    #[serde(with = "duration_secs")]
    pub stats_interval: Duration,
    /// Bounded wait for outstanding handler tasks on shutdown.
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
            dedup_ttl: Duration::from_secs(300),
            stats_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Service endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// The only path on which upgrades are accepted.
    pub path: String,
    pub tls: TlsConfig,
    /// Largest accepted frame in bytes.
    pub max_message_size: usize,
    /// Keepalive ping period; zero disables keepalive.
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,
    #[serde(with = "duration_secs")]
    pub ping_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub close_timeout: Duration,
    /// Query parameters win over headers when both carry credentials.
    pub prefer_query_credentials: bool,
    pub message_cache: CacheConfig,
    pub dispatch: DispatchConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 18000,
            path: "/ws".to_string(),
            tls: TlsConfig::default(),
            max_message_size: 100 * 1024 * 1024,
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            prefer_query_credentials: true,
            message_cache: CacheConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One outgoing connection of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// `ws://` or `wss://` URL including the path.
    pub url: String,
    pub api_key: String,
    pub platform: String,
    /// Extra handshake headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_ping", with = "duration_secs")]
    pub ping_interval: Duration,
    #[serde(default = "default_ping", with = "duration_secs")]
    pub ping_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(default = "default_close_timeout", with = "duration_secs")]
    pub close_timeout: Duration,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_max_message_size() -> usize {
    100 * 1024 * 1024
}

fn default_ping() -> Duration {
    Duration::from_secs(20)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(5)
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            platform: platform.into(),
            headers: HashMap::new(),
            max_message_size: default_max_message_size(),
            ping_interval: default_ping(),
            ping_timeout: default_ping(),
            connect_timeout: default_connect_timeout(),
            close_timeout: default_close_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Agent-side reliability and dispatch settings shared by all connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    pub message_cache: CacheConfig,
    pub dispatch: DispatchConfig,
}

/// Serde adapter storing a `Duration` as fractional seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            D::Error::custom(format!("invalid duration: {} seconds", secs))
        })
    }
}
