// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! mai-bus
//!
//! Authenticated, multiplexed, at-least-once messaging over WebSocket
//! between a [`Service`] (accepts many agents) and [`Agent`]s / [`Router`]s
//! (dial one or many named connections).
//!
//! Layers, bottom up:
//!
//! - [`protocol`]: envelope, message types, standard message, codec
//! - [`transport`]: server/client connections, TLS, keepalive, reconnect
//! - [`reliability`]: message cache with replay, dedup table
//! - [`dispatcher`]: single-consumer event loop and handler registry
//! - [`service`] and [`agent`]: the two roles

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod reliability;
pub mod service;
pub mod stats;
pub mod transport;

pub use agent::{Agent, AgentBuilder, AgentError, Router, RouterBuilder, DEFAULT_CONNECTION};
pub use config::{
    AgentOptions, CacheConfig, ConnectionConfig, DispatchConfig, ReconnectConfig, ServiceConfig,
    TlsConfig,
};
pub use dispatcher::{
    CustomMessage, DispatchOutcome, HandlerError, HandlerResult, MessageContext, UnhandledReason,
};
pub use protocol::{Envelope, MessageType, ProtocolError, Segment, StandardMessage};
pub use service::{
    AllowAll, ConnectionInfo, SendResult, SendTarget, Service, ServiceBuilder, ServiceError,
    ServiceHooks,
};
pub use stats::StatsSnapshot;
pub use transport::{ConnectionIdentity, ConnectionState, TransportError};
