// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Handler registry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};

use crate::protocol::{custom_name, Envelope, ProtocolError, StandardMessage};
use crate::stats::StatsSnapshot;
use crate::transport::ConnectionIdentity;

/// Error type returned by business handlers and hooks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Where a message came from.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Connection uuid (service) or connection name (agent).
    pub connection_id: String,
    /// Logical user; only known on the service side.
    pub user_id: Option<String>,
    pub identity: ConnectionIdentity,
    pub msg_id: String,
    pub meta: Map<String, Value>,
}

/// Payload of a `custom_<name>` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMessage {
    /// Type name without the `custom_` prefix.
    pub name: String,
    pub payload: Value,
}

/// Why an envelope reached the unhandled path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnhandledReason {
    /// Frame could not be parsed.
    Malformed(String),
    /// Type string is not part of the protocol.
    UnknownType(String),
    /// `sys_std` payload is not a valid standard message.
    InvalidPayload(String),
    /// No handler (and no default) for this type.
    NoHandler(String),
}

impl fmt::Display for UnhandledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhandledReason::Malformed(e) => write!(f, "malformed frame: {}", e),
            UnhandledReason::UnknownType(t) => write!(f, "unknown type {}", t),
            UnhandledReason::InvalidPayload(e) => write!(f, "invalid payload: {}", e),
            UnhandledReason::NoHandler(t) => write!(f, "no handler for {}", t),
        }
    }
}

pub type StandardHandler =
    Arc<dyn Fn(StandardMessage, MessageContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub type CustomHandler =
    Arc<dyn Fn(CustomMessage, MessageContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub type UnhandledHandler = Arc<
    dyn Fn(Envelope, UnhandledReason, Option<MessageContext>) -> BoxFuture<'static, HandlerResult>
        + Send
        + Sync,
>;

pub type StatsCallback = Arc<dyn Fn(StatsSnapshot) + Send + Sync>;

/// Business callbacks of one role instance.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    standard: Option<StandardHandler>,
    custom: HashMap<String, CustomHandler>,
    default_custom: Option<CustomHandler>,
    unhandled: Option<UnhandledHandler>,
    stats: Option<StatsCallback>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler for `sys_std` messages.
    pub fn on_message<F, Fut>(&mut self, handler: F)
    where
        F: Fn(StandardMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.standard = Some(Arc::new(move |message, ctx| handler(message, ctx).boxed()));
    }

    /// Handler for `custom_<name>`; the name is normalized first.
    pub fn on_custom<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), ProtocolError>
    where
        F: Fn(CustomMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = custom_name(name)?;
        self.custom
            .insert(name, Arc::new(move |message, ctx| handler(message, ctx).boxed()));
        Ok(())
    }

    /// Fallback for custom types without their own handler.
    pub fn on_default_custom<F, Fut>(&mut self, handler: F)
    where
        F: Fn(CustomMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.default_custom = Some(Arc::new(move |message, ctx| handler(message, ctx).boxed()));
    }

    /// Called for envelopes that no handler accepts.
    pub fn on_unhandled<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Envelope, UnhandledReason, Option<MessageContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.unhandled = Some(Arc::new(move |envelope, reason, ctx| {
            handler(envelope, reason, ctx).boxed()
        }));
    }

    /// Periodic stats callback.
    pub fn on_stats<F>(&mut self, callback: F)
    where
        F: Fn(StatsSnapshot) + Send + Sync + 'static,
    {
        self.stats = Some(Arc::new(callback));
    }

    pub fn standard(&self) -> Option<StandardHandler> {
        self.standard.clone()
    }

    /// The handler for `name`, falling back to the default custom handler.
    pub fn custom(&self, name: &str) -> Option<CustomHandler> {
        self.custom
            .get(name)
            .or(self.default_custom.as_ref())
            .cloned()
    }

    pub fn unhandled(&self) -> Option<UnhandledHandler> {
        self.unhandled.clone()
    }

    pub fn stats_callback(&self) -> Option<StatsCallback> {
        self.stats.clone()
    }

    pub fn custom_types(&self) -> Vec<String> {
        let mut names: Vec<_> = self.custom.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("standard", &self.standard.is_some())
            .field("custom", &self.custom_types())
            .field("default_custom", &self.default_custom.is_some())
            .field("unhandled", &self.unhandled.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_lookup_and_fallback() {
        let mut registry = HandlerRegistry::new();
        registry
            .on_custom("custom_weather", |_m, _c| async { Ok(()) })
            .unwrap();
        assert_eq!(registry.custom_types(), vec!["weather".to_string()]);
        assert!(registry.custom("weather").is_some());
        assert!(registry.custom("news").is_none());

        registry.on_default_custom(|_m, _c| async { Ok(()) });
        assert!(registry.custom("news").is_some());
    }

    #[test]
    fn test_reserved_custom_name_rejected() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.on_custom("sys_ack", |_m, _c| async { Ok(()) }).is_err());
        assert!(registry.custom_types().is_empty());
    }
}
