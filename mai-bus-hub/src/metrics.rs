// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics
//!
//! The bus keeps its own atomic counters; these collectors mirror a
//! [`StatsSnapshot`] each time metrics are scraped.

use mai_bus::StatsSnapshot;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::warn;

#[derive(Clone)]
pub struct HubMetrics {
    registry: Registry,
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub connections_registered: IntGauge,
    pub auth_failures: IntCounter,
    pub messages_received: IntCounter,
    pub messages_sent: IntCounter,
    pub send_failures: IntCounter,
    pub duplicate_messages: IntCounter,
    pub unhandled_messages: IntCounter,
    pub messages_cached: IntCounter,
    pub cache_evictions: IntCounter,
    pub cache_expired: IntCounter,
    pub handler_errors: IntCounter,
    pub dropped_events: IntCounter,
    /// Messages forwarded to another user by the relay.
    pub messages_relayed: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Raises `counter` to `value`; counters never go backwards.
fn mirror(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl HubMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            connections_total: counter(
                &registry,
                "maibus_connections_total",
                "WebSocket connections accepted",
            )?,
            connections_active: gauge(
                &registry,
                "maibus_connections_active",
                "Currently open WebSocket connections",
            )?,
            connections_registered: gauge(
                &registry,
                "maibus_connections_registered",
                "Authenticated connections in the routing table",
            )?,
            auth_failures: counter(
                &registry,
                "maibus_auth_failures_total",
                "Connections rejected during authentication",
            )?,
            messages_received: counter(
                &registry,
                "maibus_messages_received_total",
                "Envelopes received",
            )?,
            messages_sent: counter(&registry, "maibus_messages_sent_total", "Envelopes sent")?,
            send_failures: counter(
                &registry,
                "maibus_send_failures_total",
                "Envelopes that could not be written",
            )?,
            duplicate_messages: counter(
                &registry,
                "maibus_duplicate_messages_total",
                "Repeated msg_ids suppressed",
            )?,
            unhandled_messages: counter(
                &registry,
                "maibus_unhandled_messages_total",
                "Envelopes without a handler",
            )?,
            messages_cached: counter(
                &registry,
                "maibus_messages_cached_total",
                "Envelopes cached for later delivery",
            )?,
            cache_evictions: counter(
                &registry,
                "maibus_cache_evictions_total",
                "Cached envelopes evicted by the size bound",
            )?,
            cache_expired: counter(
                &registry,
                "maibus_cache_expired_total",
                "Cached envelopes dropped after their TTL",
            )?,
            handler_errors: counter(
                &registry,
                "maibus_handler_errors_total",
                "Handler invocations that failed",
            )?,
            dropped_events: counter(
                &registry,
                "maibus_dropped_events_total",
                "Transport events dropped on a full queue",
            )?,
            messages_relayed: counter(
                &registry,
                "maibus_messages_relayed_total",
                "Messages forwarded between users",
            )?,
            registry,
        })
    }

    /// Copies counters out of a bus stats snapshot.
    pub fn observe(&self, stats: &StatsSnapshot, registered: usize) {
        mirror(&self.connections_total, stats.connections_total);
        self.connections_active
            .set(i64::try_from(stats.connections_active).unwrap_or(i64::MAX));
        self.connections_registered
            .set(i64::try_from(registered).unwrap_or(i64::MAX));
        mirror(&self.auth_failures, stats.auth_failures);
        mirror(&self.messages_received, stats.messages_received);
        mirror(&self.messages_sent, stats.messages_sent);
        mirror(&self.send_failures, stats.send_failures);
        mirror(&self.duplicate_messages, stats.duplicate_messages_ignored);
        mirror(&self.unhandled_messages, stats.unhandled_messages);
        mirror(&self.messages_cached, stats.messages_cached);
        mirror(&self.cache_evictions, stats.cache_evictions);
        mirror(&self.cache_expired, stats.cache_expired);
        mirror(&self.handler_errors, stats.handler_errors);
        mirror(&self.dropped_events, stats.dropped_events);
    }

    /// Text exposition format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_mirrors_snapshot() {
        let metrics = HubMetrics::new().unwrap();
        let stats = StatsSnapshot {
            connections_total: 5,
            connections_active: 2,
            messages_received: 40,
            ..Default::default()
        };
        metrics.observe(&stats, 1);
        assert_eq!(metrics.connections_total.get(), 5);
        assert_eq!(metrics.connections_active.get(), 2);
        assert_eq!(metrics.connections_registered.get(), 1);
        assert_eq!(metrics.messages_received.get(), 40);

        // Repeated or stale snapshots never decrease a counter.
        metrics.observe(&StatsSnapshot::default(), 0);
        assert_eq!(metrics.connections_total.get(), 5);
        assert_eq!(metrics.connections_active.get(), 0);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        let metrics = HubMetrics::new().unwrap();
        metrics.messages_relayed.inc();
        let text = metrics.encode();
        assert!(text.contains("maibus_messages_relayed_total 1"));
        assert!(text.contains("maibus_connections_active"));
    }
}
