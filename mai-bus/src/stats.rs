// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-lifetime counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A relaxed atomic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrements without wrapping below zero.
    pub fn decr(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! define_stats {
    ($($(#[$doc:meta])* $name:ident,)+) => {
        /// Live counters shared between transport tasks and the dispatcher.
        #[derive(Debug, Default)]
        pub struct Stats {
            $($(#[$doc])* pub $name: Counter,)+
        }

        /// Point-in-time copy of [`Stats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)+
        }

        impl Stats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.get(),)+
                }
            }
        }
    };
}

define_stats! {
    /// Connections that completed the WebSocket handshake.
    connections_total,
    /// Currently open connections.
    connections_active,
    /// Connections rejected by credentials or the authenticate hook.
    auth_failures,
    messages_received,
    messages_sent,
    send_failures,
    acks_sent,
    acks_received,
    duplicate_messages_ignored,
    /// Envelopes that fell through to the unhandled path.
    unhandled_messages,
    messages_cached,
    cache_retries,
    cache_evictions,
    cache_expired,
    /// Handler tasks that returned an error or panicked.
    handler_errors,
    reconnect_attempts,
    /// Transport events dropped because the dispatcher queue stayed full.
    dropped_events,
}
