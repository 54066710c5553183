// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Receiver-side duplicate suppression.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Remembers recently seen msg_ids for a fixed window.
///
/// Ids are scoped by sender: peers choose their own msg_ids, so the same
/// id from two senders names two different messages.
#[derive(Debug)]
pub struct DedupTable {
    ttl: Duration,
    seen: HashMap<(String, String), Instant>,
}

impl DedupTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
        }
    }

    /// Records `msg_id` from `sender`; returns `true` on its first sighting
    /// within the window.
    pub fn observe(&mut self, sender: &str, msg_id: &str) -> bool {
        self.observe_at(sender, msg_id, Instant::now())
    }

    pub fn observe_at(&mut self, sender: &str, msg_id: &str, now: Instant) -> bool {
        // Ids are optional on the wire; anonymous envelopes are never suppressed.
        if msg_id.is_empty() {
            return true;
        }
        let key = (sender.to_string(), msg_id.to_string());
        match self.seen.get(&key) {
            Some(first) if now.saturating_duration_since(*first) < self.ttl => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    /// Forgets ids older than the window; returns how many were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.seen.len();
        self.seen
            .retain(|_, first| now.saturating_duration_since(*first) < ttl);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
