// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sender-side cache of undelivered envelopes.

use std::collections::HashMap;
use std::time::Instant;

use crate::config::CacheConfig;
use crate::protocol::Envelope;

/// Where a cached envelope should be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheTarget {
    /// A named agent connection.
    Connection(String),
    /// Any service connection of `user_id` on `platform`.
    Route { user_id: String, platform: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Never retransmitted.
    Pending,
    /// Replayed at least once, still awaiting an ack.
    Retrying,
    /// Acknowledged by the receiver; only seen on removed entries.
    Acked,
}

/// An envelope awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub message_id: String,
    pub envelope: Envelope,
    /// `None` matches any target on replay.
    pub target: Option<CacheTarget>,
    pub created_at: Instant,
    pub retry_count: u32,
    pub status: CacheStatus,
    seq: u64,
}

impl CachedMessage {
    fn matches(&self, target: &CacheTarget) -> bool {
        self.target.as_ref().map_or(true, |t| t == target)
    }
}

/// Result of [`MessageCache::insert`].
#[derive(Debug)]
pub enum InsertOutcome {
    Stored,
    /// The msg_id was already cached; its age is kept.
    AlreadyCached,
    /// Stored after evicting the oldest entry.
    Evicted(Box<CachedMessage>),
    /// Caching is switched off.
    Disabled,
}

/// Bounded map of undelivered envelopes keyed by msg_id.
#[derive(Debug)]
pub struct MessageCache {
    config: CacheConfig,
    entries: HashMap<String, CachedMessage>,
    next_seq: u64,
}

impl MessageCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.max_size > 0
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn insert(&mut self, envelope: Envelope, target: Option<CacheTarget>) -> InsertOutcome {
        self.insert_at(envelope, target, Instant::now())
    }

    /// Inserts with an explicit creation time.
    pub fn insert_at(
        &mut self,
        envelope: Envelope,
        target: Option<CacheTarget>,
        now: Instant,
    ) -> InsertOutcome {
        if !self.is_enabled() {
            return InsertOutcome::Disabled;
        }
        if let Some(existing) = self.entries.get_mut(&envelope.msg_id) {
            existing.target = target;
            return InsertOutcome::AlreadyCached;
        }

        let evicted = if self.entries.len() >= self.config.max_size {
            self.oldest_id()
                .and_then(|id| self.entries.remove(&id))
                .map(Box::new)
        } else {
            None
        };

        self.next_seq += 1;
        let entry = CachedMessage {
            message_id: envelope.msg_id.clone(),
            envelope,
            target,
            created_at: now,
            retry_count: 0,
            status: CacheStatus::Pending,
            seq: self.next_seq,
        };
        self.entries.insert(entry.message_id.clone(), entry);

        match evicted {
            Some(old) => InsertOutcome::Evicted(old),
            None => InsertOutcome::Stored,
        }
    }

    fn oldest_id(&self) -> Option<String> {
        self.entries
            .values()
            .min_by_key(|e| (e.created_at, e.seq))
            .map(|e| e.message_id.clone())
    }

    /// Removes an acknowledged entry and returns it marked [`CacheStatus::Acked`].
    pub fn acknowledge(&mut self, msg_id: &str) -> Option<CachedMessage> {
        let mut entry = self.entries.remove(msg_id)?;
        entry.status = CacheStatus::Acked;
        Some(entry)
    }

    /// Envelopes to retransmit to `target`, oldest first.
    ///
    /// Matching entries stay cached until acknowledged or expired; each is
    /// marked retrying and its retry count bumped.
    pub fn take_for_replay(&mut self, target: &CacheTarget) -> Vec<Envelope> {
        let mut matching: Vec<&mut CachedMessage> = self
            .entries
            .values_mut()
            .filter(|e| e.matches(target))
            .collect();
        matching.sort_by_key(|e| (e.created_at, e.seq));
        matching
            .into_iter()
            .map(|entry| {
                entry.status = CacheStatus::Retrying;
                entry.retry_count += 1;
                entry.envelope.clone()
            })
            .collect()
    }

    /// Drops entries older than the TTL; returns how many were removed.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.created_at) < ttl);
        before - self.entries.len()
    }

    pub fn get(&self, msg_id: &str) -> Option<&CachedMessage> {
        self.entries.get(msg_id)
    }

    pub fn contains(&self, msg_id: &str) -> bool {
        self.entries.contains_key(msg_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn cache(max_size: usize, ttl: Duration) -> MessageCache {
        MessageCache::new(CacheConfig {
            max_size,
            ttl,
            ..Default::default()
        })
    }

    fn envelope(id: &str) -> Envelope {
        Envelope::custom("note", json!({"n": id})).unwrap().with_id(id)
    }

    fn agent_target() -> Option<CacheTarget> {
        Some(CacheTarget::Connection("default".into()))
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = cache(2, Duration::from_secs(3600));
        let t0 = Instant::now();
        cache.insert_at(envelope("m1"), agent_target(), t0);
        cache.insert_at(envelope("m2"), agent_target(), t0 + Duration::from_millis(1));
        let outcome = cache.insert_at(envelope("m3"), agent_target(), t0 + Duration::from_millis(2));

        match outcome {
            InsertOutcome::Evicted(old) => assert_eq!(old.message_id, "m1"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("m2"));
        assert!(cache.contains("m3"));
    }

    #[test]
    fn test_equal_timestamps_evict_first_inserted() {
        let mut cache = cache(2, Duration::from_secs(3600));
        let t0 = Instant::now();
        cache.insert_at(envelope("a"), None, t0);
        cache.insert_at(envelope("b"), None, t0);
        cache.insert_at(envelope("c"), None, t0);
        assert!(!cache.contains("a"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_reinsert_keeps_single_entry() {
        let mut cache = cache(2, Duration::from_secs(3600));
        cache.insert(envelope("m1"), agent_target());
        assert!(matches!(
            cache.insert(envelope("m1"), agent_target()),
            InsertOutcome::AlreadyCached
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ack_removes_entry() {
        let mut cache = cache(10, Duration::from_secs(3600));
        cache.insert(envelope("m1"), agent_target());
        let removed = cache.acknowledge("m1").unwrap();
        assert_eq!(removed.status, CacheStatus::Acked);
        assert!(cache.is_empty());
        assert!(cache.acknowledge("m1").is_none());
    }

    #[test]
    fn test_ttl_sweep() {
        let mut cache = cache(10, Duration::from_secs(60));
        let t0 = Instant::now();
        cache.insert_at(envelope("old"), None, t0);
        cache.insert_at(envelope("new"), None, t0 + Duration::from_secs(50));

        assert_eq!(cache.sweep_expired(t0 + Duration::from_secs(61)), 1);
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));
        let replay = cache.take_for_replay(&CacheTarget::Connection("any".into()));
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].msg_id, "new");
    }

    #[test]
    fn test_replay_filters_and_orders() {
        let mut cache = cache(10, Duration::from_secs(3600));
        let route = CacheTarget::Route {
            user_id: "u1".into(),
            platform: "qq".into(),
        };
        let other = CacheTarget::Route {
            user_id: "u2".into(),
            platform: "qq".into(),
        };
        let t0 = Instant::now();
        cache.insert_at(envelope("second"), Some(route.clone()), t0 + Duration::from_millis(5));
        cache.insert_at(envelope("first"), Some(route.clone()), t0);
        cache.insert_at(envelope("foreign"), Some(other), t0);
        cache.insert_at(envelope("wildcard"), None, t0 + Duration::from_millis(9));

        let ids: Vec<_> = cache
            .take_for_replay(&route)
            .into_iter()
            .map(|e| e.msg_id)
            .collect();
        assert_eq!(ids, vec!["first", "second", "wildcard"]);

        let entry = cache.get("first").unwrap();
        assert_eq!(entry.status, CacheStatus::Retrying);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(cache.get("foreign").unwrap().status, CacheStatus::Pending);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let mut cache = MessageCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(matches!(
            cache.insert(envelope("m1"), None),
            InsertOutcome::Disabled
        ));
        assert!(cache.is_empty());
    }
}
