// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Property tests for the message cache bound and eviction order.

use std::time::{Duration, Instant};

use mai_bus::reliability::{CacheTarget, InsertOutcome, MessageCache};
use mai_bus::{CacheConfig, Envelope};
use proptest::prelude::*;
use serde_json::json;

fn config(max_size: usize) -> CacheConfig {
    CacheConfig {
        enabled: true,
        ttl: Duration::from_secs(300),
        max_size,
        ..Default::default()
    }
}

fn envelope(id: usize) -> Envelope {
    Envelope::custom("note", json!({ "n": id }))
        .unwrap()
        .with_id(format!("m{}", id))
}

proptest! {
    #[test]
    fn size_never_exceeds_bound(
        max_size in 1usize..16,
        offsets in prop::collection::vec(0u64..1000, 0..64),
    ) {
        let base = Instant::now();
        let mut cache = MessageCache::new(config(max_size));
        for (i, offset) in offsets.iter().enumerate() {
            let now = base + Duration::from_millis(*offset);
            cache.insert_at(envelope(i), None, now);
            prop_assert!(cache.len() <= max_size);
        }
        prop_assert_eq!(cache.len(), offsets.len().min(max_size));
    }

    #[test]
    fn eviction_takes_the_oldest_entry(
        max_size in 1usize..8,
        offsets in prop::collection::vec(0u64..50, 1..32),
    ) {
        let base = Instant::now();
        let mut cache = MessageCache::new(config(max_size));
        // (id, created_at, insertion order) of live entries
        let mut live: Vec<(String, Instant, usize)> = Vec::new();

        for (i, offset) in offsets.iter().enumerate() {
            let now = base + Duration::from_millis(*offset);
            let expected_victim = if live.len() >= max_size {
                live.iter()
                    .min_by_key(|(_, created, order)| (*created, *order))
                    .map(|(id, _, _)| id.clone())
            } else {
                None
            };

            match cache.insert_at(envelope(i), None, now) {
                InsertOutcome::Evicted(old) => {
                    prop_assert_eq!(Some(old.message_id.clone()), expected_victim);
                    live.retain(|(id, _, _)| *id != old.message_id);
                }
                InsertOutcome::Stored => prop_assert!(expected_victim.is_none()),
                other => prop_assert!(false, "unexpected outcome {:?}", other),
            }
            live.push((format!("m{}", i), now, i));
        }
    }
}

#[test]
fn test_full_cache_evicts_earliest() {
    let base = Instant::now();
    let mut cache = MessageCache::new(config(2));
    cache.insert_at(envelope(1), None, base);
    cache.insert_at(envelope(2), None, base + Duration::from_secs(1));

    let outcome = cache.insert_at(envelope(3), None, base + Duration::from_secs(2));
    assert!(matches!(outcome, InsertOutcome::Evicted(old) if old.message_id == "m1"));
    assert_eq!(cache.len(), 2);
    assert!(!cache.contains("m1"));
    assert!(cache.contains("m2"));
    assert!(cache.contains("m3"));
}

#[test]
fn test_replay_only_matches_target() {
    let mut cache = MessageCache::new(config(10));
    let alice = CacheTarget::Route {
        user_id: "alice".into(),
        platform: "qq".into(),
    };
    let bob = CacheTarget::Connection("bob".into());
    cache.insert(envelope(1), Some(alice.clone()));
    cache.insert(envelope(2), Some(bob.clone()));
    cache.insert(envelope(3), None);

    let ids: Vec<_> = cache
        .take_for_replay(&alice)
        .into_iter()
        .map(|e| e.msg_id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"m1".to_string()));
    assert!(ids.contains(&"m3".to_string()));
    assert_eq!(cache.get("m1").map(|e| e.retry_count), Some(1));
    assert_eq!(cache.get("m2").map(|e| e.retry_count), Some(0));
}
