// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Routing Table
//!
//! Three-level index `user_id -> platform -> {connection_uuid}` with reverse
//! lookups. Every mutation updates all indices together, and empty buckets
//! are removed so that an absent user means "no connections".

use std::collections::{BTreeSet, HashMap};

use crate::transport::ConnectionIdentity;

#[derive(Debug, Default)]
pub struct RoutingTable {
    by_user: HashMap<String, HashMap<String, BTreeSet<String>>>,
    by_platform: HashMap<String, BTreeSet<String>>,
    user_of: HashMap<String, String>,
    identities: HashMap<String, ConnectionIdentity>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an authenticated connection under `user_id`. A connection
    /// registered twice is moved rather than duplicated.
    pub fn register(&mut self, identity: ConnectionIdentity, user_id: &str) {
        let uuid = identity.connection_uuid.clone();
        if self.identities.contains_key(&uuid) {
            self.unregister(&uuid);
        }
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .entry(identity.platform.clone())
            .or_default()
            .insert(uuid.clone());
        self.by_platform
            .entry(identity.platform.clone())
            .or_default()
            .insert(uuid.clone());
        self.user_of.insert(uuid.clone(), user_id.to_string());
        self.identities.insert(uuid, identity);
    }

    /// Removes a connection from every index and returns its
    /// `(user_id, platform)`.
    pub fn unregister(&mut self, connection_uuid: &str) -> Option<(String, String)> {
        let identity = self.identities.remove(connection_uuid)?;
        let user_id = self.user_of.remove(connection_uuid).unwrap_or_default();
        let platform = identity.platform;

        if let Some(platforms) = self.by_user.get_mut(&user_id) {
            if let Some(connections) = platforms.get_mut(&platform) {
                connections.remove(connection_uuid);
                if connections.is_empty() {
                    platforms.remove(&platform);
                }
            }
            if platforms.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
        if let Some(connections) = self.by_platform.get_mut(&platform) {
            connections.remove(connection_uuid);
            if connections.is_empty() {
                self.by_platform.remove(&platform);
            }
        }
        Some((user_id, platform))
    }

    /// Connections of `user_id` on `platform`.
    pub fn connections_for(&self, user_id: &str, platform: &str) -> Vec<String> {
        self.by_user
            .get(user_id)
            .and_then(|platforms| platforms.get(platform))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Connections of `user_id` on any platform.
    pub fn connections_for_user(&self, user_id: &str) -> Vec<String> {
        let mut all: Vec<String> = self
            .by_user
            .get(user_id)
            .map(|platforms| platforms.values().flatten().cloned().collect())
            .unwrap_or_default();
        all.sort();
        all
    }

    pub fn connections_on_platform(&self, platform: &str) -> Vec<String> {
        self.by_platform
            .get(platform)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_of(&self, connection_uuid: &str) -> Option<&str> {
        self.user_of.get(connection_uuid).map(String::as_str)
    }

    pub fn identity(&self, connection_uuid: &str) -> Option<&ConnectionIdentity> {
        self.identities.get(connection_uuid)
    }

    pub fn contains(&self, connection_uuid: &str) -> bool {
        self.identities.contains_key(connection_uuid)
    }

    /// All registered connections with their user.
    pub fn entries(&self) -> impl Iterator<Item = (&ConnectionIdentity, &str)> {
        self.identities.iter().map(|(uuid, identity)| {
            let user = self.user_of.get(uuid).map(String::as_str).unwrap_or_default();
            (identity, user)
        })
    }

    pub fn connection_count(&self) -> usize {
        self.identities.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    pub fn platform_count(&self) -> usize {
        self.by_platform.len()
    }

    /// Checks that every index agrees with every other and that no empty
    /// bucket is left behind.
    pub fn is_consistent(&self) -> bool {
        let mut indexed = 0;
        for (user, platforms) in &self.by_user {
            if platforms.is_empty() {
                return false;
            }
            for (platform, connections) in platforms {
                if connections.is_empty() {
                    return false;
                }
                for uuid in connections {
                    indexed += 1;
                    let identity_ok = self
                        .identities
                        .get(uuid)
                        .is_some_and(|identity| &identity.platform == platform);
                    let user_ok = self.user_of.get(uuid) == Some(user);
                    let platform_ok = self
                        .by_platform
                        .get(platform)
                        .is_some_and(|set| set.contains(uuid));
                    if !(identity_ok && user_ok && platform_ok) {
                        return false;
                    }
                }
            }
        }
        let platform_total: usize = self.by_platform.values().map(BTreeSet::len).sum();
        let no_empty_platforms = self.by_platform.values().all(|set| !set.is_empty());
        indexed == self.identities.len()
            && indexed == self.user_of.len()
            && indexed == platform_total
            && no_empty_platforms
    }
}
