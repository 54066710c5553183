// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Api-key table used as the service's authentication hooks.

use std::collections::HashMap;
use std::sync::Arc;

use mai_bus::service::HookError;
use mai_bus::{ConnectionIdentity, ServiceHooks};

/// Maps api keys to logical users. An empty table accepts every key and
/// uses the key itself as the user id.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyTable {
    keys: Arc<HashMap<String, String>>,
}

impl ApiKeyTable {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self {
            keys: Arc::new(keys),
        }
    }

    pub fn is_open(&self) -> bool {
        self.keys.is_empty()
    }

    /// Logical user of `api_key`, if it is allowed.
    pub fn user_for(&self, api_key: &str) -> Option<String> {
        if self.is_open() {
            return Some(api_key.to_string());
        }
        self.keys.get(api_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl ServiceHooks for ApiKeyTable {
    fn authenticate(&self, identity: &ConnectionIdentity) -> Result<bool, HookError> {
        Ok(self.user_for(&identity.api_key).is_some())
    }

    fn extract_logical_id(&self, identity: &ConnectionIdentity) -> Result<String, HookError> {
        self.user_for(&identity.api_key)
            .ok_or_else(|| format!("unknown api key on {}", identity.platform).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(api_key: &str) -> ConnectionIdentity {
        ConnectionIdentity::for_routing(api_key, "qq")
    }

    #[test]
    fn test_open_table_accepts_everyone() {
        let table = ApiKeyTable::default();
        assert!(table.is_open());
        assert!(table.authenticate(&identity("anything")).unwrap());
        assert_eq!(table.extract_logical_id(&identity("anything")).unwrap(), "anything");
    }

    #[test]
    fn test_known_keys_map_to_users() {
        let table = ApiKeyTable::new(HashMap::from([
            ("k1".to_string(), "alice".to_string()),
            ("k2".to_string(), "alice".to_string()),
        ]));
        assert!(table.authenticate(&identity("k1")).unwrap());
        assert_eq!(table.extract_logical_id(&identity("k2")).unwrap(), "alice");

        assert!(!table.authenticate(&identity("k3")).unwrap());
        assert!(table.extract_logical_id(&identity("k3")).is_err());
    }
}
