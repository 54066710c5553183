// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hub Configuration
//!
//! Read from `MAIBUS_*` environment variables. Unset or unparsable values
//! keep their defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mai_bus::ServiceConfig;
use tracing::warn;

/// Port of the health/metrics endpoint unless overridden.
pub const DEFAULT_HTTP_PORT: u16 = 8081;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub service: ServiceConfig,
    pub http_port: u16,
    /// api key -> logical user. Empty accepts every key.
    pub api_keys: HashMap<String, String>,
    /// Bearer token required on `/metrics`.
    pub metrics_token: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            http_port: DEFAULT_HTTP_PORT,
            api_keys: HashMap::new(),
            metrics_token: None,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let service = &mut config.service;

        if let Some(host) = lookup("MAIBUS_HOST") {
            service.host = host;
        }
        parse_into(&lookup, "MAIBUS_PORT", &mut service.port);
        if let Some(path) = lookup("MAIBUS_PATH") {
            service.path = if path.starts_with('/') {
                path
            } else {
                format!("/{}", path)
            };
        }
        parse_into(&lookup, "MAIBUS_MAX_MESSAGE_SIZE", &mut service.max_message_size);
        parse_into(&lookup, "MAIBUS_CACHE_MAX_SIZE", &mut service.message_cache.max_size);
        let mut ttl_secs = service.message_cache.ttl.as_secs();
        parse_into(&lookup, "MAIBUS_CACHE_TTL_SECS", &mut ttl_secs);
        service.message_cache.ttl = Duration::from_secs(ttl_secs);

        let cert = lookup("MAIBUS_TLS_CERT").map(PathBuf::from);
        let key = lookup("MAIBUS_TLS_KEY").map(PathBuf::from);
        if cert.is_some() && key.is_some() {
            service.tls.enabled = true;
            service.tls.cert = cert;
            service.tls.key = key;
            service.tls.ca = lookup("MAIBUS_TLS_CA").map(PathBuf::from);
            service.tls.verify = service.tls.ca.is_some();
        } else if cert.is_some() || key.is_some() {
            warn!("MAIBUS_TLS_CERT and MAIBUS_TLS_KEY must be set together; TLS disabled");
        }

        parse_into(&lookup, "MAIBUS_HTTP_PORT", &mut config.http_port);
        if let Some(raw) = lookup("MAIBUS_API_KEYS") {
            config.api_keys = parse_api_keys(&raw);
        }
        config.metrics_token = lookup("MAIBUS_METRICS_TOKEN").filter(|t| !t.is_empty());
        config
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.service.host, self.http_port)
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, target: &mut T) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!("Ignoring invalid {}={:?}", name, raw),
    }
}

/// Parses `key=user,key2=user2`. A bare `key` maps to itself.
pub fn parse_api_keys(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (key, user) = entry.split_once('=').unwrap_or((entry, entry));
            let (key, user) = (key.trim(), user.trim());
            if key.is_empty() || user.is_empty() {
                warn!("Ignoring malformed api key entry {:?}", entry);
                return None;
            }
            Some((key.to_string(), user.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults_without_env() {
        let config = HubConfig::from_lookup(|_| None);
        assert_eq!(config.service, ServiceConfig::default());
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert!(config.api_keys.is_empty());
        assert!(config.metrics_token.is_none());
        assert_eq!(config.http_addr(), "0.0.0.0:8081");
    }

    #[test]
    fn test_reads_service_settings() {
        let vars = [
            ("MAIBUS_HOST", "127.0.0.1"),
            ("MAIBUS_PORT", "19000"),
            ("MAIBUS_PATH", "bus"),
            ("MAIBUS_HTTP_PORT", "9100"),
            ("MAIBUS_MAX_MESSAGE_SIZE", "2048"),
            ("MAIBUS_CACHE_TTL_SECS", "30"),
            ("MAIBUS_CACHE_MAX_SIZE", "10"),
            ("MAIBUS_METRICS_TOKEN", "s3cret"),
        ];
        let config = HubConfig::from_lookup(lookup(&vars));
        assert_eq!(config.service.bind_addr(), "127.0.0.1:19000");
        assert_eq!(config.service.path, "/bus");
        assert_eq!(config.service.max_message_size, 2048);
        assert_eq!(config.service.message_cache.ttl, Duration::from_secs(30));
        assert_eq!(config.service.message_cache.max_size, 10);
        assert_eq!(config.http_addr(), "127.0.0.1:9100");
        assert_eq!(config.metrics_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_invalid_numbers_keep_defaults() {
        let vars = [("MAIBUS_PORT", "eighty"), ("MAIBUS_HTTP_PORT", "-1")];
        let config = HubConfig::from_lookup(lookup(&vars));
        assert_eq!(config.service.port, 18000);
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
    }

    #[test]
    fn test_tls_needs_cert_and_key() {
        let partial = HubConfig::from_lookup(lookup(&[("MAIBUS_TLS_CERT", "/tmp/cert.pem")]));
        assert!(!partial.service.tls.enabled);

        let vars = [
            ("MAIBUS_TLS_CERT", "/tmp/cert.pem"),
            ("MAIBUS_TLS_KEY", "/tmp/key.pem"),
            ("MAIBUS_TLS_CA", "/tmp/ca.pem"),
        ];
        let config = HubConfig::from_lookup(lookup(&vars));
        assert!(config.service.tls.enabled);
        assert!(config.service.tls.verify);
        assert_eq!(config.service.tls.key, Some(PathBuf::from("/tmp/key.pem")));
    }

    #[test]
    fn test_parse_api_keys() {
        let keys = parse_api_keys(" k1=alice, k2 = bob ,solo,,=nobody,k3=");
        assert_eq!(keys.len(), 3);
        assert_eq!(keys["k1"], "alice");
        assert_eq!(keys["k2"], "bob");
        assert_eq!(keys["solo"], "solo");
    }
}
