// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection identity and handshake credential resolution.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Serialize;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use super::unix_secs;

pub const HEADER_UUID: &str = "x-uuid";
pub const HEADER_API_KEY: &str = "x-apikey";
pub const HEADER_PLATFORM: &str = "x-platform";

const QUERY_API_KEY: &str = "api_key";
const QUERY_PLATFORM: &str = "platform";

/// Platform assumed when a peer does not name one.
pub const DEFAULT_PLATFORM: &str = "default";

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionIdentity {
    /// Generated locally per connection.
    pub connection_uuid: String,
    /// Credential presented during the handshake.
    pub api_key: String,
    pub platform: String,
    /// `x-uuid` supplied by the peer, if any.
    pub client_uuid: Option<String>,
    /// Handshake headers with lowercased names.
    pub headers: HashMap<String, String>,
    pub client_addr: Option<SocketAddr>,
    /// Unix seconds.
    pub connected_at: u64,
    /// Name of the agent connection; `None` on the service side.
    pub connection_name: Option<String>,
}

impl ConnectionIdentity {
    /// Identity used to resolve the logical user of an outgoing message.
    pub fn for_routing(api_key: &str, platform: &str) -> Self {
        Self {
            connection_uuid: String::new(),
            api_key: api_key.to_string(),
            platform: platform.to_string(),
            client_uuid: None,
            headers: HashMap::new(),
            client_addr: None,
            connected_at: unix_secs(),
            connection_name: None,
        }
    }

    /// Id used in transport events: the connection name for agent
    /// connections, the uuid otherwise.
    pub fn connection_id(&self) -> &str {
        self.connection_name
            .as_deref()
            .unwrap_or(&self.connection_uuid)
    }

    /// Name of the sending peer that survives reconnects. Falls back from
    /// the connection name to `x-uuid` to the credentials.
    pub fn peer_key(&self) -> String {
        if let Some(name) = &self.connection_name {
            return name.clone();
        }
        match self.client_uuid.as_deref().filter(|u| !u.is_empty()) {
            Some(uuid) => format!("uuid:{}", uuid),
            None => format!("key:{}/{}", self.api_key, self.platform),
        }
    }
}

/// Credentials extracted from a handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub platform: Option<String>,
    pub client_uuid: Option<String>,
}

/// The parts of an upgrade request the server cares about.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

impl HandshakeRequest {
    pub fn from_request(request: &Request) -> Self {
        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Self {
            path: request.uri().path().to_string(),
            headers,
            query: parse_query(request.uri().query().unwrap_or_default()),
        }
    }

    /// Resolves credentials field by field. When both sources carry a
    /// field, the query wins if `prefer_query` is set.
    pub fn credentials(&self, prefer_query: bool) -> Credentials {
        let pick = |query_key: &str, header_key: &str| {
            let from_query = non_empty(self.query.get(query_key));
            let from_header = non_empty(self.headers.get(header_key));
            if prefer_query {
                from_query.or(from_header)
            } else {
                from_header.or(from_query)
            }
        };
        Credentials {
            api_key: pick(QUERY_API_KEY, HEADER_API_KEY),
            platform: pick(QUERY_PLATFORM, HEADER_PLATFORM),
            client_uuid: non_empty(self.headers.get(HEADER_UUID)),
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> HandshakeRequest {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        HandshakeRequest::from_request(&builder.body(()).unwrap())
    }

    #[test]
    fn test_peer_key_prefers_stable_names() {
        let mut identity = ConnectionIdentity::for_routing("k1", "qq");
        identity.connection_uuid = "c1".into();
        assert_eq!(identity.peer_key(), "key:k1/qq");
        identity.client_uuid = Some("u-1".into());
        assert_eq!(identity.peer_key(), "uuid:u-1");
        identity.connection_name = Some("default".into());
        assert_eq!(identity.peer_key(), "default");
    }

    #[test]
    fn test_query_wins_over_header() {
        let req = request(
            "ws://hub/ws?api_key=K1&platform=P1",
            &[("X-Apikey", "K2")],
        );
        let creds = req.credentials(true);
        assert_eq!(creds.api_key.as_deref(), Some("K1"));
        assert_eq!(creds.platform.as_deref(), Some("P1"));
    }

    #[test]
    fn test_header_precedence_when_configured() {
        let req = request("ws://hub/ws?api_key=K1", &[("x-apikey", "K2")]);
        assert_eq!(req.credentials(false).api_key.as_deref(), Some("K2"));
    }

    #[test]
    fn test_fields_fall_back_independently() {
        let req = request(
            "ws://hub/ws?api_key=K1",
            &[("x-platform", "discord"), ("x-uuid", "c-1")],
        );
        let creds = req.credentials(true);
        assert_eq!(creds.api_key.as_deref(), Some("K1"));
        assert_eq!(creds.platform.as_deref(), Some("discord"));
        assert_eq!(creds.client_uuid.as_deref(), Some("c-1"));
    }

    #[test]
    fn test_missing_and_blank_credentials() {
        let req = request("ws://hub/ws?api_key=", &[("x-apikey", "  ")]);
        assert_eq!(req.credentials(true), Credentials::default());
    }

    #[test]
    fn test_query_is_percent_decoded() {
        let req = request("ws://hub/ws?api_key=a%2Bb&platform=my+chat", &[]);
        let creds = req.credentials(true);
        assert_eq!(creds.api_key.as_deref(), Some("a+b"));
        assert_eq!(creds.platform.as_deref(), Some("my chat"));
        assert_eq!(req.path, "/ws");
    }

    #[test]
    fn test_connection_id_prefers_name() {
        let mut identity = ConnectionIdentity::for_routing("k", "qq");
        identity.connection_uuid = "uuid-1".into();
        assert_eq!(identity.connection_id(), "uuid-1");
        identity.connection_name = Some("default".into());
        assert_eq!(identity.connection_id(), "default");
    }
}
