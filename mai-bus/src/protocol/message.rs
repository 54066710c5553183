// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Standard Message
//!
//! The platform-neutral chat message carried by `sys_std` envelopes.
//! `message_dim` is routing information only: it names the api key and
//! platform the message is addressed to and is never interpreted as content.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::envelope::unix_time;

/// A chat message exchanged between the host and a platform adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardMessage {
    pub message_info: MessageInfo,
    pub message_segment: Segment,
    pub message_dim: MessageDim,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
}

/// Message metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub platform: String,
    pub message_id: String,
    /// Unix seconds.
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_info: Option<ParticipantInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_info: Option<ParticipantInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_info: Option<FormatInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_config: Option<Map<String, Value>>,
}

/// Sender or receiver of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub platform: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_cardname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub platform: String,
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// Segment kinds a peer produces and accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub content_format: Vec<String>,
    #[serde(default)]
    pub accept_format: Vec<String>,
}

impl FormatInfo {
    /// An empty accept list accepts everything.
    pub fn accepts(&self, kind: &str) -> bool {
        self.accept_format.is_empty() || self.accept_format.iter().any(|f| f == kind)
    }
}

/// Routing dimension: which api key and platform the message is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageDim {
    pub api_key: String,
    pub platform: String,
}

/// Message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Segment {
    Text(String),
    /// Base64 encoded image.
    Image(String),
    /// Base64 encoded emoji image.
    Emoji(String),
    Seglist(Vec<Segment>),
}

impl Segment {
    pub fn kind(&self) -> &'static str {
        match self {
            Segment::Text(_) => "text",
            Segment::Image(_) => "image",
            Segment::Emoji(_) => "emoji",
            Segment::Seglist(_) => "seglist",
        }
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            Segment::Text(text) => out.push_str(text),
            Segment::Seglist(items) => items.iter().for_each(|s| s.collect_text(out)),
            Segment::Image(_) | Segment::Emoji(_) => {}
        }
    }
}

impl StandardMessage {
    pub fn new(message_info: MessageInfo, message_segment: Segment, message_dim: MessageDim) -> Self {
        StandardMessage {
            message_info,
            message_segment,
            message_dim,
            raw_message: None,
        }
    }

    /// Plain text message addressed to `api_key` on `platform`.
    pub fn text(platform: &str, api_key: &str, text: impl Into<String>) -> Self {
        StandardMessage::new(
            MessageInfo::new(platform),
            Segment::Text(text.into()),
            MessageDim {
                api_key: api_key.to_string(),
                platform: platform.to_string(),
            },
        )
    }

    /// Concatenated text of all text segments.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.message_segment.collect_text(&mut out);
        out
    }
}

impl MessageInfo {
    /// Fresh message id, current time, no participants.
    pub fn new(platform: &str) -> Self {
        MessageInfo {
            platform: platform.to_string(),
            message_id: Uuid::new_v4().to_string(),
            time: unix_time(),
            sender_info: None,
            receiver_info: None,
            format_info: None,
            additional_config: None,
        }
    }

    pub fn with_sender(mut self, user: UserInfo, group: Option<GroupInfo>) -> Self {
        self.sender_info = Some(ParticipantInfo {
            user_info: Some(user),
            group_info: group,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_segment_wire_shape() {
        let seg = Segment::Seglist(vec![
            Segment::Text("hi".into()),
            Segment::Emoji("AAA=".into()),
        ]);
        assert_eq!(
            serde_json::to_value(&seg).unwrap(),
            json!({"type": "seglist", "data": [
                {"type": "text", "data": "hi"},
                {"type": "emoji", "data": "AAA="}
            ]})
        );
    }

    #[test]
    fn test_plain_text_flattens_seglist() {
        let mut msg = StandardMessage::text("qq", "k1", "ignored");
        msg.message_segment = Segment::Seglist(vec![
            Segment::Text("hello ".into()),
            Segment::Image("xyz".into()),
            Segment::Seglist(vec![Segment::Text("world".into())]),
        ]);
        assert_eq!(msg.plain_text(), "hello world");
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let msg = StandardMessage::text("qq", "k1", "hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("raw_message").is_none());
        assert!(value["message_info"].get("sender_info").is_none());
        assert_eq!(value["message_dim"], json!({"api_key": "k1", "platform": "qq"}));
    }

    #[test]
    fn test_deserialize_with_participants() {
        let value = json!({
            "message_info": {
                "platform": "qq",
                "message_id": "42",
                "time": 1700000000.5,
                "sender_info": {
                    "user_info": {"platform": "qq", "user_id": "u1", "user_nickname": "neo"},
                    "group_info": {"platform": "qq", "group_id": "g1"}
                },
                "format_info": {"content_format": ["text"], "accept_format": ["text", "image"]}
            },
            "message_segment": {"type": "text", "data": "ping"},
            "message_dim": {"api_key": "k1", "platform": "qq"}
        });
        let msg: StandardMessage = serde_json::from_value(value).unwrap();
        let sender = msg.message_info.sender_info.as_ref().unwrap();
        assert_eq!(sender.user_info.as_ref().unwrap().user_id, "u1");
        assert_eq!(sender.group_info.as_ref().unwrap().group_id, "g1");
        let format = msg.message_info.format_info.as_ref().unwrap();
        assert!(format.accepts("image"));
        assert!(!format.accepts("emoji"));
    }
}
