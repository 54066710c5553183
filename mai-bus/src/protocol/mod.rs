// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Every WebSocket text frame carries exactly one [`Envelope`]:
//!
//! ```text
//! {"ver":1,"msg_id":"<uuid>","type":"sys_std","meta":{...},"payload":{...}}
//! ```
//!
//! Reserved types are `sys_std` (a [`StandardMessage`] payload), `sys_ack`,
//! `sys_ping` and `sys_pong`. Application extensions use `custom_<name>`.

mod codec;
mod envelope;
mod message;

pub use codec::{decode, encode};
pub use envelope::{
    custom_name, Envelope, MessageType, CUSTOM_PREFIX, PROTOCOL_VERSION, SYSTEM_PREFIX,
};
pub use message::{
    FormatInfo, GroupInfo, MessageDim, MessageInfo, ParticipantInfo, Segment, StandardMessage,
    UserInfo,
};

use thiserror::Error;

/// Protocol-level errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid custom message type: {0}")]
    InvalidCustomType(String),

    #[error("Envelope is not of type {expected}: {actual}")]
    WrongType {
        expected: &'static str,
        actual: String,
    },
}
