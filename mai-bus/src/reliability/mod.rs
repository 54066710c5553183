// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Delivery Reliability
//!
//! At-least-once delivery on top of the transport:
//!
//! - the sender keeps envelopes it could not deliver in a [`MessageCache`]
//!   and replays them when the target (re)connects,
//! - the receiver acknowledges every business envelope and suppresses
//!   repeats through a [`DedupTable`].
//!
//! Both structures are owned by a single dispatcher task and need no locking.

mod cache;
mod dedup;

pub use cache::{CacheStatus, CacheTarget, CachedMessage, InsertOutcome, MessageCache};
pub use dedup::DedupTable;
