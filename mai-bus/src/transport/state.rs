// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection state machine.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Dial or handshake in progress.
    Connecting,
    /// Handshake complete, frames flowing.
    Connected,
    /// Local close in progress.
    Disconnecting,
    /// Dial failed or the connection dropped unexpectedly.
    Error,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Error)
                | (Disconnecting, Disconnected)
                | (Error, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Observable state holder that only applies legal transitions.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Applies `next` if legal. Re-entering the current state is a no-op
    /// that reports success.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            if *state == next {
                applied = true;
                return false;
            }
            if state.can_transition_to(next) {
                *state = next;
                applied = true;
                true
            } else {
                warn!("Rejected state transition {:?} -> {:?}", state, next);
                false
            }
        });
        applied
    }

    /// Sets the state unconditionally. Used when a task is torn down.
    pub(crate) fn force(&self, next: ConnectionState) {
        self.tx.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path() {
        let cell = StateCell::new();
        assert!(cell.transition(Connecting));
        assert!(cell.transition(Connected));
        assert!(cell.transition(Disconnecting));
        assert!(cell.transition(Disconnected));
        assert_eq!(cell.get(), Disconnected);
    }

    #[test]
    fn test_drop_goes_through_error() {
        let cell = StateCell::new();
        cell.transition(Connecting);
        cell.transition(Connected);
        assert!(cell.transition(Error));
        assert!(!cell.transition(Connected));
        assert!(cell.transition(Disconnected));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let cell = StateCell::new();
        assert!(!cell.transition(Connected));
        assert!(!cell.transition(Disconnecting));
        assert_eq!(cell.get(), Disconnected);
        assert!(cell.transition(Disconnected));
    }

    #[test]
    fn test_transition_table() {
        assert!(Error.can_transition_to(Disconnected));
        assert!(!Error.can_transition_to(Connecting));
        assert!(!Disconnecting.can_transition_to(Connected));
        assert!(Connected.is_connected());
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.transition(Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connecting);
    }
}
