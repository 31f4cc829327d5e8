//! Settings handshake gate.
//!
//! Configuration goes out exactly once per connection attempt, and user content is
//! held until the server confirms that configuration. The gate is keyed on the
//! [`AttemptToken`] so overlapping setup paths for the same attempt cannot both send.

use std::time::Duration;
use tokio::sync::watch;

use super::connection::AttemptToken;

/// Handshake progress for the current attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsHandshake {
    /// Configuration was transmitted
    pub sent: bool,
    /// Server confirmed the configuration
    pub accepted: bool,
}

/// Outcome of [`ReadinessGate::wait_until_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    TimedOut,
    /// Connection closed while waiting
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
struct GateState {
    attempt: Option<AttemptToken>,
    sent: bool,
    accepted: bool,
    closed: bool,
}

/// Per-session readiness gate.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<GateState>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState {
            closed: true,
            ..Default::default()
        });
        Self { tx }
    }

    /// Reset the gate for a fresh connection attempt.
    pub fn begin_attempt(&self, attempt: AttemptToken) {
        self.tx.send_replace(GateState {
            attempt: Some(attempt),
            ..Default::default()
        });
    }

    /// Claim the right to send configuration for `attempt`.
    ///
    /// Returns `true` for exactly one caller per attempt. The flag flips before the
    /// bytes hit the wire; call [`release_send`](Self::release_send) if transmission fails.
    pub fn try_claim_send(&self, attempt: AttemptToken) -> bool {
        self.tx.send_if_modified(|state| {
            if state.attempt == Some(attempt) && !state.sent && !state.closed {
                state.sent = true;
                true
            } else {
                false
            }
        })
    }

    /// Undo a claim whose transmission did not happen.
    pub fn release_send(&self, attempt: AttemptToken) {
        self.tx.send_if_modified(|state| {
            if state.attempt == Some(attempt) && state.sent && !state.accepted {
                state.sent = false;
                true
            } else {
                false
            }
        });
    }

    /// Record the server's confirmation for `attempt`.
    pub fn mark_accepted(&self, attempt: AttemptToken) -> bool {
        self.tx.send_if_modified(|state| {
            if state.attempt == Some(attempt) && !state.accepted && !state.closed {
                state.accepted = true;
                true
            } else {
                false
            }
        })
    }

    /// Resolve every pending waiter with [`ReadyOutcome::Closed`].
    pub fn mark_closed(&self) {
        self.tx.send_if_modified(|state| {
            if state.closed {
                false
            } else {
                state.closed = true;
                true
            }
        });
    }

    pub fn handshake(&self) -> SettingsHandshake {
        let state = self.tx.borrow();
        SettingsHandshake {
            sent: state.sent,
            accepted: state.accepted,
        }
    }

    pub fn is_ready(&self) -> bool {
        let state = self.tx.borrow();
        state.accepted && !state.closed
    }

    pub fn attempt(&self) -> Option<AttemptToken> {
        self.tx.borrow().attempt
    }

    /// Wait until configuration is accepted, the gate closes, or `timeout` elapses.
    pub async fn wait_until_ready(&self, timeout: Duration) -> ReadyOutcome {
        let mut rx = self.tx.subscribe();
        let wait = async {
            match rx.wait_for(|state| state.accepted || state.closed).await {
                Ok(state) if state.closed => ReadyOutcome::Closed,
                Ok(_) => ReadyOutcome::Ready,
                Err(_) => ReadyOutcome::Closed,
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(ReadyOutcome::TimedOut)
    }
}
