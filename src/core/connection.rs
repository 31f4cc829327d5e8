//! Per-service connection lifecycle.
//!
//! Each logical service (transcription, agent) owns one [`ConnectionStateMachine`].
//! The machine only records and validates transitions and notifies observers; it
//! never retries on its own. Retry policy belongs to whoever owns the machine.
//!
//! ```text
//! closed ──open──▶ connecting ──▶ connected ──▶ closed
//!   ▲                  │              │
//!   │                  ▼              ▼
//!   └──────────────── error ◀─────────┘
//! ```

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::errors::{AgentError, AgentResult};

/// One of the two independent logical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Speech transcription socket
    Transcription,
    /// Conversational agent socket
    Agent,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Transcription => write!(f, "transcription"),
            Service::Agent => write!(f, "agent"),
        }
    }
}

/// Connection state of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Connection attempt in progress
    Connecting,
    /// Transport established
    Connected,
    /// Transport failed; the owner decides whether to retry
    Error,
    /// Not connected (initial state, or after a graceful shutdown)
    #[default]
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

impl ConnectionState {
    /// Whether `self -> to` is a legal transition.
    ///
    /// `connecting` can only be entered from `closed` or `error`, so two attempts
    /// on one service never overlap and `closed -> connected` is impossible.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Closed | Error, Connecting)
                | (Connecting, Connected)
                | (Connecting | Connected, Error)
                | (Connecting | Connected | Error, Closed)
        )
    }
}

/// Identifies one connection attempt on a service.
///
/// Tokens increase monotonically; anything tied to an older attempt is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptToken(u64);

impl AttemptToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observer invoked once per transition.
pub type StateObserver = Arc<dyn Fn(Service, ConnectionState) + Send + Sync>;

#[derive(Debug)]
struct MachineState {
    state: ConnectionState,
    attempt: u64,
}

/// Lifecycle state machine for one service.
pub struct ConnectionStateMachine {
    service: Service,
    inner: Mutex<MachineState>,
    observers: RwLock<Vec<StateObserver>>,
}

impl ConnectionStateMachine {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            inner: Mutex::new(MachineState {
                state: ConnectionState::Closed,
                attempt: 0,
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Token of the most recent attempt, if any attempt was made.
    pub fn current_attempt(&self) -> Option<AttemptToken> {
        let attempt = self.inner.lock().attempt;
        (attempt > 0).then_some(AttemptToken(attempt))
    }

    pub fn is_current(&self, token: AttemptToken) -> bool {
        self.inner.lock().attempt == token.0
    }

    /// Register an observer for state changes.
    pub fn subscribe(&self, observer: StateObserver) {
        self.observers.write().push(observer);
    }

    /// Start a new connection attempt.
    pub fn begin_attempt(&self) -> AgentResult<AttemptToken> {
        let token = {
            let mut inner = self.inner.lock();
            if !inner.state.can_transition_to(ConnectionState::Connecting) {
                return Err(AgentError::InvalidTransition {
                    service: self.service,
                    from: inner.state,
                    to: ConnectionState::Connecting,
                });
            }
            inner.state = ConnectionState::Connecting;
            inner.attempt += 1;
            AttemptToken(inner.attempt)
        };

        tracing::debug!(service = %self.service, attempt = %token, "Connection attempt started");
        self.notify(ConnectionState::Connecting);
        Ok(token)
    }

    /// Mark the given attempt as connected.
    pub fn mark_connected(&self, token: AttemptToken) -> AgentResult<()> {
        match self.transition(token, ConnectionState::Connected)? {
            true => Ok(()),
            false => Err(AgentError::Closed),
        }
    }

    /// Mark the given attempt as failed. Stale attempts and repeated errors are ignored.
    pub fn mark_error(&self, token: AttemptToken) -> bool {
        self.transition(token, ConnectionState::Error).unwrap_or(false)
    }

    /// Mark the given attempt as closed by the remote side.
    pub fn mark_closed(&self, token: AttemptToken) -> bool {
        self.transition(token, ConnectionState::Closed).unwrap_or(false)
    }

    /// Close the service regardless of its current state.
    ///
    /// Returns `false` (and notifies nobody) when already closed.
    pub fn close(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            inner.state = ConnectionState::Closed;
        }
        self.notify(ConnectionState::Closed);
        true
    }

    /// Apply a transition for `token`.
    ///
    /// `Ok(false)` means the transition was skipped because the token is stale or
    /// the machine is already in the target state.
    fn transition(&self, token: AttemptToken, to: ConnectionState) -> AgentResult<bool> {
        {
            let mut inner = self.inner.lock();
            if inner.attempt != token.0 || inner.state == to {
                return Ok(false);
            }
            if !inner.state.can_transition_to(to) {
                return Err(AgentError::InvalidTransition {
                    service: self.service,
                    from: inner.state,
                    to,
                });
            }
            inner.state = to;
        }
        self.notify(to);
        Ok(true)
    }

    fn notify(&self, state: ConnectionState) {
        tracing::info!(service = %self.service, state = %state, "Connection state changed");
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(self.service, state);
        }
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("service", &self.service)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_machine() -> (ConnectionStateMachine, Arc<Mutex<Vec<ConnectionState>>>) {
        let machine = ConnectionStateMachine::new(Service::Agent);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        machine.subscribe(Arc::new(move |_, state| sink.lock().push(state)));
        (machine, seen)
    }

    #[test]
    fn test_display() {
        assert_eq!(Service::Agent.to_string(), "agent");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
    }

    #[test]
    fn test_happy_path_notifies_once_per_transition() {
        let (machine, seen) = recording_machine();
        let token = machine.begin_attempt().unwrap();
        machine.mark_connected(token).unwrap();
        assert!(machine.close());

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Closed
            ]
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let (machine, seen) = recording_machine();
        let token = machine.begin_attempt().unwrap();
        machine.mark_connected(token).unwrap();

        assert!(machine.close());
        assert!(!machine.close());
        assert!(!machine.close());

        let closed = seen
            .lock()
            .iter()
            .filter(|s| **s == ConnectionState::Closed)
            .count();
        assert_eq!(closed, 1);
    }

    #[test]
    fn test_closed_never_jumps_to_connected() {
        for from in [
            ConnectionState::Closed,
            ConnectionState::Error,
            ConnectionState::Connected,
        ] {
            assert!(
                !from.can_transition_to(ConnectionState::Connected),
                "{from} -> connected must be rejected"
            );
        }
        assert!(ConnectionState::Connecting.can_transition_to(ConnectionState::Connected));
    }

    #[test]
    fn test_stale_attempt_cannot_connect() {
        let machine = ConnectionStateMachine::new(Service::Transcription);
        let first = machine.begin_attempt().unwrap();
        assert!(machine.mark_error(first));

        let second = machine.begin_attempt().unwrap();
        assert!(second > first);

        assert!(matches!(
            machine.mark_connected(first),
            Err(AgentError::Closed)
        ));
        assert_eq!(machine.state(), ConnectionState::Connecting);

        machine.mark_connected(second).unwrap();
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_no_overlapping_attempts() {
        let machine = ConnectionStateMachine::new(Service::Agent);
        machine.begin_attempt().unwrap();
        let err = machine.begin_attempt().unwrap_err();
        assert!(matches!(err, AgentError::InvalidTransition { .. }));
    }

    #[test]
    fn test_reconnect_after_close() {
        let (machine, seen) = recording_machine();
        let first = machine.begin_attempt().unwrap();
        machine.mark_connected(first).unwrap();
        machine.close();

        let second = machine.begin_attempt().unwrap();
        machine.mark_connected(second).unwrap();
        assert_eq!(machine.current_attempt(), Some(second));
        assert_eq!(seen.lock().len(), 5);
    }

    #[test]
    fn test_error_after_close_is_ignored() {
        let machine = ConnectionStateMachine::new(Service::Agent);
        let token = machine.begin_attempt().unwrap();
        machine.mark_connected(token).unwrap();
        machine.close();
        assert!(!machine.mark_error(token));
        assert_eq!(machine.state(), ConnectionState::Closed);
    }
}
