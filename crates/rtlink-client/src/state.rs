//! Connection lifecycle state machine.
//!
//! The machine is the single authority on lifecycle: every transition is
//! checked against the allowed-move table, emits a [`StateChange`] to
//! listeners in transition order, and settles any deferred completions
//! waiting on the new state.

use std::time::Duration;

use rtlink_protocol::ErrorInfo;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::debug;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Terminal states reject deferred completions waiting elsewhere.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Allowed-move table.  Any pair not listed is an invalid transition.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match self {
            Initialized => matches!(to, Connecting | Closed),
            Connecting => matches!(to, Connected | Disconnected | Suspended | Failed | Closing),
            Connected => matches!(to, Disconnected | Suspended | Closing | Failed),
            Disconnected => matches!(to, Connecting | Suspended | Closing | Failed),
            Suspended => matches!(to, Connecting | Closing | Failed),
            Closing => matches!(to, Closed | Failed),
            Closed => matches!(to, Connecting),
            // A failed connection can only be re-opened as a fresh session.
            Failed => matches!(to, Connecting),
        }
    }
}

// ---------------------------------------------------------------------------
// StateChange
// ---------------------------------------------------------------------------

/// Event emitted on every transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub error: Option<ErrorInfo>,
    /// When the manager has scheduled a reconnect, the delay until it fires.
    pub retry_in: Option<Duration>,
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

pub(crate) type StateWaiter = oneshot::Sender<Result<()>>;

pub(crate) struct StateMachine {
    current: ConnectionState,
    /// Incremented on each entry into Connected; tags continuations and
    /// pending entries so stale callbacks cannot touch a fresh session.
    generation: u64,
    error_reason: Option<ErrorInfo>,
    events: broadcast::Sender<StateChange>,
    watch_tx: watch::Sender<ConnectionState>,
    waiters: Vec<(ConnectionState, StateWaiter)>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (watch_tx, _) = watch::channel(ConnectionState::Initialized);
        StateMachine {
            current: ConnectionState::Initialized,
            generation: 0,
            error_reason: None,
            events,
            watch_tx,
            waiters: Vec::new(),
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.current
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    pub fn events_sender(&self) -> broadcast::Sender<StateChange> {
        self.events.clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.watch_tx.subscribe()
    }

    /// Register a deferred completion for `target`.
    ///
    /// Resolves with `Ok` when the machine enters `target`; rejects with the
    /// transition error if a terminal state arrives first.
    pub fn add_waiter(&mut self, target: ConnectionState, tx: StateWaiter) {
        if self.current == target {
            let _ = tx.send(Ok(()));
            return;
        }
        self.waiters.push((target, tx));
    }

    /// Move to `to`, emitting a [`StateChange`] and settling waiters.
    pub fn transition(
        &mut self,
        to: ConnectionState,
        error: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) -> Result<StateChange> {
        if !self.current.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.current,
                to,
            });
        }
        let change = StateChange {
            previous: self.current,
            current: to,
            error: error.clone(),
            retry_in,
        };
        self.current = to;
        if to == ConnectionState::Connected {
            self.generation += 1;
            self.error_reason = None;
        } else if let Some(info) = error {
            self.error_reason = Some(info);
        }
        debug!(from = ?change.previous, to = ?change.current, generation = self.generation, "state transition");
        let _ = self.watch_tx.send(to);
        let _ = self.events.send(change.clone());
        self.settle_waiters(&change);
        Ok(change)
    }

    fn settle_waiters(&mut self, change: &StateChange) {
        let arrived = change.current;
        let terminal = arrived.is_terminal();
        if !terminal {
            // Only waiters for the arrived state settle.
            let mut kept = Vec::new();
            for (target, tx) in self.waiters.drain(..) {
                if target == arrived {
                    let _ = tx.send(Ok(()));
                } else {
                    kept.push((target, tx));
                }
            }
            self.waiters = kept;
            return;
        }
        // Terminal arrival: everything settles, matching waiters with Ok and
        // the rest with the transition error.
        let err = match &change.error {
            Some(info) => Error::from_error_info(info.clone()),
            None => Error::Connection(format!("connection entered {arrived:?}")),
        };
        for (target, tx) in self.waiters.drain(..) {
            if target == arrived {
                let _ = tx.send(Ok(()));
            } else {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
