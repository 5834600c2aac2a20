//! Backend script state machine - single source of truth for valid
//! lifecycle transitions.
//!
//! State diagram:
//! ```text
//! ReadyToStart ──Start──> Launching ──EndpointDiscovered──> Active
//!      ^                      │                               │
//!      │                 [Terminate]                     [Terminate]
//!      │                      ↓                               ↓
//!      │                 IsTerminating <─────────────────────┘
//!      │                      │
//! [GraceElapsed]        [ProcessExited]
//!      │                      ↓
//!      └──────────────── Terminated
//! ```
//!
//! A `ScriptMissing` event from any startable state short-circuits to
//! `UnableToLocateScript`; `ProcessExited` from `Launching`/`Active`
//! covers spawn failure and unexpected exit. The endpoint is latched:
//! once `Active`, further `EndpointDiscovered` events are ignored until
//! the next `Start`.

use std::sync::Mutex;

use log::{info, warn};
use tokio::sync::watch;

/// Lifecycle state of the backend script. Exactly one instance exists,
/// owned by [`ScriptStateManager`]; only `Active` carries the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum ScriptState {
    /// No process; `start` is accepted.
    ReadyToStart,
    /// Process spawned, endpoint not yet announced.
    Launching,
    /// Endpoint discovered; the backend API is reachable.
    Active { endpoint: String },
    /// Termination requested, waiting for the process to exit.
    IsTerminating,
    /// Process gone; becomes `ReadyToStart` after the grace delay.
    Terminated,
    /// The configured script path was empty or unreadable.
    UnableToLocateScript,
}

impl ScriptState {
    /// The discovered endpoint, if any.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            ScriptState::Active { endpoint } => Some(endpoint),
            _ => None,
        }
    }

    /// States from which `start` is accepted. `UnableToLocateScript` is
    /// deliberately startable: a configuration error is never retried
    /// automatically, but the user may re-invoke `start` after fixing
    /// the path.
    pub fn is_startable(&self) -> bool {
        matches!(
            self,
            ScriptState::ReadyToStart
                | ScriptState::Terminated
                | ScriptState::UnableToLocateScript
        )
    }

    /// States from which `terminate` is accepted.
    pub fn is_terminatable(&self) -> bool {
        matches!(self, ScriptState::Launching | ScriptState::Active { .. })
    }
}

/// Events that can trigger lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum ScriptEvent {
    /// `start` was invoked with a readable script path.
    Start,
    /// `start` was invoked with an empty or unreadable path.
    ScriptMissing,
    /// The output parser found an endpoint-announcement line.
    EndpointDiscovered(String),
    /// `terminate` was invoked.
    Terminate,
    /// The spawned process exited (or failed to spawn).
    ProcessExited,
    /// The post-termination grace delay elapsed.
    GraceElapsed,
}

/// Result of a successful state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    Changed { from: ScriptState, to: ScriptState },
    /// Event was valid but the state did not change (e.g. a latched
    /// endpoint announcement while already active).
    Unchanged,
}

/// Reason a transition was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{attempted_event} event rejected in {current_state} state")]
pub struct TransitionRejection {
    pub current_state: ScriptState,
    pub attempted_event: ScriptEvent,
}

/// Thread-safe owner of the script state, observable via `watch`.
#[derive(Debug)]
pub struct ScriptStateManager {
    state: Mutex<ScriptState>,
    tx: watch::Sender<ScriptState>,
}

impl ScriptStateManager {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ScriptState::ReadyToStart);
        Self {
            state: Mutex::new(ScriptState::ReadyToStart),
            tx,
        }
    }

    /// Current state (cloned snapshot).
    pub fn current(&self) -> ScriptState {
        self.state.lock().unwrap().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ScriptState> {
        self.tx.subscribe()
    }

    /// Attempt a state transition based on an event.
    ///
    /// This is the only way to change state, which keeps every mutation
    /// inside the transition table below.
    pub fn transition(
        &self,
        event: ScriptEvent,
    ) -> Result<TransitionResult, TransitionRejection> {
        let mut state = self.state.lock().unwrap();
        let current = state.clone();

        match Self::compute_transition(&current, &event) {
            Some(next) => {
                if next == current {
                    return Ok(TransitionResult::Unchanged);
                }
                info!("script state: {} -> {}", current, next);
                *state = next.clone();
                self.tx.send_replace(next.clone());
                Ok(TransitionResult::Changed {
                    from: current,
                    to: next,
                })
            }
            None => {
                let rejection = TransitionRejection {
                    current_state: current,
                    attempted_event: event,
                };
                warn!("{}", rejection);
                Err(rejection)
            }
        }
    }

    /// Pure transition table. `Some(current)` means the event is valid
    /// but a no-op; `None` means it is rejected in this state.
    fn compute_transition(current: &ScriptState, event: &ScriptEvent) -> Option<ScriptState> {
        match event {
            ScriptEvent::Start if current.is_startable() => Some(ScriptState::Launching),
            ScriptEvent::Start => None,

            ScriptEvent::ScriptMissing if current.is_startable() => {
                Some(ScriptState::UnableToLocateScript)
            }
            ScriptEvent::ScriptMissing => None,

            ScriptEvent::EndpointDiscovered(endpoint) => match current {
                ScriptState::Launching => Some(ScriptState::Active {
                    endpoint: endpoint.clone(),
                }),
                // Latched: the first announcement wins until the next start.
                ScriptState::Active { .. } => Some(current.clone()),
                // Stray announcements while winding down are harmless.
                ScriptState::IsTerminating | ScriptState::Terminated => Some(current.clone()),
                _ => None,
            },

            ScriptEvent::Terminate => match current {
                s if s.is_terminatable() => Some(ScriptState::IsTerminating),
                ScriptState::IsTerminating => Some(current.clone()),
                _ => None,
            },

            ScriptEvent::ProcessExited => match current {
                ScriptState::Launching
                | ScriptState::Active { .. }
                | ScriptState::IsTerminating => Some(ScriptState::Terminated),
                ScriptState::Terminated => Some(current.clone()),
                _ => None,
            },

            // A stale grace timer after the user already restarted must
            // not fire; it is only meaningful in `Terminated`.
            ScriptEvent::GraceElapsed => match current {
                ScriptState::Terminated => Some(ScriptState::ReadyToStart),
                _ => Some(current.clone()),
            },
        }
    }
}

impl Default for ScriptStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ScriptStateManager {
        ScriptStateManager::new()
    }

    #[test]
    fn full_lifecycle_round_trip() {
        let m = manager();
        m.transition(ScriptEvent::Start).unwrap();
        assert_eq!(m.current(), ScriptState::Launching);

        m.transition(ScriptEvent::EndpointDiscovered("http://127.0.0.1:7860".into()))
            .unwrap();
        assert_eq!(m.current().endpoint(), Some("http://127.0.0.1:7860"));

        m.transition(ScriptEvent::Terminate).unwrap();
        assert_eq!(m.current(), ScriptState::IsTerminating);

        m.transition(ScriptEvent::ProcessExited).unwrap();
        assert_eq!(m.current(), ScriptState::Terminated);

        m.transition(ScriptEvent::GraceElapsed).unwrap();
        assert_eq!(m.current(), ScriptState::ReadyToStart);
    }

    #[test]
    fn endpoint_is_latched_once_active() {
        let m = manager();
        m.transition(ScriptEvent::Start).unwrap();
        m.transition(ScriptEvent::EndpointDiscovered("http://127.0.0.1:7860".into()))
            .unwrap();

        let result = m
            .transition(ScriptEvent::EndpointDiscovered("http://127.0.0.1:9999".into()))
            .unwrap();
        assert_eq!(result, TransitionResult::Unchanged);
        assert_eq!(m.current().endpoint(), Some("http://127.0.0.1:7860"));
    }

    #[test]
    fn start_is_rejected_while_running() {
        let m = manager();
        m.transition(ScriptEvent::Start).unwrap();
        let rejection = m.transition(ScriptEvent::Start).unwrap_err();
        assert_eq!(rejection.current_state, ScriptState::Launching);
    }

    #[test]
    fn missing_script_short_circuits_and_stays_startable() {
        let m = manager();
        m.transition(ScriptEvent::ScriptMissing).unwrap();
        assert_eq!(m.current(), ScriptState::UnableToLocateScript);

        m.transition(ScriptEvent::Start).unwrap();
        assert_eq!(m.current(), ScriptState::Launching);
    }

    #[test]
    fn unexpected_exit_while_active_becomes_terminated() {
        let m = manager();
        m.transition(ScriptEvent::Start).unwrap();
        m.transition(ScriptEvent::EndpointDiscovered("http://127.0.0.1:7860".into()))
            .unwrap();
        m.transition(ScriptEvent::ProcessExited).unwrap();
        assert_eq!(m.current(), ScriptState::Terminated);
    }

    #[test]
    fn stale_grace_timer_does_not_fire_after_restart() {
        let m = manager();
        m.transition(ScriptEvent::Start).unwrap();
        m.transition(ScriptEvent::ProcessExited).unwrap();
        m.transition(ScriptEvent::Start).unwrap();

        let result = m.transition(ScriptEvent::GraceElapsed).unwrap();
        assert_eq!(result, TransitionResult::Unchanged);
        assert_eq!(m.current(), ScriptState::Launching);
    }

    #[test]
    fn terminate_is_rejected_when_nothing_runs() {
        let m = manager();
        assert!(m.transition(ScriptEvent::Terminate).is_err());
    }

    #[test]
    fn watch_subscribers_observe_transitions() {
        let m = manager();
        let rx = m.subscribe();
        m.transition(ScriptEvent::Start).unwrap();
        assert_eq!(*rx.borrow(), ScriptState::Launching);
    }
}
