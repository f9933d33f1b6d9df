//! Live session state machine.
//!
//! ```text
//! Idle -> Connecting -> Listening <-> Speaking
//!   \          \            \            \
//!    +----------+------------+------------+--> Closed(reason)
//! ```
//!
//! `Closed` is terminal. Events that do not apply to the current state are
//! ignored rather than treated as errors: pipeline tasks race with teardown
//! and may report playback or audio after the session has closed.

use std::fmt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Capacity of the transition broadcast before slow subscribers lag.
const STATE_CHANNEL_SIZE: usize = 64;

/// Why a session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller stopped the session.
    Stopped,
    /// The remote agent closed the session.
    LinkClosed(Option<String>),
    /// The link failed to open or dropped.
    Link(String),
    /// A microphone or speaker failed.
    Device(String),
}

impl CloseReason {
    /// Whether the session ended because of a failure rather than a normal close.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Link(_) | Self::Device(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::LinkClosed(Some(reason)) => write!(f, "agent closed the session: {reason}"),
            Self::LinkClosed(None) => write!(f, "agent closed the session"),
            Self::Link(msg) => write!(f, "link error: {msg}"),
            Self::Device(msg) => write!(f, "device error: {msg}"),
        }
    }
}

/// Observable state of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Opening the link to the agent.
    Connecting,
    /// Link open, microphone streaming, no agent audio playing.
    Listening,
    /// Agent audio is scheduled or playing.
    Speaking,
    /// Terminal.
    Closed(CloseReason),
}

impl SessionState {
    /// The state `event` leads to, or `None` if it does not apply.
    pub fn next(&self, event: &SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Closed(_), _) => None,
            (_, E::Close(reason)) => Some(S::Closed(reason.clone())),
            (S::Idle, E::Start) => Some(S::Connecting),
            (S::Connecting, E::LinkOpened) => Some(S::Listening),
            (S::Listening, E::AgentAudio) => Some(S::Speaking),
            (S::Speaking, E::PlaybackDrained) => Some(S::Listening),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Listening => write!(f, "listening"),
            Self::Speaking => write!(f, "speaking"),
            Self::Closed(reason) => write!(f, "closed ({reason})"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Caller asked to start; devices are acquired.
    Start,
    /// The agent confirmed the session is open.
    LinkOpened,
    /// The first frame of an agent turn was scheduled.
    AgentAudio,
    /// The last scheduled frame finished or was cancelled.
    PlaybackDrained,
    /// Stop, remote close, or fatal error.
    Close(CloseReason),
}

/// Thread-safe holder of the session state.
///
/// Every accepted transition is broadcast, in order, to subscribers; the
/// latest state can be read at any time.
#[derive(Debug)]
pub struct StateMachine {
    current: watch::Sender<SessionState>,
    transitions: broadcast::Sender<SessionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (current, _) = watch::channel(SessionState::Idle);
        let (transitions, _) = broadcast::channel(STATE_CHANNEL_SIZE);
        Self {
            current,
            transitions,
        }
    }

    /// Apply `event`, returning the new state if a transition happened.
    pub fn apply(&self, event: SessionEvent) -> Option<SessionState> {
        let mut entered = None;
        self.current.send_if_modified(|state| match state.next(&event) {
            Some(next) => {
                info!(from = %state, to = %next, "session state change");
                *state = next.clone();
                // Broadcast under the watch lock so subscribers see
                // transitions in the order they were applied.
                let _ = self.transitions.send(next.clone());
                entered = Some(next);
                true
            }
            None => {
                debug!(state = %state, ?event, "ignoring event");
                false
            }
        });
        entered
    }

    /// The current state.
    pub fn current(&self) -> SessionState {
        self.current.borrow().clone()
    }

    /// Stream of every transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }

    /// Wait until the session is closed and return why.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.current.subscribe();
        match rx.wait_for(SessionState::is_closed).await {
            Ok(state) => match &*state {
                SessionState::Closed(reason) => reason.clone(),
                _ => CloseReason::Stopped,
            },
            // The sender lives in `self`, so this cannot happen while we borrow it.
            Err(_) => CloseReason::Stopped,
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
