//! Events delivered to the UI/media layer, and the media seam.
//!
//! Socket tasks push events onto an unbounded channel and move on; the
//! consumer runs on its own task, so no UI or media code ever executes on
//! the task that owns a socket. Events for one call arrive in the order the
//! triggering I/O happened.

use tokio::sync::mpsc;
use tracing::trace;

use peercall_crypto::PublicKey;

use crate::contacts::ContactState;
use crate::error::CallError;

/// Node-local call identifier (monotonic).
pub type CallId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Lifecycle of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Waiting,
    Connecting,
    Ringing,
    Connected,
    Dismissed,
    Ended,
    Error(CallError),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Dismissed | CallState::Ended | CallState::Error(_)
        )
    }
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A call moved to a new state.
    CallState {
        call_id: CallId,
        peer: PublicKey,
        direction: Direction,
        state: CallState,
    },
    /// Someone is calling. `name` is `None` for callers not in the directory.
    IncomingCall {
        call_id: CallId,
        peer: PublicKey,
        name: Option<String>,
    },
    /// A known contact's reachability changed.
    ContactStatus { peer: PublicKey, state: ContactState },
    /// A connection presented a different key than the one it started with,
    /// or than the contact we dialed.
    SuspiciousKeyChange { expected: PublicKey, got: PublicKey },
}

/// Sending half of the event channel. Never blocks; a dropped receiver
/// just discards events.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: NodeEvent) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}

/// The external media engine. Offers and answers are opaque strings; the
/// signaling core passes them through untouched.
pub trait MediaEngine: Send + Sync + 'static {
    /// Produce the session offer for an outgoing call.
    fn create_offer(&self, call_id: CallId) -> String;

    /// Produce the answer to a received offer when the user accepts.
    fn create_answer(&self, call_id: CallId, offer: &str) -> String;

    /// Hand the peer's answer to the engine once an outgoing call connects.
    fn set_remote_description(&self, call_id: CallId, description: &str);
}

/// Media engine for headless nodes: empty descriptions, ignores answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMedia;

impl MediaEngine for NullMedia {
    fn create_offer(&self, _call_id: CallId) -> String {
        String::new()
    }

    fn create_answer(&self, _call_id: CallId, _offer: &str) -> String {
        String::new()
    }

    fn set_remote_description(&self, _call_id: CallId, _description: &str) {}
}
