use std::net::SocketAddr;

use thiserror::Error;

use peercall_crypto::CryptoError;
use peercall_protocol::ProtocolError;

use crate::contacts::ContactState;
use crate::events::CallId;
use crate::session::SessionError;

/// Why a call (or a connect attempt on its behalf) failed.
///
/// Carries strings rather than source errors so a failed call state can be
/// cloned into events and compared in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("no route to contact")]
    NoRoute,

    #[error("contact is not listening")]
    NotListening,

    #[error("could not resolve contact host")]
    UnresolvedHost,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("call denied by peer")]
    Denied,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("unknown contact")]
    UnknownContact,

    #[error("contact is blocked")]
    Blocked,

    #[error("unknown call {0}")]
    UnknownCall(CallId),
}

impl CallError {
    /// Short human-readable reason for the UI.
    pub fn reason(&self) -> &'static str {
        match self {
            CallError::Denied | CallError::Blocked => "denied",
            CallError::NoRoute => "no route",
            CallError::AuthenticationFailed | CallError::DecryptionFailed => {
                "authentication failed"
            }
            CallError::NotListening => "not listening",
            CallError::UnresolvedHost => "unresolved host",
            _ => "generic error",
        }
    }

    /// Contact state to record after a failed attempt, if the failure says
    /// something about the contact.
    pub fn contact_state(&self) -> Option<ContactState> {
        match self {
            CallError::NoRoute => Some(ContactState::NetworkUnreachable),
            CallError::NotListening => Some(ContactState::AppNotRunning),
            CallError::UnresolvedHost => Some(ContactState::UnresolvedHost),
            CallError::AuthenticationFailed | CallError::DecryptionFailed => {
                Some(ContactState::AuthenticationFailed)
            }
            _ => None,
        }
    }
}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => CallError::Io(io.to_string()),
            other => CallError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CallError {
    fn from(e: std::io::Error) -> Self {
        CallError::Io(e.to_string())
    }
}

impl From<SessionError> for CallError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Closed => CallError::Io("connection closed by peer".into()),
            SessionError::Decrypt => CallError::DecryptionFailed,
            SessionError::KeyMismatch { .. } | SessionError::NoPeer | SessionError::Crypto(_) => {
                CallError::AuthenticationFailed
            }
            SessionError::Protocol(p) => p.into(),
        }
    }
}

/// Errors that stop a node from starting or its store from loading.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind signaling socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address: {0}")]
    ListenAddress(String),

    #[error("store error: {0}")]
    Store(#[from] CryptoError),

    #[error("store serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
