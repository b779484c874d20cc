use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::PeerStatus;

/// A decrypted signaling message.
///
/// On the wire this is a JSON object with an `action` discriminator and the
/// fields that action requires. Parsing validates the per-action fields, so
/// holding a `SignalMessage` means the required data is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    /// Caller starts a call; `offer` is opaque session-setup data for the media layer.
    Call { offer: String },
    /// Liveness probe.
    Ping,
    /// Answer to `Ping`.
    Pong,
    /// Callee received the call and is alerting the user.
    Ringing,
    /// Callee accepted; `answer` is the media layer's reply to the offer.
    Connected { answer: String },
    /// Call declined or hung up.
    Dismissed,
    /// Presence change broadcast.
    StatusChange { status: PeerStatus },
    /// Any action this build does not know. Never acted upon.
    Unrecognized { action: String },
}

impl SignalMessage {
    pub fn action(&self) -> &str {
        match self {
            SignalMessage::Call { .. } => "call",
            SignalMessage::Ping => "ping",
            SignalMessage::Pong => "pong",
            SignalMessage::Ringing => "ringing",
            SignalMessage::Connected { .. } => "connected",
            SignalMessage::Dismissed => "dismissed",
            SignalMessage::StatusChange { .. } => "status_change",
            SignalMessage::Unrecognized { action } => action,
        }
    }
}

/// Flat wire shape shared by every action.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

/// Serialize a message into UTF-8 JSON bytes (the plaintext handed to crypto).
pub fn encode_message(msg: &SignalMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut wire = WireMessage {
        action: Some(msg.action().to_string()),
        ..Default::default()
    };
    match msg {
        SignalMessage::Call { offer } => wire.offer = Some(offer.clone()),
        SignalMessage::Connected { answer } => wire.answer = Some(answer.clone()),
        SignalMessage::StatusChange { status } => wire.status = Some(status.as_str().into()),
        _ => {}
    }
    Ok(serde_json::to_vec(&wire)?)
}

/// Parse and validate decrypted JSON bytes.
pub fn decode_message(payload: &[u8]) -> Result<SignalMessage, ProtocolError> {
    let wire: WireMessage = serde_json::from_slice(payload)?;
    let action = wire.action.ok_or_else(|| {
        ProtocolError::MalformedMessage("missing `action` field".into())
    })?;

    let msg = match action.as_str() {
        "call" => SignalMessage::Call {
            offer: required(&action, "offer", wire.offer)?,
        },
        "ping" => SignalMessage::Ping,
        "pong" => SignalMessage::Pong,
        "ringing" => SignalMessage::Ringing,
        "connected" => SignalMessage::Connected {
            answer: required(&action, "answer", wire.answer)?,
        },
        "dismissed" => SignalMessage::Dismissed,
        "status_change" => SignalMessage::StatusChange {
            status: required(&action, "status", wire.status)?.parse()?,
        },
        _ => SignalMessage::Unrecognized { action },
    };
    Ok(msg)
}

fn required(
    action: &str,
    field: &'static str,
    value: Option<String>,
) -> Result<String, ProtocolError> {
    value.ok_or_else(|| ProtocolError::MissingField {
        action: action.to_string(),
        field,
    })
}
