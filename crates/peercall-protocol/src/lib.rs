//! PeerCall wire protocol: length-prefixed framing and signaling messages.
//!
//! Every message on a signaling connection is `[u32 BE length][payload]`.
//! The payload is opaque at this layer (it is sealed ciphertext on the wire);
//! once decrypted it is a UTF-8 JSON object parsed into [`SignalMessage`].

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{encode_frame, try_decode_frame, write_message, FrameReader};
pub use error::ProtocolError;
pub use messages::{decode_message, encode_message, SignalMessage};
pub use types::{PeerStatus, DEFAULT_PORT};
