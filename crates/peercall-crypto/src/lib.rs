//! PeerCall cryptographic layer.
//!
//! This crate provides:
//! - Long-term identity key pairs (Ed25519), zeroized on drop
//! - Signed-and-sealed peer messages: Ed25519 signature under an anonymous
//!   X25519 sealed box addressed to the recipient's converted key
//! - Password-based encryption for the on-disk store (Argon2id + AES-256-GCM)

pub mod error;
pub mod identity;
pub mod message;
pub mod persistence;

pub use error::CryptoError;
pub use identity::{IdentityKeyPair, PublicKey, PUBLIC_KEY_LEN, SECRET_KEY_LEN};
pub use message::{decrypt_message, encrypt_message};
pub use persistence::{decrypt_store, encrypt_store, KdfParams};
