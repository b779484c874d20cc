//! Identity key generation and serialization.
//!
//! Each PeerCall installation has one long-term Ed25519 key pair generated
//! on first launch and persisted across sessions. The public key is the
//! peer's durable identifier; the same pair is converted to X25519 for
//! sealed-box encryption.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 secret seed.
pub const SECRET_KEY_LEN: usize = 32;

/// A peer's long-term public key (32-byte Ed25519).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_LEN] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                got: slice.len(),
            })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Montgomery form of this key, used as the sealed-box recipient.
    pub(crate) fn to_x25519(&self) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let montgomery = self.verifying_key()?.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = BASE64.encode(self.0);
        write!(f, "PublicKey({}…)", &full[..8])
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }
}

/// The local long-term key pair.
///
/// The secret lives in an `ed25519_dalek::SigningKey`, which zeroizes its
/// memory on drop. No `Clone`/`Debug` to keep the secret from spreading.
pub struct IdentityKeyPair {
    signing: SigningKey,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh key pair from OS entropy.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore from a stored 32-byte secret seed.
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, CryptoError> {
        let mut seed: [u8; SECRET_KEY_LEN] =
            secret.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: SECRET_KEY_LEN,
                got: secret.len(),
            })?;
        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(Self::from_signing_key(signing))
    }

    /// Restore from a stored pair, checking that both halves belong together.
    pub fn from_parts(public: &[u8], secret: &[u8]) -> Result<Self, CryptoError> {
        let expected = PublicKey::from_slice(public)?;
        let pair = Self::from_secret_bytes(secret)?;
        if pair.public != expected {
            return Err(CryptoError::KeyMismatch);
        }
        Ok(pair)
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Copy of the secret seed for persistence. Wiped when the copy drops.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_LEN]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// X25519 secret matching [`PublicKey::to_x25519`] of our public key.
    ///
    /// Lower half of `SHA-512(seed)`; clamping happens inside `x25519-dalek`.
    pub(crate) fn x25519_secret(&self) -> x25519_dalek::StaticSecret {
        let seed = Zeroizing::new(self.signing.to_bytes());
        let mut hash = Zeroizing::new([0u8; 64]);
        Sha512::new()
            .chain_update(seed.as_slice())
            .finalize_into(GenericArray::from_mut_slice(&mut hash[..]));

        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        let secret = x25519_dalek::StaticSecret::from(scalar);
        scalar.zeroize();
        secret
    }
}
