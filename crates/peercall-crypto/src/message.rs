//! Signed-and-sealed peer messages.
//!
//! Outgoing: `seal(recipient, own_pk ‖ signature ‖ plaintext)`.
//! The seal is an anonymous box: a fresh X25519 key pair per message, the
//! shared secret run through HKDF-SHA256, ChaCha20-Poly1305 on top.
//! Wire layout: `ephemeral_pk(32) ‖ ciphertext ‖ tag(16)`.
//!
//! The seal alone does not say who sent the message; the embedded Ed25519
//! signature does. After [`decrypt_message`] succeeds the returned sender key
//! is the only trustworthy sender identity.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, PublicKey, PUBLIC_KEY_LEN};

const SIGNATURE_LEN: usize = 64;
const TAG_LEN: usize = 16;
const SEAL_KEY_LEN: usize = 32;
const SEAL_NONCE_LEN: usize = 12;
const SEAL_INFO: &[u8] = b"peercall sealed box v1";

/// Bytes added by the seal on top of the sealed content.
pub const SEAL_OVERHEAD: usize = PUBLIC_KEY_LEN + TAG_LEN;

/// Total bytes [`encrypt_message`] adds to a plaintext.
pub const MESSAGE_OVERHEAD: usize = SEAL_OVERHEAD + PUBLIC_KEY_LEN + SIGNATURE_LEN;

/// Sign, prepend our public key, and seal to the recipient.
///
/// `own_pk` must be the public half of `own_sk` (a 32-byte Ed25519 seed).
pub fn encrypt_message(
    plaintext: &[u8],
    recipient_pk: &[u8],
    own_pk: &[u8],
    own_sk: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let recipient = PublicKey::from_slice(recipient_pk)?;
    let identity = IdentityKeyPair::from_parts(own_pk, own_sk)?;
    identity.seal_to(&recipient, plaintext)
}

/// Open a sealed message addressed to us and verify its embedded signature.
///
/// Returns the plaintext and the signature-verified sender key. Every
/// structural or cryptographic failure is the same `DecryptionFailed`.
pub fn decrypt_message(
    ciphertext: &[u8],
    own_pk: &[u8],
    own_sk: &[u8],
) -> Result<(Vec<u8>, PublicKey), CryptoError> {
    let identity =
        IdentityKeyPair::from_parts(own_pk, own_sk).map_err(|_| CryptoError::DecryptionFailed)?;
    identity.open(ciphertext)
}

impl IdentityKeyPair {
    /// [`encrypt_message`] with this identity as sender.
    pub fn seal_to(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature: Signature = self.signing_key().sign(plaintext);

        let mut inner =
            Zeroizing::new(Vec::with_capacity(PUBLIC_KEY_LEN + SIGNATURE_LEN + plaintext.len()));
        inner.extend_from_slice(self.public_key().as_bytes());
        inner.extend_from_slice(&signature.to_bytes());
        inner.extend_from_slice(plaintext);

        seal(&recipient.to_x25519()?, &inner)
    }

    /// [`decrypt_message`] with this identity as recipient.
    pub fn open(&self, ciphertext: &[u8]) -> Result<(Vec<u8>, PublicKey), CryptoError> {
        let inner = unseal(&self.x25519_secret(), ciphertext)?;
        if inner.len() < PUBLIC_KEY_LEN + SIGNATURE_LEN {
            return Err(CryptoError::DecryptionFailed);
        }

        let (sender_bytes, signed) = inner.split_at(PUBLIC_KEY_LEN);
        let (signature_bytes, plaintext) = signed.split_at(SIGNATURE_LEN);

        let sender = PublicKey::from_slice(sender_bytes).map_err(|_| CryptoError::DecryptionFailed)?;
        let verifying = sender
            .verifying_key()
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let signature_arr: [u8; SIGNATURE_LEN] = signature_bytes
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let signature = Signature::from_bytes(&signature_arr);

        verifying
            .verify_strict(plaintext, &signature)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok((plaintext.to_vec(), sender))
    }
}

/// Derive the one-shot AEAD key and nonce for a sealed box.
fn seal_key(
    shared: &[u8; 32],
    ephemeral_pk: &x25519_dalek::PublicKey,
    recipient_pk: &x25519_dalek::PublicKey,
) -> Result<(Zeroizing<[u8; SEAL_KEY_LEN]>, [u8; SEAL_NONCE_LEN]), CryptoError> {
    let mut info = Vec::with_capacity(SEAL_INFO.len() + 64);
    info.extend_from_slice(SEAL_INFO);
    info.extend_from_slice(ephemeral_pk.as_bytes());
    info.extend_from_slice(recipient_pk.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = Zeroizing::new([0u8; SEAL_KEY_LEN + SEAL_NONCE_LEN]);
    hk.expand(&info, okm.as_mut_slice())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut key = Zeroizing::new([0u8; SEAL_KEY_LEN]);
    key.copy_from_slice(&okm[..SEAL_KEY_LEN]);
    let mut nonce = [0u8; SEAL_NONCE_LEN];
    nonce.copy_from_slice(&okm[SEAL_KEY_LEN..]);
    Ok((key, nonce))
}

fn seal(recipient: &x25519_dalek::PublicKey, content: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let ephemeral_pk = x25519_dalek::PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }
    let (key, nonce) = seal_key(shared.as_bytes(), &ephemeral_pk, recipient)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), content)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + sealed.len());
    out.extend_from_slice(ephemeral_pk.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn unseal(
    own_secret: &x25519_dalek::StaticSecret,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < SEAL_OVERHEAD {
        return Err(CryptoError::DecryptionFailed);
    }
    let (eph_bytes, sealed) = ciphertext.split_at(PUBLIC_KEY_LEN);
    let eph_arr: [u8; PUBLIC_KEY_LEN] = eph_bytes
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let ephemeral_pk = x25519_dalek::PublicKey::from(eph_arr);
    let own_pk = x25519_dalek::PublicKey::from(own_secret);

    let shared = own_secret.diffie_hellman(&ephemeral_pk);
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }
    let (key, nonce) = seal_key(shared.as_bytes(), &ephemeral_pk, &own_pk)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let opened = cipher
        .decrypt(Nonce::from_slice(&nonce), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(Zeroizing::new(opened))
}
