//! Password-based encryption for the on-disk store.
//!
//! Argon2id derives an AES-256-GCM key from the password and a random salt.
//!
//! Layout: `[reserved(4) = 0] [salt(16)] [nonce(12)] [ciphertext + tag(16)]`
//!
//! The reserved bytes are authenticated as AAD; a non-zero header is refused
//! so a future format can claim it.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::CryptoError;

const HEADER: [u8; 4] = [0, 0, 0, 0];
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Smallest valid encrypted store: header, salt, nonce, and an empty payload's tag.
pub const MIN_STORE_LEN: usize = HEADER.len() + SALT_LEN + NONCE_LEN + TAG_LEN;

/// Argon2id cost parameters.
///
/// The defaults match the "interactive" profile: 64 MiB, 2 passes, 1 lane.
/// Decryption must use the same parameters as encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Number of passes.
    pub t_cost: u32,
    /// Parallelism.
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 65_536,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

fn derive_key(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<LessSafeKey, CryptoError> {
    let argon_params = argon2::Params::new(params.m_cost, params.t_cost, params.p_cost, Some(KEY_LEN))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon_params);

    let mut key_bytes = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(password.as_bytes(), salt, key_bytes.as_mut_slice())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes.as_slice())
        .map_err(|_| CryptoError::KeyDerivation("invalid key length".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `password`.
pub fn encrypt_store(
    plaintext: &[u8],
    password: &str,
    params: &KdfParams,
) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| CryptoError::Rng)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Rng)?;

    let key = derive_key(password, &salt, params)?;

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(&HEADER),
        &mut in_out,
    )
    .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(MIN_STORE_LEN + plaintext.len());
    out.extend_from_slice(&HEADER);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Decrypt a store blob. Wrong password and corruption are indistinguishable.
pub fn decrypt_store(
    data: &[u8],
    password: &str,
    params: &KdfParams,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < MIN_STORE_LEN {
        return Err(CryptoError::StoreTooShort(data.len()));
    }
    if data[..HEADER.len()] != HEADER {
        return Err(CryptoError::UnsupportedStoreHeader);
    }

    let salt = &data[HEADER.len()..HEADER.len() + SALT_LEN];
    let nonce_start = HEADER.len() + SALT_LEN;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&data[nonce_start..nonce_start + NONCE_LEN]);

    let key = derive_key(password, salt, params)?;

    let mut in_out = Zeroizing::new(data[nonce_start + NONCE_LEN..].to_vec());
    let plaintext_len = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&HEADER),
            in_out.as_mut_slice(),
        )
        .map_err(|_| {
            debug!(len = data.len(), "store authentication failed");
            CryptoError::DecryptionFailed
        })?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

/// Check if data starts with the supported header and is long enough.
pub fn has_valid_header(data: &[u8]) -> bool {
    data.len() >= MIN_STORE_LEN && data[..HEADER.len()] == HEADER
}
