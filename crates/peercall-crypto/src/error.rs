use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("secret key does not match public key")]
    KeyMismatch,

    #[error("encryption failed")]
    EncryptionFailed,

    /// Uniform outcome for every open/verify failure.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("store data too short: {0} bytes")]
    StoreTooShort(usize),

    #[error("unsupported store header")]
    UnsupportedStoreHeader,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("random number generator failed")]
    Rng,
}
