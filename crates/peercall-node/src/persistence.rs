//! Encrypted on-disk store for the identity key pair and contacts.
//!
//! The snapshot is serialized with postcard and wrapped by
//! [`peercall_crypto::encrypt_store`] (Argon2id + AES-256-GCM).
//! Runtime contact state is not persisted.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::{Zeroize, Zeroizing};

use peercall_crypto::{decrypt_store, encrypt_store, IdentityKeyPair, KdfParams, PublicKey};

use crate::contacts::{ContactDirectory, ContactRecord};
use crate::error::NodeError;

#[derive(Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub public_key: PublicKey,
    secret_key: Vec<u8>,
    pub contacts: Vec<ContactRecord>,
}

impl StoreSnapshot {
    pub fn new(identity: &IdentityKeyPair, contacts: &ContactDirectory) -> Self {
        Self {
            public_key: identity.public_key(),
            secret_key: identity.secret_bytes().to_vec(),
            contacts: contacts.records(),
        }
    }

    /// Rebuild the key pair and directory. A secret that does not match the
    /// stored public key is corrupt key material.
    pub fn restore(&self) -> Result<(IdentityKeyPair, ContactDirectory), NodeError> {
        let identity = IdentityKeyPair::from_parts(self.public_key.as_bytes(), &self.secret_key)?;
        let contacts = ContactDirectory::from_records(self.contacts.iter().cloned());
        Ok((identity, contacts))
    }

    pub fn encrypt(&self, password: &str, params: &KdfParams) -> Result<Vec<u8>, NodeError> {
        let plaintext = Zeroizing::new(postcard::to_allocvec(self)?);
        Ok(encrypt_store(&plaintext, password, params)?)
    }

    pub fn decrypt(data: &[u8], password: &str, params: &KdfParams) -> Result<Self, NodeError> {
        let plaintext = decrypt_store(data, password, params)?;
        Ok(postcard::from_bytes(&plaintext)?)
    }
}

impl Drop for StoreSnapshot {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// Encrypt and write the store, replacing any previous file.
pub fn save_store(
    path: &Path,
    snapshot: &StoreSnapshot,
    password: &str,
    params: &KdfParams,
) -> Result<(), NodeError> {
    let data = snapshot.encrypt(password, params)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &data)?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), contacts = snapshot.contacts.len(), "store saved");
    Ok(())
}

pub fn load_store(path: &Path, password: &str, params: &KdfParams) -> Result<StoreSnapshot, NodeError> {
    let data = std::fs::read(path)?;
    StoreSnapshot::decrypt(&data, password, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::Contact;
    use peercall_crypto::CryptoError;

    fn cheap() -> KdfParams {
        KdfParams {
            m_cost: 256,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peercall.store");

        let identity = IdentityKeyPair::generate();
        let contacts = ContactDirectory::new();
        let bob = IdentityKeyPair::generate().public_key();
        contacts.add(Contact::new("bob", bob, vec!["bob.lan".into(), "10.0.0.2".into()]));
        contacts.set_blocked(&bob, true);

        save_store(&path, &StoreSnapshot::new(&identity, &contacts), "hunter2", &cheap()).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let snapshot = load_store(&path, "hunter2", &cheap()).unwrap();
        let (restored, restored_contacts) = snapshot.restore().unwrap();
        assert_eq!(restored.public_key(), identity.public_key());
        assert_eq!(*restored.secret_bytes(), *identity.secret_bytes());

        let c = restored_contacts.get(&bob).unwrap();
        assert_eq!(c.name, "bob");
        assert_eq!(c.addresses, vec!["bob.lan", "10.0.0.2"]);
        assert!(c.blocked);
    }

    #[test]
    fn wrong_password_fails() {
        let snapshot = StoreSnapshot::new(&IdentityKeyPair::generate(), &ContactDirectory::new());
        let data = snapshot.encrypt("right", &cheap()).unwrap();
        assert!(matches!(
            StoreSnapshot::decrypt(&data, "wrong", &cheap()),
            Err(NodeError::Store(CryptoError::DecryptionFailed))
        ));
    }

    #[test]
    fn mismatched_key_material_is_rejected() {
        let mut snapshot = StoreSnapshot::new(&IdentityKeyPair::generate(), &ContactDirectory::new());
        snapshot.public_key = IdentityKeyPair::generate().public_key();
        assert!(matches!(
            snapshot.restore(),
            Err(NodeError::Store(CryptoError::KeyMismatch))
        ));
    }
}
