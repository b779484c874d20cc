//! The contact directory.
//!
//! All reads and writes go through [`ContactDirectory`]; callers get
//! snapshots, never references into the table. Concurrent writes to the
//! same contact are serialized by the per-key shard lock, last writer wins.

use std::net::SocketAddr;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use peercall_crypto::PublicKey;

/// Reachability of a contact as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactState {
    Online,
    Offline,
    /// Not contacted yet in this session.
    Pending,
    NetworkUnreachable,
    AuthenticationFailed,
    AppNotRunning,
    UnresolvedHost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub public_key: PublicKey,
    /// Ordered, duplicate-free: IPv4/IPv6 literals, MAC addresses or host names,
    /// each optionally with a `:port`.
    pub addresses: Vec<String>,
    pub last_working_address: Option<SocketAddr>,
    pub blocked: bool,
    pub state: ContactState,
}

impl Contact {
    pub fn new(name: impl Into<String>, public_key: PublicKey, addresses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            public_key,
            addresses: dedup_addresses(addresses),
            last_working_address: None,
            blocked: false,
            state: ContactState::Pending,
        }
    }

    pub fn to_record(&self) -> ContactRecord {
        ContactRecord {
            name: self.name.clone(),
            public_key: self.public_key,
            addresses: self.addresses.clone(),
            blocked: self.blocked,
        }
    }
}

/// Persistent part of a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub name: String,
    pub public_key: PublicKey,
    pub addresses: Vec<String>,
    pub blocked: bool,
}

impl From<ContactRecord> for Contact {
    fn from(record: ContactRecord) -> Self {
        let mut contact = Contact::new(record.name, record.public_key, record.addresses);
        contact.blocked = record.blocked;
        contact
    }
}

fn dedup_addresses(addresses: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(addresses.len());
    for addr in addresses {
        let addr = addr.trim().to_string();
        if !addr.is_empty() && !out.contains(&addr) {
            out.push(addr);
        }
    }
    out
}

/// Thread-safe table of known peers keyed by public key.
#[derive(Default)]
pub struct ContactDirectory {
    contacts: DashMap<PublicKey, Contact>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ContactRecord>) -> Self {
        let directory = Self::new();
        for record in records {
            directory.add(record.into());
        }
        directory
    }

    /// Insert a new contact. Returns `false` if the key is already present.
    pub fn add(&self, contact: Contact) -> bool {
        match self.contacts.entry(contact.public_key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(contact);
                true
            }
        }
    }

    pub fn remove(&self, key: &PublicKey) -> Option<Contact> {
        self.contacts.remove(key).map(|(_, c)| c)
    }

    pub fn get(&self, key: &PublicKey) -> Option<Contact> {
        self.contacts.get(key).map(|c| c.clone())
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.contacts.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Snapshot of every contact, sorted by name.
    pub fn list(&self) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.contacts.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn find_by_name(&self, name: &str) -> Option<Contact> {
        self.contacts
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.clone())
    }

    /// Keys of contacts currently `Online`.
    pub fn online_contacts(&self) -> Vec<PublicKey> {
        self.contacts
            .iter()
            .filter(|c| c.state == ContactState::Online)
            .map(|c| c.public_key)
            .collect()
    }

    pub fn records(&self) -> Vec<ContactRecord> {
        self.list().iter().map(Contact::to_record).collect()
    }

    /// Set a contact's state. Returns `true` if the value changed.
    pub fn set_state(&self, key: &PublicKey, state: ContactState) -> bool {
        match self.contacts.get_mut(key) {
            Some(mut c) if c.state != state => {
                c.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn set_last_working_address(&self, key: &PublicKey, addr: SocketAddr) {
        if let Some(mut c) = self.contacts.get_mut(key) {
            c.last_working_address = Some(addr);
        }
    }

    pub fn rename(&self, key: &PublicKey, name: impl Into<String>) -> bool {
        self.update(key, |c| c.name = name.into())
    }

    pub fn set_blocked(&self, key: &PublicKey, blocked: bool) -> bool {
        self.update(key, |c| c.blocked = blocked)
    }

    pub fn set_addresses(&self, key: &PublicKey, addresses: Vec<String>) -> bool {
        self.update(key, |c| {
            c.addresses = dedup_addresses(addresses);
            c.last_working_address = None;
        })
    }

    fn update(&self, key: &PublicKey, f: impl FnOnce(&mut Contact)) -> bool {
        match self.contacts.get_mut(key) {
            Some(mut c) => {
                f(&mut c);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peercall_crypto::IdentityKeyPair;

    fn key() -> PublicKey {
        IdentityKeyPair::generate().public_key()
    }

    #[test]
    fn one_contact_per_key() {
        let dir = ContactDirectory::new();
        let k = key();
        assert!(dir.add(Contact::new("alice", k, vec![])));
        assert!(!dir.add(Contact::new("mallory", k, vec![])));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get(&k).unwrap().name, "alice");
    }

    #[test]
    fn addresses_are_an_ordered_set() {
        let c = Contact::new(
            "bob",
            key(),
            vec![
                "10.0.0.2".into(),
                " 10.0.0.2 ".into(),
                "bob.lan".into(),
                "".into(),
                "aa:bb:cc:dd:ee:ff".into(),
            ],
        );
        assert_eq!(c.addresses, vec!["10.0.0.2", "bob.lan", "aa:bb:cc:dd:ee:ff"]);
        assert_eq!(c.state, ContactState::Pending);
    }

    #[test]
    fn set_state_reports_changes() {
        let dir = ContactDirectory::new();
        let k = key();
        dir.add(Contact::new("carol", k, vec![]));
        assert!(dir.set_state(&k, ContactState::Online));
        assert!(!dir.set_state(&k, ContactState::Online));
        assert_eq!(dir.online_contacts(), vec![k]);
        assert!(!dir.set_state(&key(), ContactState::Online));
    }

    #[test]
    fn last_working_address_is_cleared_when_addresses_change() {
        let dir = ContactDirectory::new();
        let k = key();
        dir.add(Contact::new("dave", k, vec!["10.0.0.9".into()]));
        dir.set_last_working_address(&k, "10.0.0.9:10001".parse().unwrap());
        assert!(dir.get(&k).unwrap().last_working_address.is_some());

        dir.set_addresses(&k, vec!["10.0.0.10".into()]);
        let c = dir.get(&k).unwrap();
        assert_eq!(c.addresses, vec!["10.0.0.10"]);
        assert!(c.last_working_address.is_none());
    }

    #[test]
    fn records_roundtrip() {
        let dir = ContactDirectory::new();
        let k = key();
        dir.add(Contact::new("erin", k, vec!["erin.lan".into()]));
        dir.set_blocked(&k, true);
        dir.set_state(&k, ContactState::Online);

        let restored = ContactDirectory::from_records(dir.records());
        let c = restored.get(&k).unwrap();
        assert_eq!(c.name, "erin");
        assert!(c.blocked);
        // Runtime state is not persisted.
        assert_eq!(c.state, ContactState::Pending);
    }

    #[test]
    fn list_is_sorted_and_find_by_name_works() {
        let dir = ContactDirectory::new();
        dir.add(Contact::new("zoe", key(), vec![]));
        dir.add(Contact::new("amy", key(), vec![]));
        let names: Vec<String> = dir.list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["amy", "zoe"]);
        assert!(dir.find_by_name("zoe").is_some());
        assert!(dir.find_by_name("nobody").is_none());
        assert!(dir.rename(&dir.find_by_name("amy").unwrap().public_key, "amelia"));
        assert!(dir.find_by_name("amelia").is_some());
    }
}
