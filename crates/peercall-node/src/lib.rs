//! PeerCall node: serverless call signaling between known peers.
//!
//! A [`Node`] owns the identity key pair, the contact directory and the
//! listening socket. Outgoing calls resolve a contact's candidate addresses,
//! connect to the first one that answers, and run the signaling handshake;
//! incoming connections are authenticated by the signature embedded in every
//! message and routed to the call machinery or the liveness responder.

pub mod address;
pub mod call;
pub mod config;
pub mod connector;
pub mod contacts;
pub mod error;
pub mod events;
pub mod listener;
pub mod node;
pub mod persistence;
pub mod probe;
pub mod session;

pub use call::{CallCommand, CallHandle, CallRegistry};
pub use config::NodeConfig;
pub use contacts::{Contact, ContactDirectory, ContactRecord, ContactState};
pub use error::{CallError, NodeError};
pub use events::{CallId, CallState, Direction, MediaEngine, NodeEvent, NullMedia};
pub use node::Node;
pub use persistence::StoreSnapshot;
