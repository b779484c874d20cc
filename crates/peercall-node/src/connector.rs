//! Outgoing connection establishment.
//!
//! Candidates are tried one at a time in order, last working address
//! first; the first TCP connect that succeeds wins. There is no racing.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use peercall_crypto::PublicKey;

use crate::address::resolve_candidates;
use crate::contacts::{Contact, ContactDirectory};
use crate::error::CallError;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Port assumed for stored addresses that do not carry one.
    pub port: u16,
    /// Per-candidate connect timeout.
    pub timeout: Duration,
    pub use_neighbor_table: bool,
}

/// Ordered, duplicate-free candidate list for one attempt.
///
/// Returns the list and the number of host names that failed to resolve.
pub async fn candidate_addresses(
    contact: &Contact,
    opts: &ConnectOptions,
) -> (Vec<SocketAddr>, usize) {
    let resolved = resolve_candidates(contact, opts).await;
    let mut out: Vec<SocketAddr> = Vec::with_capacity(resolved.addrs.len() + 1);
    out.extend(contact.last_working_address);
    for addr in resolved.addrs {
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    (out, resolved.unresolved_hosts)
}

/// Connect to `key`'s first reachable candidate and remember it as the
/// contact's last working address.
pub async fn connect(
    contacts: &ContactDirectory,
    key: &PublicKey,
    opts: &ConnectOptions,
) -> Result<(TcpStream, SocketAddr), CallError> {
    let contact = contacts.get(key).ok_or(CallError::UnknownContact)?;
    let (candidates, unresolved) = candidate_addresses(&contact, opts).await;

    if candidates.is_empty() {
        debug!(contact = %contact.name, "no candidate addresses");
        return Err(if unresolved > 0 {
            CallError::UnresolvedHost
        } else {
            CallError::NoRoute
        });
    }

    let mut all_refused = true;
    for addr in &candidates {
        match tokio::time::timeout(opts.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                info!(contact = %contact.name, peer = %addr, "connected");
                contacts.set_last_working_address(key, *addr);
                return Ok((stream, *addr));
            }
            Ok(Err(e)) => {
                debug!(contact = %contact.name, peer = %addr, "connect failed: {e}");
                if e.kind() != io::ErrorKind::ConnectionRefused {
                    all_refused = false;
                }
            }
            Err(_) => {
                debug!(contact = %contact.name, peer = %addr, "connect timed out");
                all_refused = false;
            }
        }
    }

    Err(if all_refused {
        CallError::NotListening
    } else {
        CallError::NoRoute
    })
}
