//! One authenticated signaling connection.
//!
//! Every frame on the wire is a sealed, signed [`SignalMessage`]. A session
//! binds to the first verified sender key it sees (or to the contact it
//! dialed) and reports any later message signed by a different key as
//! [`SessionError::KeyMismatch`] without acting on it.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use peercall_crypto::{CryptoError, IdentityKeyPair, PublicKey};
use peercall_protocol::{decode_message, encode_message, write_message, FrameReader};
use peercall_protocol::{ProtocolError, SignalMessage};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection closed")]
    Closed,

    #[error("message could not be decrypted or verified")]
    Decrypt,

    #[error("message signed by {got}, session is bound to {expected}")]
    KeyMismatch { expected: PublicKey, got: PublicKey },

    #[error("no peer key bound to this session")]
    NoPeer,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

pub struct Session {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    identity: Arc<IdentityKeyPair>,
    peer: Option<PublicKey>,
    remote_addr: SocketAddr,
}

impl Session {
    /// Wrap an accepted connection. The peer is learned from the first message.
    pub fn accept(stream: TcpStream, identity: Arc<IdentityKeyPair>, remote_addr: SocketAddr) -> Self {
        Self::new(stream, identity, None, remote_addr)
    }

    /// Wrap an outgoing connection to a known peer.
    pub fn connect(
        stream: TcpStream,
        identity: Arc<IdentityKeyPair>,
        peer: PublicKey,
        remote_addr: SocketAddr,
    ) -> Self {
        Self::new(stream, identity, Some(peer), remote_addr)
    }

    fn new(
        stream: TcpStream,
        identity: Arc<IdentityKeyPair>,
        peer: Option<PublicKey>,
        remote_addr: SocketAddr,
    ) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer: write_half,
            identity,
            peer,
            remote_addr,
        }
    }

    pub fn peer(&self) -> Option<PublicKey> {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Encode, sign, seal and send one message to the bound peer.
    pub async fn send(&mut self, msg: &SignalMessage) -> Result<(), SessionError> {
        let peer = self.peer.ok_or(SessionError::NoPeer)?;
        let plaintext = Zeroizing::new(encode_message(msg)?);
        let sealed = self
            .identity
            .seal_to(&peer, &plaintext)
            .map_err(SessionError::Crypto)?;
        write_message(&mut self.writer, &sealed).await?;
        trace!(peer = %self.remote_addr, action = msg.action(), "sent");
        Ok(())
    }

    /// Receive, open and verify the next message.
    ///
    /// Cancel-safe: partially received frames stay buffered, so this can be
    /// used as a `select!` branch.
    pub async fn recv(&mut self) -> Result<SignalMessage, SessionError> {
        let frame = self
            .reader
            .read_message()
            .await?
            .ok_or(SessionError::Closed)?;

        let (plaintext, sender) = self
            .identity
            .open(&frame)
            .map_err(|_| SessionError::Decrypt)?;
        let plaintext = Zeroizing::new(plaintext);

        match self.peer {
            None => self.peer = Some(sender),
            Some(expected) if expected != sender => {
                return Err(SessionError::KeyMismatch {
                    expected,
                    got: sender,
                });
            }
            Some(_) => {}
        }

        let msg = decode_message(&plaintext)?;
        trace!(peer = %self.remote_addr, action = msg.action(), "received");
        Ok(msg)
    }

    /// Shut down the write side and drop the connection.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(peer = %self.remote_addr, "shutdown failed: {e}");
        }
    }
}
