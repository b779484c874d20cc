//! Inbound connections.
//!
//! One task accepts; each accepted connection gets its own task, so a bad
//! peer can only take down its own connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use peercall_protocol::{PeerStatus, SignalMessage};

use crate::call;
use crate::contacts::ContactState;
use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::node::NodeContext;
use crate::session::{Session, SessionError};

const LISTEN_BACKLOG: i32 = 128;

/// Bind the signaling socket. `::` gives a dual-stack listener.
pub fn bind(host: &str, port: u16) -> Result<TcpListener, NodeError> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| NodeError::ListenAddress(host.to_string()))?;
    let addr = SocketAddr::new(ip, port);
    let bind_err = |source| NodeError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false).map_err(bind_err)?;
    }
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

/// Accept connections until the task is aborted.
pub(crate) async fn accept_loop(listener: TcpListener, ctx: Arc<NodeContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "accepted connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, addr, ctx).await;
                });
            }
            Err(e) => {
                error!("accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serve one inbound connection until it closes, fails, or becomes a call.
pub(crate) async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<NodeContext>) {
    let mut session = Session::accept(stream, ctx.identity.clone(), addr);
    let mut screened = false;

    loop {
        let msg = match session.recv().await {
            Ok(msg) => msg,
            Err(SessionError::Closed) => {
                debug!(peer = %addr, "connection closed");
                break;
            }
            Err(SessionError::KeyMismatch { expected, got }) => {
                warn!(peer = %addr, expected = %expected, got = %got, "sender key changed, message discarded");
                ctx.events
                    .emit(NodeEvent::SuspiciousKeyChange { expected, got });
                continue;
            }
            Err(e) => {
                warn!(peer = %addr, "dropping connection: {e}");
                break;
            }
        };

        let Some(caller) = session.peer() else {
            break;
        };
        let contact = ctx.contacts.get(&caller);

        if !screened {
            let rejected = match &contact {
                Some(c) => c.blocked,
                None => ctx.config.block_unknown,
            };
            if rejected {
                info!(peer = %addr, key = %caller, "rejected caller");
                break;
            }
            screened = true;
        }

        match msg {
            SignalMessage::Call { offer } => {
                let name = contact.map(|c| c.name);
                if name.is_some() {
                    ctx.set_contact_state(&caller, ContactState::Online);
                }
                info!(peer = %addr, caller = name.as_deref().unwrap_or("unknown"), "incoming call");
                call::run_incoming(&ctx, session, offer, name).await;
                return;
            }
            SignalMessage::Ping => {
                ctx.set_contact_state(&caller, ContactState::Online);
                if let Err(e) = session.send(&SignalMessage::Pong).await {
                    debug!(peer = %addr, "pong not delivered: {e}");
                    break;
                }
            }
            SignalMessage::StatusChange { status } => {
                let state = match status {
                    PeerStatus::Online => ContactState::Online,
                    PeerStatus::Offline => ContactState::Offline,
                };
                ctx.set_contact_state(&caller, state);
            }
            other => {
                debug!(peer = %addr, action = other.action(), "ignoring message");
            }
        }
    }

    session.close().await;
}
