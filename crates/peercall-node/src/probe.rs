//! Liveness probing and offline broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use peercall_crypto::PublicKey;
use peercall_protocol::{PeerStatus, SignalMessage};

use crate::connector::connect;
use crate::contacts::ContactState;
use crate::error::CallError;
use crate::node::NodeContext;
use crate::session::Session;

/// Probe one contact: connect, `ping`, wait for `pong`.
pub(crate) async fn probe_contact(ctx: &NodeContext, key: &PublicKey) -> Result<(), CallError> {
    let opts = ctx.config.connect_options();
    let (stream, addr) = connect(&ctx.contacts, key, &opts).await?;
    let mut session = Session::connect(stream, ctx.identity.clone(), *key, addr);

    let exchange = async {
        session.send(&SignalMessage::Ping).await?;
        loop {
            match session.recv().await? {
                SignalMessage::Pong => break,
                other => debug!(peer = %addr, action = other.action(), "ignored while probing"),
            }
        }
        Ok::<(), CallError>(())
    };
    let result = match tokio::time::timeout(ctx.config.probe_timeout(), exchange).await {
        Ok(r) => r,
        Err(_) => Err(CallError::Io("no pong before timeout".into())),
    };
    session.close().await;
    result
}

/// One pass over every non-blocked contact. Failures only affect the
/// contact that failed.
pub(crate) async fn probe_contacts(ctx: &NodeContext) {
    let keys: Vec<PublicKey> = ctx
        .contacts
        .list()
        .into_iter()
        .filter(|c| !c.blocked)
        .map(|c| c.public_key)
        .collect();

    for key in keys {
        let state = match probe_contact(ctx, &key).await {
            Ok(()) => ContactState::Online,
            Err(e) => {
                debug!(key = %key, "probe failed: {e}");
                ContactState::Offline
            }
        };
        ctx.set_contact_state(&key, state);
    }
}

pub(crate) fn spawn_probe_loop(ctx: Arc<NodeContext>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            probe_contacts(&ctx).await;
        }
    })
}

/// Best-effort `status_change{offline}` to every contact currently online.
pub(crate) async fn broadcast_offline(ctx: &NodeContext) {
    let online = ctx.contacts.online_contacts();
    info!(count = online.len(), "broadcasting offline status");
    let opts = ctx.config.connect_options();

    for key in online {
        let (stream, addr) = match connect(&ctx.contacts, &key, &opts).await {
            Ok(c) => c,
            Err(e) => {
                debug!(key = %key, "offline notice not delivered: {e}");
                continue;
            }
        };
        let mut session = Session::connect(stream, ctx.identity.clone(), key, addr);
        let notice = SignalMessage::StatusChange {
            status: PeerStatus::Offline,
        };
        if let Err(e) = session.send(&notice).await {
            debug!(key = %key, "offline notice not delivered: {e}");
        }
        session.close().await;
    }
}
