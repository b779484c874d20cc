use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use peercall_crypto::{IdentityKeyPair, PublicKey};

use crate::call::{self, CallHandle, CallRegistry};
use crate::config::NodeConfig;
use crate::contacts::{ContactDirectory, ContactState};
use crate::error::{CallError, NodeError};
use crate::events::{CallId, EventSender, MediaEngine, NodeEvent};
use crate::listener;
use crate::persistence::StoreSnapshot;
use crate::probe;

/// State shared by the accept loop, connection tasks, call tasks and probes.
pub(crate) struct NodeContext {
    pub(crate) identity: Arc<IdentityKeyPair>,
    pub(crate) contacts: ContactDirectory,
    pub(crate) config: NodeConfig,
    pub(crate) media: Arc<dyn MediaEngine>,
    pub(crate) events: EventSender,
    pub(crate) calls: CallRegistry,
}

impl NodeContext {
    pub(crate) fn new(
        identity: Arc<IdentityKeyPair>,
        contacts: ContactDirectory,
        config: NodeConfig,
        media: Arc<dyn MediaEngine>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = EventSender::channel();
        let ctx = Arc::new(Self {
            identity,
            contacts,
            config,
            media,
            events,
            calls: CallRegistry::new(),
        });
        (ctx, rx)
    }

    /// Update a contact's state, emitting an event if it changed.
    pub(crate) fn set_contact_state(&self, key: &PublicKey, state: ContactState) {
        if self.contacts.set_state(key, state) {
            debug!(key = %key, state = ?state, "contact state changed");
            self.events
                .emit(NodeEvent::ContactStatus { peer: *key, state });
        }
    }
}

/// A running signaling node.
pub struct Node {
    ctx: Arc<NodeContext>,
    local_addr: SocketAddr,
    listener_task: JoinHandle<()>,
    probe_task: Option<JoinHandle<()>>,
}

impl Node {
    /// Bind the listening socket and start accepting. Events for the UI
    /// arrive on the returned receiver.
    pub async fn start(
        config: NodeConfig,
        identity: IdentityKeyPair,
        contacts: ContactDirectory,
        media: Arc<dyn MediaEngine>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let listener = listener::bind(&config.host, config.port)?;
        let local_addr = listener.local_addr()?;
        let probe_interval = config.probe_interval();

        let (ctx, events) = NodeContext::new(Arc::new(identity), contacts, config, media);
        info!(addr = %local_addr, key = %ctx.identity.public_key(), "node listening");

        let listener_task = tokio::spawn(listener::accept_loop(listener, ctx.clone()));
        let probe_task = probe_interval.map(|period| probe::spawn_probe_loop(ctx.clone(), period));

        Ok((
            Self {
                ctx,
                local_addr,
                listener_task,
                probe_task,
            },
            events,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_key(&self) -> PublicKey {
        self.ctx.identity.public_key()
    }

    pub fn contacts(&self) -> &ContactDirectory {
        &self.ctx.contacts
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    /// Call a known contact. Progress is reported on the returned handle
    /// and as events.
    pub fn place_call(&self, peer: &PublicKey) -> Result<CallHandle, CallError> {
        call::place_call(&self.ctx, *peer)
    }

    pub fn call(&self, id: CallId) -> Option<CallHandle> {
        self.ctx.calls.get(id)
    }

    pub fn active_calls(&self) -> Vec<CallHandle> {
        self.ctx.calls.handles()
    }

    pub fn accept_call(&self, id: CallId) -> Result<(), CallError> {
        self.live_call(id)?.accept()
    }

    pub fn decline_call(&self, id: CallId) -> Result<(), CallError> {
        self.live_call(id)?.decline()
    }

    pub fn hangup(&self, id: CallId) -> Result<(), CallError> {
        self.live_call(id)?.hangup()
    }

    fn live_call(&self, id: CallId) -> Result<CallHandle, CallError> {
        self.ctx.calls.get(id).ok_or(CallError::UnknownCall(id))
    }

    /// Run one liveness pass over all non-blocked contacts.
    pub async fn probe_contacts(&self) {
        probe::probe_contacts(&self.ctx).await;
    }

    /// Identity and contacts in persistable form.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot::new(&self.ctx.identity, &self.ctx.contacts)
    }

    /// Stop probing, hang up live calls, tell online contacts we are going
    /// offline, then stop accepting.
    pub async fn shutdown(&self) {
        if let Some(task) = &self.probe_task {
            task.abort();
        }
        for handle in self.ctx.calls.handles() {
            let _ = handle.hangup();
        }
        probe::broadcast_offline(&self.ctx).await;
        self.listener_task.abort();
        info!("node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.listener_task.abort();
        if let Some(task) = &self.probe_task {
            task.abort();
        }
    }
}
