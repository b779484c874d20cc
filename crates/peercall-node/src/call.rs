//! The call state machine.
//!
//! Each call runs on its own task that owns the signaling socket. User
//! decisions reach it as [`CallCommand`]s through the [`CallHandle`]; the
//! task publishes every state change on a `watch` channel and as a
//! [`NodeEvent`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use peercall_crypto::PublicKey;
use peercall_protocol::SignalMessage;

use crate::connector::connect;
use crate::contacts::ContactState;
use crate::error::CallError;
use crate::events::{CallId, CallState, Direction, NodeEvent};
use crate::node::NodeContext;
use crate::session::{Session, SessionError};

/// A user decision for a live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    /// Accept a ringing incoming call.
    Accept,
    /// Reject a ringing incoming call (the caller sees `Dismissed`).
    Decline,
    /// End the call in any state.
    Hangup,
}

/// Caller-side view of a call: current state plus a command channel.
#[derive(Clone)]
pub struct CallHandle {
    id: CallId,
    peer: PublicKey,
    direction: Direction,
    commands: mpsc::UnboundedSender<CallCommand>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn peer(&self) -> PublicKey {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// Wait until the state satisfies `pred` and return it.
    ///
    /// If the call task is gone, returns the last state it published.
    pub async fn wait_for(&self, mut pred: impl FnMut(&CallState) -> bool) -> CallState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| pred(s)).await.map(|s| (*s).clone());
        match reached {
            Ok(state) => state,
            Err(_) => rx.borrow().clone(),
        }
    }

    pub async fn wait_for_terminal(&self) -> CallState {
        self.wait_for(CallState::is_terminal).await
    }

    pub fn accept(&self) -> Result<(), CallError> {
        self.send(CallCommand::Accept)
    }

    pub fn decline(&self) -> Result<(), CallError> {
        self.send(CallCommand::Decline)
    }

    pub fn hangup(&self) -> Result<(), CallError> {
        self.send(CallCommand::Hangup)
    }

    fn send(&self, cmd: CallCommand) -> Result<(), CallError> {
        self.commands
            .send(cmd)
            .map_err(|_| CallError::UnknownCall(self.id))
    }
}

/// Live calls by id. A call is removed when it reaches a terminal state.
#[derive(Default)]
pub struct CallRegistry {
    calls: DashMap<CallId, CallHandle>,
    next_id: AtomicU64,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> CallId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, handle: CallHandle) {
        self.calls.insert(handle.id, handle);
    }

    pub fn get(&self, id: CallId) -> Option<CallHandle> {
        self.calls.get(&id).map(|h| h.clone())
    }

    pub fn remove(&self, id: CallId) -> Option<CallHandle> {
        self.calls.remove(&id).map(|(_, h)| h)
    }

    pub fn handles(&self) -> Vec<CallHandle> {
        self.calls.iter().map(|h| h.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Start an outgoing call to a known, non-blocked contact.
pub(crate) fn place_call(ctx: &Arc<NodeContext>, peer: PublicKey) -> Result<CallHandle, CallError> {
    let contact = ctx.contacts.get(&peer).ok_or(CallError::UnknownContact)?;
    if contact.blocked {
        return Err(CallError::Blocked);
    }

    let (task, handle) = CallTask::new(ctx.clone(), peer, Direction::Outgoing);
    ctx.calls.insert(handle.clone());
    info!(call_id = handle.id, contact = %contact.name, "placing call");
    tokio::spawn(task.run_outgoing());
    Ok(handle)
}

/// Take over an accepted connection whose first message was `call`.
///
/// Runs on the connection's task until the call ends.
pub(crate) async fn run_incoming(
    ctx: &Arc<NodeContext>,
    session: Session,
    offer: String,
    name: Option<String>,
) {
    let Some(peer) = session.peer() else {
        return;
    };
    let (task, handle) = CallTask::new(ctx.clone(), peer, Direction::Incoming);
    ctx.calls.insert(handle);
    task.run_incoming(session, offer, name).await;
}

struct CallTask {
    ctx: Arc<NodeContext>,
    id: CallId,
    peer: PublicKey,
    direction: Direction,
    state: watch::Sender<CallState>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
}

impl CallTask {
    fn new(ctx: Arc<NodeContext>, peer: PublicKey, direction: Direction) -> (Self, CallHandle) {
        let id = ctx.calls.next_id();
        let (state_tx, state_rx) = watch::channel(CallState::Waiting);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = CallHandle {
            id,
            peer,
            direction,
            commands: cmd_tx,
            state: state_rx,
        };
        let task = Self {
            ctx,
            id,
            peer,
            direction,
            state: state_tx,
            commands: cmd_rx,
        };
        (task, handle)
    }

    fn transition(&self, state: CallState) {
        info!(call_id = self.id, peer = %self.peer, state = ?state, "call state changed");
        if state.is_terminal() {
            self.ctx.calls.remove(self.id);
        }
        self.state.send_replace(state.clone());
        self.ctx.events.emit(NodeEvent::CallState {
            call_id: self.id,
            peer: self.peer,
            direction: self.direction,
            state,
        });
    }

    fn fail(&self, error: CallError) {
        if let Some(contact_state) = error.contact_state() {
            self.ctx.set_contact_state(&self.peer, contact_state);
        }
        self.transition(CallState::Error(error));
    }

    /// Close the socket, then report the failure.
    async fn abort(&self, session: Session, error: CallError) {
        warn!(call_id = self.id, peer = %session.remote_addr(), "call failed: {error}");
        session.close().await;
        self.fail(error);
    }

    /// Best-effort `dismissed`, then release the socket.
    async fn hang_up(&self, mut session: Session) {
        if let Err(e) = session.send(&SignalMessage::Dismissed).await {
            debug!(call_id = self.id, "dismissed not delivered: {e}");
        }
        session.close().await;
        self.transition(CallState::Ended);
    }

    /// Map a receive failure, reporting key changes.
    fn session_failure(&self, error: SessionError) -> CallError {
        if let SessionError::KeyMismatch { expected, got } = error {
            warn!(call_id = self.id, expected = %expected, got = %got, "peer key changed mid-call");
            self.ctx
                .events
                .emit(NodeEvent::SuspiciousKeyChange { expected, got });
            return CallError::AuthenticationFailed;
        }
        error.into()
    }

    /// Next message from the peer, or `None` if the user hung up first.
    async fn recv_or_hangup(
        &mut self,
        session: &mut Session,
    ) -> Option<Result<SignalMessage, SessionError>> {
        loop {
            tokio::select! {
                msg = session.recv() => return Some(msg),
                cmd = self.commands.recv() => match cmd {
                    Some(CallCommand::Accept) => {
                        debug!(call_id = self.id, "accept ignored in this state");
                    }
                    Some(CallCommand::Decline) | Some(CallCommand::Hangup) | None => return None,
                },
            }
        }
    }

    async fn run_outgoing(mut self) {
        self.transition(CallState::Connecting);

        let opts = self.ctx.config.connect_options();
        let ctx = self.ctx.clone();
        let connected = tokio::select! {
            res = connect(&ctx.contacts, &self.peer, &opts) => res,
            _ = wait_for_hangup(&mut self.commands) => {
                self.transition(CallState::Ended);
                return;
            }
        };
        let (stream, addr) = match connected {
            Ok(c) => c,
            Err(e) => {
                warn!(call_id = self.id, "connect failed: {e}");
                self.fail(e);
                return;
            }
        };

        let mut session = Session::connect(stream, self.ctx.identity.clone(), self.peer, addr);
        let offer = self.ctx.media.create_offer(self.id);
        if let Err(e) = session.send(&SignalMessage::Call { offer }).await {
            let err = self.session_failure(e);
            return self.abort(session, err).await;
        }

        // First response: the callee must be ringing.
        match self.recv_or_hangup(&mut session).await {
            None => return self.hang_up(session).await,
            Some(Ok(SignalMessage::Ringing)) => {
                self.ctx.set_contact_state(&self.peer, ContactState::Online);
                self.transition(CallState::Ringing);
            }
            Some(Ok(other)) => {
                let err = CallError::Protocol(format!("expected ringing, got `{}`", other.action()));
                return self.abort(session, err).await;
            }
            Some(Err(SessionError::Decrypt)) => {
                return self.abort(session, CallError::AuthenticationFailed).await;
            }
            // Blocked callers are dropped without a reply.
            Some(Err(SessionError::Closed)) => {
                return self.abort(session, CallError::Denied).await;
            }
            Some(Err(e)) => {
                let err = self.session_failure(e);
                return self.abort(session, err).await;
            }
        }

        // Second response: the user's decision.
        match self.recv_or_hangup(&mut session).await {
            None => self.hang_up(session).await,
            Some(Ok(SignalMessage::Connected { answer })) => {
                self.ctx.media.set_remote_description(self.id, &answer);
                self.transition(CallState::Connected);
                self.run_connected(session).await;
            }
            Some(Ok(SignalMessage::Dismissed)) => {
                session.close().await;
                self.transition(CallState::Dismissed);
            }
            Some(Ok(other)) => {
                let err = CallError::Protocol(format!("unexpected `{}` while ringing", other.action()));
                self.abort(session, err).await;
            }
            Some(Err(e)) => {
                let err = self.session_failure(e);
                self.abort(session, err).await;
            }
        }
    }

    async fn run_incoming(mut self, mut session: Session, offer: String, name: Option<String>) {
        if let Err(e) = session.send(&SignalMessage::Ringing).await {
            let err = self.session_failure(e);
            return self.abort(session, err).await;
        }
        self.transition(CallState::Ringing);
        self.ctx.events.emit(NodeEvent::IncomingCall {
            call_id: self.id,
            peer: self.peer,
            name,
        });

        loop {
            tokio::select! {
                msg = session.recv() => match msg {
                    // The caller gave up before we answered.
                    Ok(SignalMessage::Dismissed) | Err(SessionError::Closed) => {
                        session.close().await;
                        return self.transition(CallState::Ended);
                    }
                    Ok(other) => {
                        debug!(call_id = self.id, action = other.action(), "ignored while ringing");
                    }
                    Err(e) => {
                        let err = self.session_failure(e);
                        return self.abort(session, err).await;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(CallCommand::Accept) => {
                        let answer = self.ctx.media.create_answer(self.id, &offer);
                        if let Err(e) = session.send(&SignalMessage::Connected { answer }).await {
                            let err = self.session_failure(e);
                            return self.abort(session, err).await;
                        }
                        self.transition(CallState::Connected);
                        return self.run_connected(session).await;
                    }
                    Some(CallCommand::Decline) => {
                        if let Err(e) = session.send(&SignalMessage::Dismissed).await {
                            debug!(call_id = self.id, "dismissed not delivered: {e}");
                        }
                        session.close().await;
                        return self.transition(CallState::Dismissed);
                    }
                    Some(CallCommand::Hangup) | None => return self.hang_up(session).await,
                },
            }
        }
    }

    /// Keep reading until either side ends the call.
    async fn run_connected(&mut self, mut session: Session) {
        loop {
            match self.recv_or_hangup(&mut session).await {
                None => return self.hang_up(session).await,
                Some(Ok(SignalMessage::Dismissed)) | Some(Err(SessionError::Closed)) => {
                    session.close().await;
                    return self.transition(CallState::Ended);
                }
                Some(Ok(other)) => {
                    debug!(call_id = self.id, action = other.action(), "ignored while connected");
                }
                Some(Err(e)) => {
                    let err = self.session_failure(e);
                    return self.abort(session, err).await;
                }
            }
        }
    }
}

/// Resolves once the user hangs up (or every handle is gone).
async fn wait_for_hangup(commands: &mut mpsc::UnboundedReceiver<CallCommand>) {
    loop {
        match commands.recv().await {
            Some(CallCommand::Accept) => continue,
            Some(CallCommand::Decline) | Some(CallCommand::Hangup) | None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::net::TcpListener;

    use peercall_crypto::IdentityKeyPair;
    use peercall_protocol::{encode_message, write_message};

    use crate::config::NodeConfig;
    use crate::contacts::{Contact, ContactDirectory};
    use crate::events::{MediaEngine, NullMedia};

    #[derive(Default)]
    struct RecordingMedia {
        remote: Mutex<Vec<String>>,
    }

    impl MediaEngine for RecordingMedia {
        fn create_offer(&self, call_id: CallId) -> String {
            format!("offer-{call_id}")
        }

        fn create_answer(&self, _call_id: CallId, offer: &str) -> String {
            format!("answer-to-{offer}")
        }

        fn set_remote_description(&self, _call_id: CallId, description: &str) {
            self.remote.lock().unwrap().push(description.to_string());
        }
    }

    struct Callee {
        identity: Arc<IdentityKeyPair>,
        listener: TcpListener,
    }

    impl Callee {
        async fn new() -> Self {
            Self {
                identity: Arc::new(IdentityKeyPair::generate()),
                listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        async fn accept(&self) -> Session {
            let (stream, addr) = self.listener.accept().await.unwrap();
            Session::accept(stream, self.identity.clone(), addr)
        }
    }

    fn caller_for(
        callee: &Callee,
        media: Arc<dyn MediaEngine>,
    ) -> (Arc<NodeContext>, PublicKey, mpsc::UnboundedReceiver<NodeEvent>) {
        let contacts = ContactDirectory::new();
        let key = callee.identity.public_key();
        let addr = callee.listener.local_addr().unwrap();
        contacts.add(Contact::new("callee", key, vec![addr.to_string()]));
        let (ctx, rx) = NodeContext::new(
            Arc::new(IdentityKeyPair::generate()),
            contacts,
            NodeConfig::default(),
            media,
        );
        (ctx, key, rx)
    }

    #[tokio::test]
    async fn ringing_then_connected() {
        let callee = Callee::new().await;
        let media = Arc::new(RecordingMedia::default());
        let (ctx, key, _rx) = caller_for(&callee, media.clone());

        let handle = place_call(&ctx, key).unwrap();
        let mut session = callee.accept().await;
        let offer = match session.recv().await.unwrap() {
            SignalMessage::Call { offer } => offer,
            other => panic!("expected call, got {other:?}"),
        };
        assert_eq!(offer, format!("offer-{}", handle.id()));

        session.send(&SignalMessage::Ringing).await.unwrap();
        assert_eq!(
            handle.wait_for(|s| *s == CallState::Ringing || s.is_terminal()).await,
            CallState::Ringing
        );
        assert_eq!(ctx.contacts.get(&key).unwrap().state, ContactState::Online);

        session
            .send(&SignalMessage::Connected { answer: "sdp".into() })
            .await
            .unwrap();
        assert_eq!(
            handle.wait_for(|s| *s == CallState::Connected || s.is_terminal()).await,
            CallState::Connected
        );
        assert_eq!(*media.remote.lock().unwrap(), vec!["sdp".to_string()]);

        // Peer hangs up.
        session.send(&SignalMessage::Dismissed).await.unwrap();
        assert_eq!(handle.wait_for_terminal().await, CallState::Ended);
        assert!(ctx.calls.get(handle.id()).is_none());
    }

    #[tokio::test]
    async fn ringing_then_dismissed() {
        let callee = Callee::new().await;
        let (ctx, key, _rx) = caller_for(&callee, Arc::new(NullMedia));

        let handle = place_call(&ctx, key).unwrap();
        let mut session = callee.accept().await;
        session.recv().await.unwrap();
        session.send(&SignalMessage::Ringing).await.unwrap();
        session.send(&SignalMessage::Dismissed).await.unwrap();

        assert_eq!(handle.wait_for_terminal().await, CallState::Dismissed);
    }

    #[tokio::test]
    async fn impostor_reply_is_an_authentication_error() {
        let callee = Callee::new().await;
        let (ctx, key, mut rx) = caller_for(&callee, Arc::new(NullMedia));
        let mallory = IdentityKeyPair::generate();

        let handle = place_call(&ctx, key).unwrap();
        let (mut raw, _) = callee.listener.accept().await.unwrap();

        let ringing = encode_message(&SignalMessage::Ringing).unwrap();
        let sealed = mallory
            .seal_to(&ctx.identity.public_key(), &ringing)
            .unwrap();
        write_message(&mut raw, &sealed).await.unwrap();

        assert_eq!(
            handle.wait_for_terminal().await,
            CallState::Error(CallError::AuthenticationFailed)
        );
        assert_eq!(
            ctx.contacts.get(&key).unwrap().state,
            ContactState::AuthenticationFailed
        );

        let mut saw_key_change = false;
        while let Ok(event) = rx.try_recv() {
            if let NodeEvent::SuspiciousKeyChange { expected, got } = event {
                assert_eq!(expected, key);
                assert_eq!(got, mallory.public_key());
                saw_key_change = true;
            }
        }
        assert!(saw_key_change);
    }

    #[tokio::test]
    async fn undecryptable_reply_is_an_authentication_error() {
        let callee = Callee::new().await;
        let (ctx, key, _rx) = caller_for(&callee, Arc::new(NullMedia));

        let handle = place_call(&ctx, key).unwrap();
        let (mut raw, _) = callee.listener.accept().await.unwrap();
        write_message(&mut raw, &[0x55; 160]).await.unwrap();

        assert_eq!(
            handle.wait_for_terminal().await,
            CallState::Error(CallError::AuthenticationFailed)
        );
    }

    #[tokio::test]
    async fn silent_drop_is_denied() {
        let callee = Callee::new().await;
        let (ctx, key, _rx) = caller_for(&callee, Arc::new(NullMedia));

        let handle = place_call(&ctx, key).unwrap();
        let mut session = callee.accept().await;
        session.recv().await.unwrap();
        session.close().await;

        assert_eq!(
            handle.wait_for_terminal().await,
            CallState::Error(CallError::Denied)
        );
    }

    #[tokio::test]
    async fn local_hangup_while_ringing_sends_dismissed() {
        let callee = Callee::new().await;
        let (ctx, key, _rx) = caller_for(&callee, Arc::new(NullMedia));

        let handle = place_call(&ctx, key).unwrap();
        let mut session = callee.accept().await;
        session.recv().await.unwrap();
        session.send(&SignalMessage::Ringing).await.unwrap();
        handle.wait_for(|s| *s == CallState::Ringing).await;

        handle.hangup().unwrap();
        assert_eq!(session.recv().await.unwrap(), SignalMessage::Dismissed);
        assert_eq!(handle.wait_for_terminal().await, CallState::Ended);
    }

    #[tokio::test]
    async fn unknown_and_blocked_contacts_are_rejected_up_front() {
        let callee = Callee::new().await;
        let (ctx, key, _rx) = caller_for(&callee, Arc::new(NullMedia));

        let stranger = IdentityKeyPair::generate().public_key();
        assert!(matches!(
            place_call(&ctx, stranger),
            Err(CallError::UnknownContact)
        ));

        ctx.contacts.set_blocked(&key, true);
        assert!(matches!(place_call(&ctx, key), Err(CallError::Blocked)));
        assert!(ctx.calls.is_empty());
    }

    #[tokio::test]
    async fn unreachable_contact_records_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let contacts = ContactDirectory::new();
        let key = IdentityKeyPair::generate().public_key();
        contacts.add(Contact::new("gone", key, vec![dead.to_string()]));
        let (ctx, _rx) = NodeContext::new(
            Arc::new(IdentityKeyPair::generate()),
            contacts,
            NodeConfig::default(),
            Arc::new(NullMedia),
        );

        let handle = place_call(&ctx, key).unwrap();
        assert_eq!(
            handle.wait_for_terminal().await,
            CallState::Error(CallError::NotListening)
        );
        assert_eq!(
            ctx.contacts.get(&key).unwrap().state,
            ContactState::AppNotRunning
        );
    }

    #[test]
    fn registry_ids_are_monotonic() {
        let registry = CallRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(b > a);
        assert!(registry.is_empty());
    }
}
