//! Call signaling: the per-call state machine and the inbound/outbound flows
//! carried over a [`SignalChannel`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use meshcall_crypto::PublicKey;
use meshcall_protocol::{PeerStatus, SignalMessage, TransportError};

use crate::channel::SignalChannel;
use crate::config::Timeouts;
use crate::contact::{Contact, ContactState};
use crate::error::{Error, ProtocolError};
use crate::event::{Direction, Event, Outcome};
use crate::state::NodeState;

pub type CallId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    RemoteDeclined,
    Timeout,
    AuthenticationFailed,
    NetworkError,
    LocalCancel,
    /// Normal end of a connected call.
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Ended(EndReason),
}

impl CallState {
    pub fn is_ended(self) -> bool {
        matches!(self, Self::Ended(_))
    }

    pub fn can_advance_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Ended(_), _) => false,
            (Connected, Ended(_)) => true,
            (_, Ended(EndReason::Hangup)) => false,
            (_, Ended(_)) => true,
            (Idle, Dialing)
            | (Idle, Ringing)
            | (Dialing, OfferSent)
            | (Ringing, OfferReceived)
            | (OfferSent, Answered)
            | (OfferReceived, Answered)
            | (Answered, Connected) => true,
            _ => false,
        }
    }
}

/// Validated call state, published to watchers on every change.
pub struct CallMachine {
    state: CallState,
    state_tx: watch::Sender<CallState>,
}

impl CallMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(CallState::Idle);
        Self {
            state: CallState::Idle,
            state_tx,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub fn advance(&mut self, next: CallState) -> Result<(), ProtocolError> {
        if !self.state.can_advance_to(next) {
            return Err(ProtocolError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.state_tx.send_replace(next);
        Ok(())
    }

    /// The reason `end(reason)` would record. A hangup before the call was
    /// connected counts as a cancel.
    pub fn ending_reason(&self, reason: EndReason) -> EndReason {
        match self.state {
            CallState::Ended(r) => r,
            CallState::Connected => reason,
            _ if reason == EndReason::Hangup => EndReason::LocalCancel,
            _ => reason,
        }
    }

    pub fn end(&mut self, reason: EndReason) -> EndReason {
        let reason = self.ending_reason(reason);
        if !self.state.is_ended() {
            self.state = CallState::Ended(reason);
            self.state_tx.send_replace(self.state);
        }
        reason
    }
}

impl Default for CallMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Local requests for a running call.
#[derive(Debug, Clone)]
pub enum CallCommand {
    /// Cancel, decline or hang up, depending on the state.
    Hangup,
    /// Relay a local connectivity candidate to the peer.
    Candidate(String),
}

/// Control handle for a call that has not ended.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub id: CallId,
    pub peer: PublicKey,
    pub direction: Direction,
    control: mpsc::Sender<CallCommand>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub async fn hangup(&self) {
        let _ = self.control.send(CallCommand::Hangup).await;
    }

    pub async fn send_candidate(&self, candidate: String) {
        let _ = self.control.send(CallCommand::Candidate(candidate)).await;
    }

    /// Wait until `pred` holds for the call state, or the call task is gone.
    pub async fn wait_for(&mut self, pred: impl Fn(CallState) -> bool) -> CallState {
        let reached = self.state.wait_for(|s| pred(*s)).await.map(|state| *state);
        match reached {
            Ok(state) => state,
            Err(_) => *self.state.borrow(),
        }
    }

    pub async fn finished(&mut self) -> CallState {
        self.wait_for(CallState::is_ended).await
    }
}

/// An authenticated incoming offer, as shown to the user.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub id: CallId,
    pub public_key: PublicKey,
    /// `None` for callers not in the address book.
    pub contact_name: Option<String>,
    pub remote: Option<SocketAddr>,
    pub offer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    Accept,
    Decline,
}

/// User-facing side of call handling.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Ask the user whether to take the call. Bounded by the ring timeout.
    async fn incoming_call(&self, call: &IncomingCall) -> CallDecision;

    async fn call_state_changed(&self, _id: CallId, _state: CallState) {}
}

/// The real-time media stack; signaling only moves its opaque strings.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self, call: CallId) -> Result<String, ProtocolError>;

    async fn create_answer(&self, call: CallId, offer: &str) -> Result<String, ProtocolError>;

    async fn apply_answer(&self, call: CallId, answer: &str) -> Result<(), ProtocolError>;

    async fn add_remote_candidate(&self, _call: CallId, _candidate: &str) {}

    async fn close(&self, _call: CallId) {}
}

/// What an inbound connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Pinged,
    StatusUpdated,
    Ended(EndReason),
}

/// Map a channel failure to the reason a call ends with.
pub fn end_reason(e: &Error) -> EndReason {
    match e {
        Error::Crypto(_) | Error::Protocol(ProtocolError::IdentityMismatch) => {
            EndReason::AuthenticationFailed
        }
        Error::Transport(TransportError::Timeout) => EndReason::Timeout,
        _ => EndReason::NetworkError,
    }
}

fn outcome_for(direction: Direction, connected: bool, reason: EndReason) -> Outcome {
    if connected {
        return Outcome::Accepted;
    }
    match (direction, reason) {
        (_, EndReason::NetworkError) => Outcome::Error,
        (Direction::Incoming, EndReason::RemoteDeclined | EndReason::Timeout) => Outcome::Missed,
        (Direction::Incoming, _) => Outcome::Declined,
        (Direction::Outgoing, EndReason::RemoteDeclined | EndReason::LocalCancel) => {
            Outcome::Declined
        }
        (Direction::Outgoing, EndReason::Timeout) => Outcome::Missed,
        (Direction::Outgoing, _) => Outcome::Error,
    }
}

fn internal(e: ProtocolError) -> EndReason {
    error!("{}", e);
    EndReason::NetworkError
}

/// Bookkeeping around one call attempt.
struct Call {
    node: Arc<NodeState>,
    id: CallId,
    direction: Direction,
    /// Verified identity of the other side.
    peer: Option<PublicKey>,
    remote: Option<SocketAddr>,
    machine: CallMachine,
    connected: bool,
    /// Registered in `node.calls` and reported to the handler.
    announced: bool,
}

impl Call {
    fn new(node: Arc<NodeState>, direction: Direction, peer: Option<PublicKey>) -> Self {
        Self {
            node,
            id: Uuid::new_v4(),
            direction,
            peer,
            remote: None,
            machine: CallMachine::new(),
            connected: false,
            announced: false,
        }
    }

    fn register(&mut self, peer: PublicKey, control: mpsc::Sender<CallCommand>) -> CallHandle {
        let handle = CallHandle {
            id: self.id,
            peer,
            direction: self.direction,
            control,
            state: self.machine.subscribe(),
        };
        self.node.calls.insert(self.id, handle.clone());
        self.announced = true;
        handle
    }

    async fn advance(&mut self, next: CallState) -> Result<(), ProtocolError> {
        self.machine.advance(next)?;
        if next == CallState::Connected {
            self.connected = true;
        }
        if self.announced {
            self.node.handler.call_state_changed(self.id, next).await;
        }
        Ok(())
    }

    /// Record and save the event, then publish the final state and unregister.
    async fn finish(mut self, reason: EndReason) -> EndReason {
        let reason = self.machine.ending_reason(reason);
        if let Some(peer) = self.peer {
            let outcome = outcome_for(self.direction, self.connected, reason);
            let address = self.remote.map(|a| a.ip().to_string());
            self.node
                .record_event(Event::now(self.direction, outcome, peer, address))
                .await;
            if let Err(e) = self.node.save().await {
                warn!(call = %self.id, "saving call event failed: {}", e);
            }
        }
        self.machine.end(reason);
        if self.announced {
            self.node.media.close(self.id).await;
            self.node
                .handler
                .call_state_changed(self.id, CallState::Ended(reason))
                .await;
            self.node.calls.remove(&self.id);
        }
        info!(call = %self.id, direction = ?self.direction, ?reason, "call ended");
        reason
    }
}

/// Start an outgoing call to `contact`. The call runs in its own task.
pub async fn dial(node: &Arc<NodeState>, contact: Contact) -> Result<CallHandle, Error> {
    if node.is_shutting_down() {
        return Err(Error::ShuttingDown);
    }
    let mut call = Call::new(node.clone(), Direction::Outgoing, Some(contact.public_key));
    let (control_tx, mut control_rx) = mpsc::channel(16);
    let handle = call.register(contact.public_key, control_tx);
    info!(call = %call.id, contact = %contact.name, "dialing");

    tokio::spawn(async move {
        let reason = match outgoing_call(&mut call, &contact, &mut control_rx).await {
            Ok(r) | Err(r) => r,
        };
        call.finish(reason).await;
    });
    Ok(handle)
}

async fn outgoing_call(
    call: &mut Call,
    contact: &Contact,
    control: &mut mpsc::Receiver<CallCommand>,
) -> Result<EndReason, EndReason> {
    let node = call.node.clone();
    let peer = contact.public_key;

    call.advance(CallState::Dialing).await.map_err(internal)?;
    let stream = node
        .connector()
        .await
        .connect(&contact.addresses)
        .await
        .map_err(|e| {
            warn!(call = %call.id, contact = %contact.name, "dial failed: {}", e);
            EndReason::NetworkError
        })?;
    call.remote = stream.peer_addr().ok();
    let mut channel = SignalChannel::new(stream, node.identity.clone());

    let offer = node.media.create_offer(call.id).await.map_err(|e| {
        warn!(call = %call.id, "cannot create offer: {}", e);
        EndReason::NetworkError
    })?;
    channel
        .send(&SignalMessage::Call { offer }, &peer)
        .await
        .map_err(|e| end_reason(&e))?;
    call.advance(CallState::OfferSent).await.map_err(internal)?;

    let deadline = Instant::now() + node.timeouts.answer;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                let _ = channel.send(&SignalMessage::Dismissed, &peer).await;
                return Err(EndReason::Timeout);
            }
            cmd = control.recv() => match cmd {
                Some(CallCommand::Candidate(candidate)) => {
                    channel
                        .send(&SignalMessage::Candidate { candidate }, &peer)
                        .await
                        .map_err(|e| end_reason(&e))?;
                }
                Some(CallCommand::Hangup) | None => {
                    let _ = channel.send(&SignalMessage::Dismissed, &peer).await;
                    return Err(EndReason::LocalCancel);
                }
            },
            msg = channel.recv_from(&peer) => match msg {
                Ok(SignalMessage::Ringing) => debug!(call = %call.id, "peer is ringing"),
                Ok(SignalMessage::Connected { answer }) => {
                    call.advance(CallState::Answered).await.map_err(internal)?;
                    if let Err(e) = node.media.apply_answer(call.id, &answer).await {
                        warn!(call = %call.id, "cannot apply answer: {}", e);
                        let _ = channel.send(&SignalMessage::Hangup, &peer).await;
                        return Err(EndReason::NetworkError);
                    }
                    call.advance(CallState::Connected).await.map_err(internal)?;
                    break;
                }
                Ok(SignalMessage::Dismissed) => return Err(EndReason::RemoteDeclined),
                Ok(SignalMessage::Candidate { candidate }) => {
                    node.media.add_remote_candidate(call.id, &candidate).await;
                }
                Ok(other) => {
                    warn!(call = %call.id, "{}", ProtocolError::UnexpectedMessage(other.action()));
                    return Err(EndReason::NetworkError);
                }
                Err(e) => {
                    warn!(call = %call.id, "call failed: {}", e);
                    return Err(end_reason(&e));
                }
            },
        }
    }

    Ok(run_connected(&node, call.id, &mut channel, control, peer).await)
}

/// Relay candidates until either side hangs up. Both sides ping on the
/// keepalive interval, and a peer silent for longer than the idle timeout is
/// dropped.
async fn run_connected<S: AsyncRead + AsyncWrite>(
    node: &NodeState,
    id: CallId,
    channel: &mut SignalChannel<S>,
    control: &mut mpsc::Receiver<CallCommand>,
    peer: PublicKey,
) -> EndReason {
    let Timeouts { keepalive, idle, .. } = node.timeouts;
    channel.set_timeout(None);
    info!(call = %id, "call connected");

    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    let mut silent_until = Instant::now() + idle;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = channel.send(&SignalMessage::Ping, &peer).await {
                    warn!(call = %id, "keepalive failed: {}", e);
                    return end_reason(&e);
                }
            }
            _ = tokio::time::sleep_until(silent_until) => {
                warn!(call = %id, ?idle, "peer went silent, dropping call");
                return EndReason::NetworkError;
            }
            cmd = control.recv() => match cmd {
                Some(CallCommand::Candidate(candidate)) => {
                    if let Err(e) = channel.send(&SignalMessage::Candidate { candidate }, &peer).await {
                        return end_reason(&e);
                    }
                }
                Some(CallCommand::Hangup) | None => {
                    let _ = channel.send(&SignalMessage::Hangup, &peer).await;
                    channel.close().await;
                    return EndReason::Hangup;
                }
            },
            msg = channel.recv_from(&peer) => {
                if msg.is_ok() {
                    silent_until = Instant::now() + idle;
                }
                match msg {
                    Ok(SignalMessage::Candidate { candidate }) => {
                        node.media.add_remote_candidate(id, &candidate).await;
                    }
                    Ok(SignalMessage::Ping) => {
                        if let Err(e) = channel.send(&SignalMessage::Pong, &peer).await {
                            return end_reason(&e);
                        }
                    }
                    Ok(SignalMessage::Pong) => trace!(call = %id, "keepalive answered"),
                    Ok(SignalMessage::Hangup | SignalMessage::Dismissed) => return EndReason::Hangup,
                    Ok(other) => debug!(call = %id, action = other.action(), "ignoring message during call"),
                    Err(Error::Transport(TransportError::Closed)) => return EndReason::Hangup,
                    Err(e) => {
                        warn!(call = %id, "call dropped: {}", e);
                        return end_reason(&e);
                    }
                }
            }
        }
    }
}

/// Handle one accepted socket. Only an authenticated first message can
/// advance the state machine; anything else ends the attempt.
pub async fn handle_connection<S>(node: Arc<NodeState>, stream: S, remote: SocketAddr) -> Inbound
where
    S: AsyncRead + AsyncWrite,
{
    let mut call = Call::new(node.clone(), Direction::Incoming, None);
    call.remote = Some(remote);

    let mut channel = SignalChannel::new(stream, node.identity.clone());
    channel.set_timeout(Some(node.timeouts.signal));

    let (message, sender) = match channel.recv().await {
        Ok(received) => received,
        Err(e) => {
            warn!(peer = %remote, "dropping inbound connection: {}", e);
            return Inbound::Ended(call.finish(end_reason(&e)).await);
        }
    };
    debug!(peer = %remote, action = message.action(), "inbound message");

    let (contact, block_unknown, auto_accept) = {
        let db = node.store.lock().await;
        (
            db.contacts.get_by_key(&sender).cloned(),
            db.settings.block_unknown,
            db.settings.auto_accept_calls,
        )
    };

    match message {
        SignalMessage::Ping => {
            if contact.is_none() && block_unknown {
                debug!(peer = %remote, "ignoring ping from unknown key");
                return Inbound::Ended(call.finish(EndReason::AuthenticationFailed).await);
            }
            if let Err(e) = channel.send(&SignalMessage::Pong, &sender).await {
                return Inbound::Ended(call.finish(end_reason(&e)).await);
            }
            channel.close().await;
            if contact.is_some() {
                node.set_contact_state(&sender, ContactState::ContactOnline)
                    .await;
            }
            Inbound::Pinged
        }
        SignalMessage::StatusChange { status } => {
            if contact.is_some() {
                let state = match status {
                    PeerStatus::Online => ContactState::ContactOnline,
                    PeerStatus::Offline => ContactState::ContactOffline,
                };
                node.set_contact_state(&sender, state).await;
            }
            Inbound::StatusUpdated
        }
        SignalMessage::Call { offer } => {
            call.peer = Some(sender);
            if let Err(e) = call.advance(CallState::Ringing).await {
                return Inbound::Ended(call.finish(internal(e)).await);
            }
            let blocked = match &contact {
                Some(c) => c.blocked,
                None => block_unknown,
            };
            if blocked {
                info!(peer = %remote, "dismissing call from blocked caller");
                let _ = channel.send(&SignalMessage::Dismissed, &sender).await;
                return Inbound::Ended(call.finish(EndReason::AuthenticationFailed).await);
            }

            let (control_tx, mut control_rx) = mpsc::channel(16);
            call.register(sender, control_tx);
            let incoming = IncomingCall {
                id: call.id,
                public_key: sender,
                contact_name: contact.map(|c| c.name),
                remote: Some(remote),
                offer,
            };
            let reason = match incoming_call(&mut call, &mut channel, incoming, auto_accept, &mut control_rx)
                .await
            {
                Ok(r) | Err(r) => r,
            };
            Inbound::Ended(call.finish(reason).await)
        }
        other => {
            warn!(peer = %remote, "{}", ProtocolError::UnexpectedMessage(other.action()));
            Inbound::Ended(call.finish(EndReason::NetworkError).await)
        }
    }
}

async fn incoming_call<S: AsyncRead + AsyncWrite>(
    call: &mut Call,
    channel: &mut SignalChannel<S>,
    incoming: IncomingCall,
    auto_accept: bool,
    control: &mut mpsc::Receiver<CallCommand>,
) -> Result<EndReason, EndReason> {
    let node = call.node.clone();
    let caller = incoming.public_key;

    call.advance(CallState::OfferReceived).await.map_err(internal)?;
    channel
        .send(&SignalMessage::Ringing, &caller)
        .await
        .map_err(|e| end_reason(&e))?;
    channel.set_timeout(None);

    let mut early_candidates = Vec::new();
    let decision = if auto_accept {
        info!(call = %incoming.id, "auto-accepting call");
        CallDecision::Accept
    } else {
        let ringing = tokio::time::timeout(node.timeouts.ring, node.handler.incoming_call(&incoming));
        tokio::pin!(ringing);
        loop {
            tokio::select! {
                decision = &mut ringing => match decision {
                    Ok(decision) => break decision,
                    Err(_) => {
                        let _ = channel.send(&SignalMessage::Dismissed, &caller).await;
                        return Err(EndReason::Timeout);
                    }
                },
                cmd = control.recv() => match cmd {
                    Some(CallCommand::Candidate(_)) => {}
                    Some(CallCommand::Hangup) | None => break CallDecision::Decline,
                },
                msg = channel.recv_from(&caller) => match msg {
                    Ok(SignalMessage::Candidate { candidate }) => early_candidates.push(candidate),
                    Ok(SignalMessage::Dismissed | SignalMessage::Hangup)
                    | Err(Error::Transport(TransportError::Closed)) => {
                        return Err(EndReason::RemoteDeclined);
                    }
                    Ok(other) => debug!(action = other.action(), "ignoring message while ringing"),
                    Err(e) => return Err(end_reason(&e)),
                },
            }
        }
    };

    if decision == CallDecision::Decline {
        let _ = channel.send(&SignalMessage::Dismissed, &caller).await;
        return Err(EndReason::LocalCancel);
    }

    let answer = match node.media.create_answer(incoming.id, &incoming.offer).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(call = %incoming.id, "cannot create answer: {}", e);
            let _ = channel.send(&SignalMessage::Dismissed, &caller).await;
            return Err(EndReason::NetworkError);
        }
    };
    for candidate in early_candidates {
        node.media.add_remote_candidate(incoming.id, &candidate).await;
    }
    channel
        .send(&SignalMessage::Connected { answer }, &caller)
        .await
        .map_err(|e| end_reason(&e))?;
    call.advance(CallState::Answered).await.map_err(internal)?;
    call.advance(CallState::Connected).await.map_err(internal)?;
    if incoming.contact_name.is_none() {
        if let Some(remote) = &incoming.remote {
            node.adopt_caller(caller, remote).await;
        }
    }

    Ok(run_connected(&node, incoming.id, channel, control, caller).await)
}
