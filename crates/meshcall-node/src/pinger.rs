//! Presence probing: one encrypted ping per contact.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use meshcall_crypto::PublicKey;
use meshcall_protocol::SignalMessage;

use crate::channel::SignalChannel;
use crate::contact::{Contact, ContactState};
use crate::error::ConnectError;
use crate::state::NodeState;
use crate::store::Refresh;

/// Probe one contact and classify the result. The socket is always closed.
pub async fn ping_contact(node: &NodeState, contact: &Contact) -> ContactState {
    let connector = node.connector().await;
    let stream = match connector.connect(&contact.addresses).await {
        Ok(stream) => stream,
        Err(ConnectError::NetworkUnreachable) => return ContactState::NetworkUnreachable,
        Err(e) => {
            debug!(contact = %contact.name, "ping connect failed: {}", e);
            return ContactState::ContactOffline;
        }
    };

    let mut channel = SignalChannel::new(stream, node.identity.clone());
    channel.set_timeout(Some(node.timeouts.ping));
    let state = exchange(&mut channel, &contact.public_key).await;
    channel.close().await;
    state
}

async fn exchange<S: AsyncRead + AsyncWrite>(
    channel: &mut SignalChannel<S>,
    peer: &PublicKey,
) -> ContactState {
    if let Err(e) = channel.send(&SignalMessage::Ping, peer).await {
        debug!("ping send failed: {}", e);
        return ContactState::CommunicationFailed;
    }
    match channel.recv().await {
        Ok((_, sender)) if &sender != peer => ContactState::AuthenticationFailed,
        Ok((SignalMessage::Pong, _)) => ContactState::ContactOnline,
        Ok((other, _)) => {
            debug!(action = other.action(), "unexpected ping reply");
            ContactState::CommunicationFailed
        }
        Err(e) => {
            debug!("ping reply failed: {}", e);
            ContactState::CommunicationFailed
        }
    }
}

/// Ping `keys` one after another. Contacts go `Pending` first; one refresh is
/// broadcast before and one after the sweep. A sweep cut short by shutdown
/// puts the contacts it did not reach back to their previous state.
pub async fn sweep(node: &NodeState, keys: &[PublicKey]) {
    let _guard = node.sweep_guard().await;

    // each contact as it was before going Pending
    let contacts: Vec<Contact> = {
        let mut db = node.store.lock().await;
        let before: Vec<Contact> = keys
            .iter()
            .filter_map(|key| db.contacts.get_by_key(key).cloned())
            .collect();
        for key in keys {
            db.contacts.set_state(key, ContactState::Pending);
        }
        before
    };
    node.store.refresh(Refresh::Contacts);

    let mut online = 0usize;
    for (done, contact) in contacts.iter().enumerate() {
        if node.is_shutting_down() {
            debug!(skipped = contacts.len() - done, "shutting down, sweep stopped");
            let mut db = node.store.lock().await;
            for skipped in &contacts[done..] {
                db.contacts.set_state(&skipped.public_key, skipped.state);
            }
            break;
        }
        let state = ping_contact(node, contact).await;
        debug!(contact = %contact.name, ?state, "ping");
        if state == ContactState::ContactOnline {
            online += 1;
        }
        node.store
            .lock()
            .await
            .contacts
            .set_state(&contact.public_key, state);
    }

    node.store.refresh(Refresh::Contacts);
    info!(contacts = contacts.len(), online, "ping sweep done");
}
