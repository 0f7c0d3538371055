use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use meshcall_crypto::{KeyStore, PublicKey};
use meshcall_protocol::{PeerStatus, SignalMessage};

use crate::call::{self, CallHandle, CallHandler, CallId, MediaEngine};
use crate::channel::SignalChannel;
use crate::config::NodeConfig;
use crate::contact::{Contact, ContactState};
use crate::database::Database;
use crate::error::Error;
use crate::event::Event;
use crate::identity::LocalIdentity;
use crate::pinger;
use crate::settings::Settings;
use crate::state::NodeState;
use crate::store::Refresh;

const LISTEN_BACKLOG: i32 = 128;

/// Owns the live database and drives listening, pings and calls.
pub struct Service {
    state: Arc<NodeState>,
    config: NodeConfig,
    first_start: bool,
}

impl Service {
    /// Load (or create) the database and identity, then save once so the
    /// identity is persisted.
    pub async fn start(
        config: NodeConfig,
        password: &str,
        keystore: Arc<dyn KeyStore>,
        handler: Arc<dyn CallHandler>,
        media: Arc<dyn MediaEngine>,
    ) -> Result<Self, Error> {
        let loaded = Database::load(&config.database_path, password).await?;
        let first_start = loaded.is_none();
        let mut db = loaded.unwrap_or_default();

        let stored = db.settings.sealed_identity()?;
        let identity = LocalIdentity::load_or_create(keystore, stored.as_ref())?;
        db.settings.set_identity(identity.sealed());
        refresh_own_contact(&mut db.settings, identity.public_key());

        info!(
            fingerprint = %identity.fingerprint(),
            contacts = db.contacts.len(),
            first_start,
            "identity ready"
        );

        let state = Arc::new(NodeState::new(
            db,
            Arc::new(identity),
            config.port,
            config.timeouts(),
            handler,
            media,
        )
        .with_persistence(config.database_path.clone(), password));
        let service = Self {
            state,
            config,
            first_start,
        };
        service.save_database().await?;
        Ok(service)
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// True when no database file existed at start.
    pub fn is_first_start(&self) -> bool {
        self.first_start
    }

    /// Bind the signaling port and spawn the accept loop. The loop ends when
    /// shutdown begins.
    pub async fn listen(&self) -> Result<SocketAddr, Error> {
        let listener = bind_listener(&self.config.host, self.config.port)?;
        let local = listener.local_addr()?;
        info!(addr = %local, "listening for peers");
        tokio::spawn(accept_loop(listener, self.state.clone()));
        Ok(local)
    }

    pub async fn save_database(&self) -> Result<(), Error> {
        self.state.save().await?;
        Ok(())
    }

    /// Take over `other`'s settings and add its contacts and events. The own
    /// identity is kept.
    pub async fn merge_database(&self, other: Database) -> Result<(), Error> {
        {
            let mut db = self.state.store.lock().await;
            db.merge(other);
            db.settings.set_identity(self.state.identity.sealed());
            refresh_own_contact(&mut db.settings, self.state.identity.public_key());
        }
        self.state.store.refresh(Refresh::Contacts);
        self.state.store.refresh(Refresh::Events);
        self.save_database().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Refresh> {
        self.state.store.subscribe()
    }

    pub fn fingerprint(&self) -> String {
        self.state.identity.fingerprint()
    }

    pub async fn settings(&self) -> Settings {
        self.state.store.lock().await.settings.clone()
    }

    pub async fn update_settings(&self, f: impl FnOnce(&mut Settings)) -> Result<(), Error> {
        {
            let mut db = self.state.store.lock().await;
            f(&mut db.settings);
            db.settings.normalize();
            refresh_own_contact(&mut db.settings, self.state.identity.public_key());
        }
        self.save_database().await
    }

    pub async fn own_contact(&self) -> Contact {
        let db = self.state.store.lock().await;
        match &db.settings.own_contact {
            Some(own) => own.clone(),
            None => Contact::new(
                display_name(&db.settings),
                self.state.identity.public_key(),
                db.settings.addresses.clone(),
            ),
        }
    }

    pub async fn export_contact(&self) -> Result<String, Error> {
        self.own_contact().await.to_exchange_json()
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.state.store.lock().await.contacts.iter().cloned().collect()
    }

    /// Parse an exchanged contact and add it.
    pub async fn import_contact(&self, json: &str) -> Result<Contact, Error> {
        let contact = Contact::from_exchange_json(json)?;
        self.add_contact(contact.clone()).await?;
        Ok(contact)
    }

    /// Add, save, then ping the new contact in the background.
    pub async fn add_contact(&self, contact: Contact) -> Result<(), Error> {
        if contact.public_key == self.state.identity.public_key() {
            return Err(Error::InvalidContact("cannot add own identity".into()));
        }
        let key = contact.public_key;
        info!(contact = %contact.name, "adding contact");
        self.state.store.lock().await.contacts.add(contact)?;
        self.state.store.refresh(Refresh::Contacts);
        self.save_database().await?;
        self.ping_contacts(vec![key]);
        Ok(())
    }

    pub async fn delete_contact(&self, public_key: &PublicKey) -> Result<Contact, Error> {
        let removed = self
            .state
            .store
            .lock()
            .await
            .contacts
            .remove(public_key)
            .ok_or_else(|| Error::UnknownContact(public_key.to_hex()))?;
        info!(contact = %removed.name, "deleted contact");
        self.state.store.refresh(Refresh::Contacts);
        self.save_database().await?;
        Ok(removed)
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.store.lock().await.events.iter().cloned().collect()
    }

    pub async fn add_event(&self, event: Event) -> Result<(), Error> {
        self.state.record_event(event).await;
        self.save_database().await
    }

    /// Remove events older than `before` (ms since epoch).
    pub async fn delete_events(&self, before: u64) -> Result<usize, Error> {
        let removed = self.state.store.lock().await.events.delete_before(before);
        debug!(removed, before, "deleted events");
        self.state.store.refresh(Refresh::Events);
        self.save_database().await?;
        Ok(removed)
    }

    pub async fn clear_events(&self) -> Result<(), Error> {
        self.state.store.lock().await.events.clear();
        self.state.store.refresh(Refresh::Events);
        self.save_database().await
    }

    pub async fn missed_calls(&self) -> u32 {
        self.state.store.lock().await.events.missed()
    }

    pub async fn clear_missed_calls(&self) {
        self.state.store.lock().await.events.clear_missed();
        self.state.store.refresh(Refresh::Events);
    }

    /// Sweep the given contacts in a background task.
    pub fn ping_contacts(&self, keys: Vec<PublicKey>) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            pinger::sweep(&state, &keys).await;
        })
    }

    pub async fn ping_all(&self) -> JoinHandle<()> {
        let keys: Vec<PublicKey> = self
            .state
            .store
            .lock()
            .await
            .contacts
            .iter()
            .map(|c| c.public_key)
            .collect();
        self.ping_contacts(keys)
    }

    /// Call a contact by name.
    pub async fn dial(&self, name: &str) -> Result<CallHandle, Error> {
        let contact = self
            .state
            .store
            .lock()
            .await
            .contacts
            .get_by_name(name)
            .cloned()
            .ok_or_else(|| Error::UnknownContact(name.to_string()))?;
        call::dial(&self.state, contact).await
    }

    pub fn call(&self, id: &CallId) -> Option<CallHandle> {
        self.state.calls.get(id).map(|entry| entry.value().clone())
    }

    /// Returns false if the call already ended.
    pub async fn hangup(&self, id: &CallId) -> bool {
        let Some(handle) = self.call(id) else {
            return false;
        };
        handle.hangup().await;
        true
    }

    /// Stop accepting, end running calls, tell online contacts we are going
    /// offline, and save.
    pub async fn shutdown(&self) -> Result<(), Error> {
        info!("shutting down");
        self.state.begin_shutdown();

        let handles: Vec<CallHandle> = self.state.calls.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.hangup().await;
        }

        let (online, notify) = {
            let db = self.state.store.lock().await;
            let online: Vec<Contact> = db
                .contacts
                .iter()
                .filter(|c| c.state == ContactState::ContactOnline)
                .cloned()
                .collect();
            (online, db.settings.automatic_status_updates)
        };
        if notify {
            for contact in &online {
                send_status(&self.state, contact, PeerStatus::Offline).await;
            }
        }

        self.save_database().await
    }
}

fn display_name(settings: &Settings) -> String {
    if settings.username.trim().is_empty() {
        "me".to_string()
    } else {
        settings.username.clone()
    }
}

/// Keep the own contact in step with the identity, username and addresses.
fn refresh_own_contact(settings: &mut Settings, public_key: PublicKey) {
    let own = Contact::new(display_name(settings), public_key, settings.addresses.clone());
    settings.own_contact = Some(own);
}

/// One attempt, no retries; failures are only logged.
async fn send_status(state: &NodeState, contact: &Contact, status: PeerStatus) {
    let mut connector = state.connector().await;
    connector.retries = 1;
    let stream = match connector.connect(&contact.addresses).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(contact = %contact.name, "status update not delivered: {}", e);
            return;
        }
    };
    let mut channel = SignalChannel::new(stream, state.identity.clone());
    match channel
        .send(&SignalMessage::StatusChange { status }, &contact.public_key)
        .await
    {
        Ok(()) => debug!(contact = %contact.name, ?status, "sent status"),
        Err(e) => debug!(contact = %contact.name, "status update failed: {}", e),
    }
    channel.close().await;
}

fn bind_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    let ip: IpAddr = host.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid listen address: {host}"),
        )
    })?;
    let addr = SocketAddr::new(ip, port);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        // accept IPv4-mapped peers on the same socket
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(listener: TcpListener, state: Arc<NodeState>) {
    let mut shutdown = state.shutdown_signal();
    if *shutdown.borrow() {
        return;
    }
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("accept loop stopped");
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted connection");
                    let state = state.clone();
                    tokio::spawn(async move {
                        let outcome = call::handle_connection(state, stream, peer).await;
                        debug!(peer = %peer, ?outcome, "connection finished");
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    if state.is_shutting_down() {
                        break;
                    }
                    warn!("continuing after accept error");
                }
            },
        }
    }
}
