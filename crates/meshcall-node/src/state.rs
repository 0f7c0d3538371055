use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use meshcall_crypto::PublicKey;

use crate::address::addresses_for_peer;
use crate::call::{CallHandle, CallHandler, CallId, MediaEngine};
use crate::config::Timeouts;
use crate::connector::Connector;
use crate::contact::{Contact, ContactState};
use crate::database::Database;
use crate::error::PersistenceError;
use crate::event::Event;
use crate::identity::LocalIdentity;
use crate::store::{Refresh, Store};

/// Process-wide state shared by the accept loop, sweeps and calls.
pub struct NodeState {
    pub store: Store,
    pub identity: Arc<LocalIdentity>,
    /// Port we listen on and dial peers at.
    pub port: u16,
    pub timeouts: Timeouts,
    pub handler: Arc<dyn CallHandler>,
    pub media: Arc<dyn MediaEngine>,
    /// Calls that have not ended yet.
    pub calls: DashMap<CallId, CallHandle>,
    sweep_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    persist: Option<Persist>,
    save_lock: Mutex<()>,
}

/// Where the live database is written back to.
struct Persist {
    path: PathBuf,
    password: Zeroizing<String>,
}

impl NodeState {
    pub fn new(
        db: Database,
        identity: Arc<LocalIdentity>,
        port: u16,
        timeouts: Timeouts,
        handler: Arc<dyn CallHandler>,
        media: Arc<dyn MediaEngine>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store: Store::new(db),
            identity,
            port,
            timeouts,
            handler,
            media,
            calls: DashMap::new(),
            sweep_lock: Mutex::new(()),
            shutdown_tx,
            persist: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Save to `path` under `password` whenever [`NodeState::save`] runs.
    pub fn with_persistence(mut self, path: PathBuf, password: &str) -> Self {
        self.persist = Some(Persist {
            path,
            password: Zeroizing::new(password.to_string()),
        });
        self
    }

    /// Write a snapshot of the live database. Without a configured path this
    /// does nothing.
    pub async fn save(&self) -> Result<(), PersistenceError> {
        let Some(persist) = &self.persist else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let snapshot = self.store.lock().await.clone();
        snapshot.save(&persist.path, &persist.password).await
    }

    /// Connector configured from the current settings.
    pub async fn connector(&self) -> Connector {
        let db = self.store.lock().await;
        Connector::from_settings(&db.settings, self.port)
    }

    pub async fn contact(&self, public_key: &PublicKey) -> Option<Contact> {
        self.store.lock().await.contacts.get_by_key(public_key).cloned()
    }

    pub async fn set_contact_state(&self, public_key: &PublicKey, state: ContactState) -> bool {
        let changed = self
            .store
            .lock()
            .await
            .contacts
            .set_state(public_key, state);
        if changed {
            self.store.refresh(Refresh::Contacts);
        }
        changed
    }

    /// Add a contact for a caller we had no record of, named after its
    /// fingerprint. Returns `None` if the key is already known.
    pub async fn adopt_caller(&self, public_key: PublicKey, remote: &SocketAddr) -> Option<Contact> {
        let contact = {
            let mut db = self.store.lock().await;
            if db.contacts.get_by_key(&public_key).is_some() {
                return None;
            }
            let short: String = public_key.fingerprint().chars().take(9).collect();
            let base = format!("Caller {short}");
            let mut name = base.clone();
            let mut n = 2;
            while db.contacts.get_by_name(&name).is_some() {
                name = format!("{base} ({n})");
                n += 1;
            }
            let mut contact = Contact::new(name, public_key, addresses_for_peer(remote));
            contact.state = ContactState::ContactOnline;
            if let Err(e) = db.contacts.add(contact.clone()) {
                warn!("cannot add caller as contact: {}", e);
                return None;
            }
            contact
        };
        info!(contact = %contact.name, "added caller to contacts");
        self.store.refresh(Refresh::Contacts);
        if let Err(e) = self.save().await {
            warn!("saving new contact failed: {}", e);
        }
        Some(contact)
    }

    /// Append to the call history. Missed calls bump the counter even when
    /// history is disabled.
    pub async fn record_event(&self, event: Event) {
        {
            let mut db = self.store.lock().await;
            if event.is_missed() {
                db.events.note_missed();
            }
            if db.settings.disable_call_history {
                debug!("call history disabled, event not stored");
            } else {
                db.events.push(event);
            }
        }
        self.store.refresh(Refresh::Events);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Held for the whole of one ping sweep.
    pub(crate) async fn sweep_guard(&self) -> MutexGuard<'_, ()> {
        self.sweep_lock.lock().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::call::tests::{ScriptedHandler, TestMedia};
    use crate::event::{Direction, Outcome};
    use crate::identity::test_identity;

    pub(crate) fn make_state(db: Database, port: u16) -> Arc<NodeState> {
        make_state_with(db, port, Arc::new(ScriptedHandler::declining()))
    }

    pub(crate) fn make_state_with(
        db: Database,
        port: u16,
        handler: Arc<dyn CallHandler>,
    ) -> Arc<NodeState> {
        Arc::new(NodeState::new(
            db,
            Arc::new(test_identity()),
            port,
            Timeouts::default(),
            handler,
            Arc::new(TestMedia),
        ))
    }

    #[tokio::test]
    async fn missed_calls_counted_without_history() {
        let mut db = Database::default();
        db.settings.disable_call_history = true;
        let state = make_state(db, 0);
        let key = test_identity().public_key();

        state
            .record_event(Event::now(Direction::Incoming, Outcome::Missed, key, None))
            .await;
        let db = state.store.lock().await;
        assert!(db.events.is_empty());
        assert_eq!(db.events.missed(), 1);
    }

    #[tokio::test]
    async fn events_stored_and_refreshed() {
        let state = make_state(Database::default(), 0);
        let mut rx = state.store.subscribe();
        let key = test_identity().public_key();

        state
            .record_event(Event::now(Direction::Outgoing, Outcome::Accepted, key, None))
            .await;
        assert_eq!(rx.recv().await.unwrap(), Refresh::Events);
        assert_eq!(state.store.lock().await.events.len(), 1);
    }

    #[tokio::test]
    async fn contact_state_updates_known_contacts_only() {
        let mut db = Database::default();
        let known = test_identity().public_key();
        db.contacts.add(Contact::new("k", known, vec![])).unwrap();
        let state = make_state(db, 0);

        assert!(state.set_contact_state(&known, ContactState::ContactOnline).await);
        assert!(!state
            .set_contact_state(&test_identity().public_key(), ContactState::ContactOnline)
            .await);
        assert_eq!(
            state.contact(&known).await.unwrap().state,
            ContactState::ContactOnline
        );
    }

    #[tokio::test]
    async fn adopted_callers_get_unique_names() {
        let state = make_state(Database::default(), 0);
        let remote: SocketAddr = "[::ffff:10.0.0.5]:10001".parse().unwrap();
        let key = test_identity().public_key();
        let mut rx = state.store.subscribe();

        let first = state.adopt_caller(key, &remote).await.unwrap();
        assert!(first.name.starts_with("Caller "));
        assert_eq!(first.addresses, vec!["10.0.0.5"]);
        assert_eq!(rx.recv().await.unwrap(), Refresh::Contacts);
        assert!(state.adopt_caller(key, &remote).await.is_none());

        // a different key whose fingerprint prefix collides gets a suffix
        let other = test_identity().public_key();
        state
            .store
            .lock()
            .await
            .contacts
            .get_by_key_mut(&key)
            .unwrap()
            .name = format!("Caller {}", other.fingerprint().chars().take(9).collect::<String>());
        let second = state.adopt_caller(other, &remote).await.unwrap();
        assert!(second.name.ends_with(" (2)"));
        assert_eq!(state.store.lock().await.contacts.len(), 2);
    }

    #[tokio::test]
    async fn save_writes_the_live_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.bin");
        let state = Arc::new(
            NodeState::new(
                Database::default(),
                Arc::new(test_identity()),
                0,
                Timeouts::default(),
                Arc::new(ScriptedHandler::declining()),
                Arc::new(TestMedia),
            )
            .with_persistence(path.clone(), "pw"),
        );
        let key = test_identity().public_key();
        state
            .record_event(Event::now(Direction::Incoming, Outcome::Missed, key, None))
            .await;
        state.save().await.unwrap();

        let loaded = Database::load(&path, "pw").await.unwrap().unwrap();
        assert_eq!(loaded.events.len(), 1);
    }

    #[tokio::test]
    async fn save_without_path_is_a_no_op() {
        let state = make_state(Database::default(), 0);
        state.save().await.unwrap();
    }

    #[test]
    fn shutdown_flag() {
        let state = make_state(Database::default(), 0);
        let rx = state.shutdown_signal();
        assert!(!state.is_shutting_down());
        state.begin_shutdown();
        assert!(state.is_shutting_down());
        assert!(*rx.borrow());
    }
}
