use tokio::sync::{broadcast, Mutex, MutexGuard};

use crate::database::Database;

/// What listeners should re-read after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Contacts,
    Events,
}

/// Single-writer handle on the live database.
///
/// Guards must not be held across network awaits.
pub struct Store {
    db: Mutex<Database>,
    refresh_tx: broadcast::Sender<Refresh>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        let (refresh_tx, _) = broadcast::channel(64);
        Self {
            db: Mutex::new(db),
            refresh_tx,
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Refresh> {
        self.refresh_tx.subscribe()
    }

    pub fn refresh(&self, what: Refresh) {
        // no subscribers is fine
        let _ = self.refresh_tx.send(what);
    }
}
