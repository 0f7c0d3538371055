use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::contact::Contacts;
use crate::error::PersistenceError;
use crate::event::Events;
use crate::settings::Settings;

/// Everything persisted for one installation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub contacts: Contacts,
    #[serde(default)]
    pub events: Events,
}

impl Database {
    pub fn from_json(json: &[u8]) -> Result<Self, PersistenceError> {
        let mut db: Database = serde_json::from_slice(json)?;
        db.settings.normalize();
        for contact in db.contacts.iter_mut() {
            contact.addresses = crate::address::normalize_addresses(&contact.addresses);
        }
        Ok(db)
    }

    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>, PersistenceError> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    /// Serialize and encrypt under `password`.
    pub fn seal(&self, password: &str) -> Result<Vec<u8>, PersistenceError> {
        let json = self.to_json()?;
        Ok(meshcall_crypto::seal_database(&json, password)?)
    }

    pub fn open(blob: &[u8], password: &str) -> Result<Self, PersistenceError> {
        let json = meshcall_crypto::open_database(blob, password)?;
        Self::from_json(&json)
    }

    /// Read and decrypt the database file. `Ok(None)` means there is no file
    /// yet (first start).
    pub async fn load(path: &Path, password: &str) -> Result<Option<Self>, PersistenceError> {
        let blob = match tokio::fs::read(path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no database yet");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let db = Self::open(&blob, password)?;
        debug!(
            path = %path.display(),
            contacts = db.contacts.len(),
            events = db.events.len(),
            "database loaded"
        );
        Ok(Some(db))
    }

    /// Encrypt and write atomically (write to .tmp, then rename).
    pub async fn save(&self, path: &Path, password: &str) -> Result<(), PersistenceError> {
        let blob = self.seal(password)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &blob).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        debug!(path = %path.display(), bytes = blob.len(), "database saved");
        Ok(())
    }

    /// Take over `other`'s settings and add its contacts and events.
    pub fn merge(&mut self, other: Database) {
        self.settings = other.settings;
        for contact in other.contacts.iter().cloned() {
            let name = contact.name.clone();
            if let Err(e) = self.contacts.upsert(contact) {
                warn!(contact = %name, "skipping contact while merging: {}", e);
            }
        }
        for event in other.events.iter().cloned() {
            self.events.push(event);
        }
    }
}
