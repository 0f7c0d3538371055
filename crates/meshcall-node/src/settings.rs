use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use meshcall_crypto::{PublicKey, SealedIdentity};

use crate::address::normalize_addresses;
use crate::contact::Contact;
use crate::error::PersistenceError;

/// Per-user settings, persisted as JSON inside the encrypted database.
///
/// Unknown fields are ignored and missing ones take their defaults, so
/// databases written by other versions still open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub username: String,

    /// Identity public key (hex). Empty until the first start.
    #[serde(default)]
    pub public_key: Option<PublicKey>,

    /// Identity secret wrapped by the key store (base64).
    #[serde(default)]
    pub encrypted_secret_key: String,

    #[serde(default = "default_theme_name")]
    pub theme_name: String,

    /// "on", "off" or "auto".
    #[serde(default = "default_night_mode")]
    pub night_mode: String,

    /// Refuse calls from keys not in the address book.
    #[serde(default)]
    pub block_unknown: bool,

    #[serde(default)]
    pub use_neighbor_table: bool,

    #[serde(default = "default_true")]
    pub guess_eui64_address: bool,

    /// Connection attempts per candidate address.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default)]
    pub disable_call_history: bool,

    #[serde(default)]
    pub auto_accept_calls: bool,

    /// Ping contacts on start and announce going offline on shutdown.
    #[serde(default = "default_true")]
    pub automatic_status_updates: bool,

    /// Addresses other devices should use to reach this one.
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub own_contact: Option<Contact>,
}

fn default_theme_name() -> String {
    "sky_blue".into()
}

fn default_night_mode() -> String {
    "auto".into()
}

fn default_true() -> bool {
    true
}

fn default_connect_retries() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    500
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            username: String::new(),
            public_key: None,
            encrypted_secret_key: String::new(),
            theme_name: default_theme_name(),
            night_mode: default_night_mode(),
            block_unknown: false,
            use_neighbor_table: false,
            guess_eui64_address: true,
            connect_retries: default_connect_retries(),
            connect_timeout: default_connect_timeout(),
            disable_call_history: false,
            auto_accept_calls: false,
            automatic_status_updates: true,
            addresses: Vec::new(),
            own_contact: None,
        }
    }
}

impl Settings {
    /// The stored identity, if one was created before.
    pub fn sealed_identity(&self) -> Result<Option<SealedIdentity>, PersistenceError> {
        let Some(public_key) = self.public_key else {
            return Ok(None);
        };
        if self.encrypted_secret_key.is_empty() {
            return Err(PersistenceError::InvalidIdentity(
                "public key present without a secret key".into(),
            ));
        }
        let wrapped_secret = BASE64
            .decode(&self.encrypted_secret_key)
            .map_err(|e| PersistenceError::InvalidIdentity(e.to_string()))?;
        Ok(Some(SealedIdentity {
            public_key,
            wrapped_secret,
        }))
    }

    pub fn set_identity(&mut self, identity: &SealedIdentity) {
        self.public_key = Some(identity.public_key);
        self.encrypted_secret_key = BASE64.encode(&identity.wrapped_secret);
    }

    pub fn normalize(&mut self) {
        self.addresses = normalize_addresses(&self.addresses);
        if let Some(own) = self.own_contact.as_mut() {
            own.addresses = normalize_addresses(&own.addresses);
        }
    }
}
