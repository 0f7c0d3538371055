use serde::{Deserialize, Serialize};

use meshcall_crypto::PublicKey;

use crate::address::normalize_addresses;
use crate::error::Error;

/// Reachability of a contact as last determined by a ping or inbound message.
/// Never persisted; every load starts at `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactState {
    #[default]
    Pending,
    ContactOnline,
    ContactOffline,
    NetworkUnreachable,
    CommunicationFailed,
    AuthenticationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub public_key: PublicKey,
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Calls from a blocked contact are dismissed without ringing.
    #[serde(default)]
    pub blocked: bool,
    #[serde(skip)]
    pub state: ContactState,
}

/// The subset shared over QR codes and copy/paste.
#[derive(Debug, Serialize, Deserialize)]
struct ExchangeContact {
    name: String,
    public_key: PublicKey,
    #[serde(default)]
    addresses: Vec<String>,
}

impl Contact {
    pub fn new(name: impl Into<String>, public_key: PublicKey, addresses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            public_key,
            addresses: normalize_addresses(addresses),
            blocked: false,
            state: ContactState::Pending,
        }
    }

    /// Parse the contact exchange format:
    /// `{"name": ..., "public_key": <hex>, "addresses": [...]}`.
    pub fn from_exchange_json(json: &str) -> Result<Self, Error> {
        let exchange: ExchangeContact =
            serde_json::from_str(json).map_err(|e| Error::InvalidContact(e.to_string()))?;
        let name = exchange.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidContact("empty name".into()));
        }
        Ok(Self::new(name, exchange.public_key, exchange.addresses))
    }

    pub fn to_exchange_json(&self) -> Result<String, Error> {
        let exchange = ExchangeContact {
            name: self.name.clone(),
            public_key: self.public_key,
            addresses: self.addresses.clone(),
        };
        serde_json::to_string(&exchange).map_err(|e| Error::InvalidContact(e.to_string()))
    }
}

/// The address book. Names and public keys are each unique.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Contacts {
    contacts: Vec<Contact>,
}

impl Contacts {
    /// Add a new contact; fails if the key or the name is already taken.
    pub fn add(&mut self, contact: Contact) -> Result<(), Error> {
        if self.get_by_key(&contact.public_key).is_some() {
            return Err(Error::DuplicateKey(contact.public_key.to_hex()));
        }
        if self.get_by_name(&contact.name).is_some() {
            return Err(Error::DuplicateName(contact.name));
        }
        self.contacts.push(contact);
        Ok(())
    }

    /// Insert or replace the record with the same public key.
    pub fn upsert(&mut self, mut contact: Contact) -> Result<(), Error> {
        if self
            .contacts
            .iter()
            .any(|c| c.name == contact.name && c.public_key != contact.public_key)
        {
            return Err(Error::DuplicateName(contact.name));
        }
        match self
            .contacts
            .iter_mut()
            .find(|c| c.public_key == contact.public_key)
        {
            Some(existing) => {
                contact.state = existing.state;
                *existing = contact;
            }
            None => self.contacts.push(contact),
        }
        Ok(())
    }

    pub fn remove(&mut self, public_key: &PublicKey) -> Option<Contact> {
        let idx = self
            .contacts
            .iter()
            .position(|c| &c.public_key == public_key)?;
        Some(self.contacts.remove(idx))
    }

    pub fn get_by_key(&self, public_key: &PublicKey) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.public_key == public_key)
    }

    pub fn get_by_key_mut(&mut self, public_key: &PublicKey) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| &c.public_key == public_key)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.name == name)
    }

    /// Returns false if no contact has this key.
    pub fn set_state(&mut self, public_key: &PublicKey, state: ContactState) -> bool {
        match self.get_by_key_mut(public_key) {
            Some(c) => {
                c.state = state;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Contact> {
        self.contacts.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
