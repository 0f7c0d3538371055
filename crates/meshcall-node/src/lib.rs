//! Peer-to-peer authenticated calling on the local network: data model,
//! connection establishment, presence pings, call signaling and the
//! service that ties them together.

pub mod address;
pub mod call;
pub mod channel;
pub mod config;
pub mod connector;
pub mod contact;
pub mod database;
pub mod error;
pub mod event;
pub mod identity;
pub mod neighbor;
pub mod pinger;
pub mod service;
pub mod settings;
pub mod state;
pub mod store;

pub use call::{
    CallDecision, CallHandle, CallHandler, CallId, CallState, EndReason, IncomingCall,
    MediaEngine,
};
pub use config::NodeConfig;
pub use contact::{Contact, ContactState};
pub use database::Database;
pub use error::{ConnectError, Error, PersistenceError, ProtocolError};
pub use event::{Direction, Event, Outcome};
pub use service::Service;
pub use settings::Settings;
pub use store::Refresh;
