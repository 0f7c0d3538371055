//! MeshCall cryptographic layer.
//!
//! This crate provides:
//! - Ed25519 identity keys and fingerprints
//! - Anonymous sealing to a peer's key (X25519 + HKDF + ChaCha20-Poly1305)
//! - The signed-then-sealed envelope carried by every signaling message
//! - Password-based encryption of the local database (Argon2id)
//! - Wrapping of the identity secret through a pluggable key store

pub mod database;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod seal;

// Re-export key types for convenience
pub use database::{open_database, seal_database};
pub use envelope::{decrypt_message, encrypt_message};
pub use error::CryptoError;
pub use identity::{fingerprint, verify_signed, IdentityKeyPair, PublicKey};
pub use keystore::{KeyStore, SealedIdentity, SoftwareKeyStore};
