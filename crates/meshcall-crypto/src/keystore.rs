//! Protection of the identity secret at rest.
//!
//! The secret seed is never persisted in the clear: it is wrapped by a
//! [`KeyStore`] and only unwrapped for the duration of one operation.
//! Platform-backed stores implement the trait; [`SoftwareKeyStore`] is the
//! portable fallback.

use std::fs;
use std::io::Write;
use std::path::Path;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, PublicKey};

const WRAP_KEY_LEN: usize = 32;
const WRAP_AAD: &[u8] = b"meshcall key wrap";

/// Identity as kept in settings: the public key plus the wrapped seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedIdentity {
    pub public_key: PublicKey,
    pub wrapped_secret: Vec<u8>,
}

pub trait KeyStore: Send + Sync {
    fn wrap_private_key(&self, secret: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn unwrap_private_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Restore the stored identity, or create and wrap a new one on first start.
    fn get_or_create_identity(
        &self,
        stored: Option<&SealedIdentity>,
    ) -> Result<(IdentityKeyPair, SealedIdentity), CryptoError> {
        if let Some(stored) = stored {
            let secret = self.unwrap_private_key(&stored.wrapped_secret)?;
            let pair = IdentityKeyPair::from_secret_bytes(&secret)?;
            if pair.public_key() != stored.public_key {
                return Err(CryptoError::KeyStore(
                    "unwrapped secret does not match stored public key".into(),
                ));
            }
            return Ok((pair, stored.clone()));
        }

        let pair = IdentityKeyPair::generate();
        let wrapped_secret = self.wrap_private_key(pair.secret_bytes().as_ref())?;
        let sealed = SealedIdentity {
            public_key: pair.public_key(),
            wrapped_secret,
        };
        info!(fingerprint = %sealed.public_key.fingerprint(), "created new identity");
        Ok((pair, sealed))
    }
}

/// Key store backed by a random wrapping key in a local file.
pub struct SoftwareKeyStore {
    wrapping_key: Zeroizing<[u8; WRAP_KEY_LEN]>,
}

impl SoftwareKeyStore {
    /// In-memory store with a fresh random wrapping key.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = Zeroizing::new([0u8; WRAP_KEY_LEN]);
        SystemRandom::new()
            .fill(key.as_mut())
            .map_err(|_| CryptoError::Rng)?;
        Ok(Self { wrapping_key: key })
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut key = Zeroizing::new([0u8; WRAP_KEY_LEN]);
        if bytes.len() != WRAP_KEY_LEN {
            return Err(CryptoError::KeyStore(format!(
                "wrapping key must be {WRAP_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        key.copy_from_slice(bytes);
        Ok(Self { wrapping_key: key })
    }

    /// Load the wrapping key from `path`, creating it (owner-only) if missing.
    pub fn open_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(fs::read(path)?);
            debug!(path = %path.display(), "loaded key store");
            return Self::from_key_bytes(&bytes);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self::generate()?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(store.wrapping_key.as_ref())?;
        file.sync_all()?;

        info!(path = %path.display(), "created key store");
        Ok(store)
    }

    fn key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, self.wrapping_key.as_ref())
            .map_err(|_| CryptoError::KeyStore("invalid wrapping key".into()))?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl KeyStore for SoftwareKeyStore {
    /// Output: `[nonce(12)][ciphertext + tag(16)]`.
    fn wrap_private_key(&self, secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Rng)?;

        let mut in_out = secret.to_vec();
        self.key()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(WRAP_AAD),
                &mut in_out,
            )
            .map_err(|_| CryptoError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn unwrap_private_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if wrapped.len() < NONCE_LEN + 16 {
            return Err(CryptoError::TooShort {
                expected: NONCE_LEN + 16,
                got: wrapped.len(),
            });
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&wrapped[..NONCE_LEN]);

        let mut in_out = Zeroizing::new(wrapped[NONCE_LEN..].to_vec());
        let plaintext = self
            .key()?
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(WRAP_AAD),
                &mut in_out,
            )
            .map_err(|_| CryptoError::KeyStore("cannot unwrap identity secret".into()))?;
        Ok(Zeroizing::new(plaintext.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn wrap_unwrap_roundtrip() {
        let store = SoftwareKeyStore::generate().unwrap();
        let wrapped = store.wrap_private_key(&[9u8; 32]).unwrap();
        assert_ne!(&wrapped[NONCE_LEN..NONCE_LEN + 32], &[9u8; 32]);
        assert_eq!(store.unwrap_private_key(&wrapped).unwrap().as_slice(), &[9u8; 32]);
    }

    #[test]
    fn other_store_cannot_unwrap() {
        let a = SoftwareKeyStore::generate().unwrap();
        let b = SoftwareKeyStore::generate().unwrap();
        let wrapped = a.wrap_private_key(&[1u8; 32]).unwrap();
        assert!(b.unwrap_private_key(&wrapped).is_err());
    }

    #[test]
    fn identity_created_then_restored() {
        let store = SoftwareKeyStore::generate().unwrap();
        let (pair, sealed) = store.get_or_create_identity(None).unwrap();
        assert_eq!(pair.public_key(), sealed.public_key);

        let (restored, again) = store.get_or_create_identity(Some(&sealed)).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
        assert_eq!(again, sealed);
    }

    #[test]
    fn mismatched_public_key_rejected() {
        let store = SoftwareKeyStore::generate().unwrap();
        let (_, mut sealed) = store.get_or_create_identity(None).unwrap();
        sealed.public_key = IdentityKeyPair::generate().public_key();
        assert!(matches!(
            store.get_or_create_identity(Some(&sealed)),
            Err(CryptoError::KeyStore(_))
        ));
    }

    #[test]
    fn file_store_persists_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = SoftwareKeyStore::open_or_create(&path).unwrap();
        let wrapped = first.wrap_private_key(b"seed").unwrap();

        let second = SoftwareKeyStore::open_or_create(&path).unwrap();
        assert_eq!(second.unwrap_private_key(&wrapped).unwrap().as_slice(), b"seed");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn corrupt_key_file_rejected() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), b"short").unwrap();
        assert!(SoftwareKeyStore::open_or_create(file.path()).is_err());
    }
}
