use std::sync::Arc;

use meshcall_crypto::{
    decrypt_message, encrypt_message, CryptoError, IdentityKeyPair, KeyStore, PublicKey,
    SealedIdentity,
};

/// This node's identity. The secret stays wrapped; each operation unwraps
/// it through the key store and drops (wipes) it when done.
pub struct LocalIdentity {
    keystore: Arc<dyn KeyStore>,
    sealed: SealedIdentity,
}

impl LocalIdentity {
    /// Restore `stored`, or create a fresh identity if there is none.
    pub fn load_or_create(
        keystore: Arc<dyn KeyStore>,
        stored: Option<&SealedIdentity>,
    ) -> Result<Self, CryptoError> {
        let (_pair, sealed) = keystore.get_or_create_identity(stored)?;
        Ok(Self { keystore, sealed })
    }

    pub fn public_key(&self) -> PublicKey {
        self.sealed.public_key
    }

    pub fn sealed(&self) -> &SealedIdentity {
        &self.sealed
    }

    pub fn fingerprint(&self) -> String {
        self.sealed.public_key.fingerprint()
    }

    fn unwrap_pair(&self) -> Result<IdentityKeyPair, CryptoError> {
        let secret = self.keystore.unwrap_private_key(&self.sealed.wrapped_secret)?;
        IdentityKeyPair::from_secret_bytes(&secret)
    }

    pub fn encrypt(&self, plaintext: &str, recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        let pair = self.unwrap_pair()?;
        encrypt_message(plaintext, recipient, &pair)
    }

    /// Returns the plaintext and the key it claims to be signed by.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<(String, PublicKey), CryptoError> {
        let pair = self.unwrap_pair()?;
        decrypt_message(ciphertext, &pair)
    }
}

#[cfg(test)]
pub(crate) fn test_identity() -> LocalIdentity {
    let keystore: Arc<dyn KeyStore> =
        Arc::new(meshcall_crypto::SoftwareKeyStore::generate().unwrap());
    LocalIdentity::load_or_create(keystore, None).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_crypto::SoftwareKeyStore;

    #[test]
    fn encrypt_between_identities() {
        let alice = test_identity();
        let bob = test_identity();

        let ct = alice.encrypt(r#"{"action":"ping"}"#, &bob.public_key()).unwrap();
        let (text, sender) = bob.decrypt(&ct).unwrap();
        assert_eq!(text, r#"{"action":"ping"}"#);
        assert_eq!(sender, alice.public_key());
        assert!(alice.decrypt(&ct).is_err());
    }

    #[test]
    fn restores_same_identity() {
        let keystore: Arc<dyn KeyStore> = Arc::new(SoftwareKeyStore::generate().unwrap());
        let first = LocalIdentity::load_or_create(keystore.clone(), None).unwrap();
        let second = LocalIdentity::load_or_create(keystore, Some(first.sealed())).unwrap();
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }
}
