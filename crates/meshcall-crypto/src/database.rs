//! Password-based sealing of the local database blob.
//!
//! File format: `[header(4) = 0][salt(16)][nonce(12)][ciphertext + tag(16)]`.
//! The key is derived with Argon2id at the interactive work factor and the
//! header is bound as associated data.

use argon2::{Algorithm, Argon2, Params, Version};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const HEADER: [u8; 4] = [0, 0, 0, 0];
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = HEADER.len() + SALT_LEN + NONCE_LEN; // 32 bytes

// Interactive tier: 64 MiB, 2 passes, 1 lane.
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_PASSES: u32 = 2;
const ARGON2_LANES: u32 = 1;

/// Smallest blob `open_database` will look at.
pub const MIN_SEALED_LEN: usize = HEADER_LEN + TAG_LEN;

/// Derive a ChaCha20-Poly1305 key from password and salt.
fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> Result<LessSafeKey, CryptoError> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_PASSES,
        ARGON2_LANES,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key_bytes = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(password.as_bytes(), salt, key_bytes.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, key_bytes.as_ref())
        .map_err(|_| CryptoError::KeyDerivation("invalid key length".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt a serialized database under `password`.
pub fn seal_database(plaintext: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| CryptoError::Rng)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Rng)?;

    let key = derive_key(password, &salt)?;
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(&HEADER),
        &mut in_out,
    )
    .map_err(|_| CryptoError::SealFailed)?;

    let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
    file_data.extend_from_slice(&HEADER);
    file_data.extend_from_slice(&salt);
    file_data.extend_from_slice(&nonce_bytes);
    file_data.extend_from_slice(&in_out);
    Ok(file_data)
}

/// Decrypt a blob produced by [`seal_database`].
///
/// Wrong passwords and any modification fail with
/// [`CryptoError::CannotDecrypt`]; no partial plaintext is ever returned.
pub fn open_database(blob: &[u8], password: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if blob.len() < MIN_SEALED_LEN {
        return Err(CryptoError::TooShort {
            expected: MIN_SEALED_LEN,
            got: blob.len(),
        });
    }
    if !has_valid_header(blob) {
        return Err(CryptoError::BadHeader);
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&blob[4..4 + SALT_LEN]);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&blob[4 + SALT_LEN..HEADER_LEN]);

    let key = derive_key(password, &salt)?;

    let mut ciphertext = Zeroizing::new(blob[HEADER_LEN..].to_vec());
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&HEADER),
            &mut ciphertext,
        )
        .map_err(|_| CryptoError::CannotDecrypt)?;

    Ok(Zeroizing::new(plaintext.to_vec()))
}

/// Check if file data starts with the expected zero header.
pub fn has_valid_header(blob: &[u8]) -> bool {
    blob.len() >= HEADER.len() && blob[..HEADER.len()] == HEADER
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &[u8] = br#"{"settings":{"username":"alice"},"contacts":[],"events":[]}"#;

    #[test]
    fn roundtrip() {
        let blob = seal_database(DB, "hunter2").unwrap();
        assert!(has_valid_header(&blob));
        assert_eq!(blob.len(), HEADER_LEN + DB.len() + TAG_LEN);
        assert_eq!(open_database(&blob, "hunter2").unwrap().as_slice(), DB);
    }

    #[test]
    fn wrong_password_fails_closed() {
        let blob = seal_database(DB, "correct").unwrap();
        assert!(matches!(
            open_database(&blob, "incorrect"),
            Err(CryptoError::CannotDecrypt)
        ));
        assert!(matches!(
            open_database(&blob, ""),
            Err(CryptoError::CannotDecrypt)
        ));
    }

    #[test]
    fn empty_password_is_a_password() {
        let blob = seal_database(b"[]", "").unwrap();
        assert_eq!(open_database(&blob, "").unwrap().as_slice(), b"[]");
    }

    #[test]
    fn tampering_fails() {
        let blob = seal_database(DB, "pw").unwrap();
        let salt = HEADER.len();
        let nonce = salt + SALT_LEN;
        let tag = blob.len() - TAG_LEN;
        let positions = [
            0,
            1,
            2,
            3,
            salt,
            nonce - 1,
            nonce,
            HEADER_LEN - 1,
            HEADER_LEN,
            HEADER_LEN + 10,
            tag - 1,
            tag,
            blob.len() - 1,
        ];
        for i in positions {
            let mut bad = blob.clone();
            bad[i] ^= 0x01;
            assert!(open_database(&bad, "pw").is_err(), "byte {i} accepted");
        }
    }

    #[test]
    fn nonzero_header_rejected() {
        let mut blob = seal_database(DB, "pw").unwrap();
        blob[0] = 1;
        assert!(matches!(
            open_database(&blob, "pw"),
            Err(CryptoError::BadHeader)
        ));
    }

    #[test]
    fn short_blob_rejected() {
        assert!(matches!(
            open_database(&[0u8; MIN_SEALED_LEN - 1], "pw"),
            Err(CryptoError::TooShort { .. })
        ));
        assert!(!has_valid_header(&[0, 0]));
    }

    #[test]
    fn fresh_salt_and_nonce_per_seal() {
        let a = seal_database(DB, "pw").unwrap();
        let b = seal_database(DB, "pw").unwrap();
        assert_ne!(a[4..HEADER_LEN], b[4..HEADER_LEN]);
    }
}
