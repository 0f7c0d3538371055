//! Anonymous sealing to an X25519 public key.
//!
//! Wire form: `[ephemeral public key (32)][ciphertext ‖ tag (16)]`.
//! Each message uses a fresh ephemeral key, so the derived AEAD key is
//! single-use and the nonce can stay all-zero.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const EPHEMERAL_LEN: usize = 32;
const TAG_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"meshcall anonymous seal v1";

/// Bytes added by [`seal`] on top of the plaintext.
pub const SEAL_OVERHEAD: usize = EPHEMERAL_LEN + TAG_LEN;

fn derive_key(
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<LessSafeKey, CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, okm.as_mut())
        .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".into()))?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, okm.as_ref())
        .map_err(|_| CryptoError::KeyDerivation("invalid AEAD key length".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` so that only the holder of `recipient`'s secret can open it.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "recipient key yields a non-contributory shared secret".into(),
        ));
    }
    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient)?;

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key([0u8; NONCE_LEN]),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(EPHEMERAL_LEN + in_out.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Open a sealed box with the recipient's secret.
pub fn open(sealed: &[u8], recipient_secret: &StaticSecret) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::TooShort {
            expected: SEAL_OVERHEAD,
            got: sealed.len(),
        });
    }
    let (epk_bytes, ciphertext) = sealed.split_at(EPHEMERAL_LEN);
    let mut epk = [0u8; EPHEMERAL_LEN];
    epk.copy_from_slice(epk_bytes);
    let ephemeral_public = PublicKey::from(epk);
    let recipient_public = PublicKey::from(recipient_secret);

    let shared = recipient_secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::OpenFailed);
    }
    let key = derive_key(shared.as_bytes(), &ephemeral_public, &recipient_public)?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key([0u8; NONCE_LEN]),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::OpenFailed)?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn seal_open_roundtrip() {
        let (secret, public) = keypair();
        let sealed = seal(b"sealed payload", &public).unwrap();
        assert_eq!(sealed.len(), b"sealed payload".len() + SEAL_OVERHEAD);
        assert_eq!(open(&sealed, &secret).unwrap(), b"sealed payload");
    }

    #[test]
    fn ciphertexts_differ_per_call() {
        let (_, public) = keypair();
        let a = seal(b"same", &public).unwrap();
        let b = seal(b"same", &public).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_recipient_fails() {
        let (_, public) = keypair();
        let (other_secret, _) = keypair();
        let sealed = seal(b"secret", &public).unwrap();
        assert!(matches!(
            open(&sealed, &other_secret),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn every_byte_is_authenticated() {
        let (secret, public) = keypair();
        let sealed = seal(b"tamper me", &public).unwrap();
        for i in 0..sealed.len() {
            let mut bad = sealed.clone();
            bad[i] ^= 0x80;
            assert!(open(&bad, &secret).is_err(), "byte {i} not authenticated");
        }
    }

    #[test]
    fn short_input_rejected() {
        let (secret, _) = keypair();
        assert!(matches!(
            open(&[0u8; SEAL_OVERHEAD - 1], &secret),
            Err(CryptoError::TooShort { .. })
        ));
    }

    #[test]
    fn low_order_recipient_rejected() {
        let zero = PublicKey::from([0u8; 32]);
        assert!(matches!(
            seal(b"x", &zero),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
