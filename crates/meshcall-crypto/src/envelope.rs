//! Signed-then-sealed signaling envelope.
//!
//! Sealed payload: `[sender public key (32)][signature (64) ‖ plaintext]`.
//! The seal hides who is talking; the inner signature proves it once opened.

use crate::error::CryptoError;
use crate::identity::{verify_signed, IdentityKeyPair, PublicKey, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::seal;

/// Sign `plaintext` as `sender` and seal it to `recipient`.
pub fn encrypt_message(
    plaintext: &str,
    recipient: &PublicKey,
    sender: &IdentityKeyPair,
) -> Result<Vec<u8>, CryptoError> {
    let signed = sender.sign(plaintext.as_bytes());

    let mut inner = Vec::with_capacity(PUBLIC_KEY_LEN + signed.len());
    inner.extend_from_slice(sender.public_key().as_bytes());
    inner.extend_from_slice(&signed);

    seal::seal(&inner, &recipient.to_x25519()?)
}

/// Open an envelope addressed to `own` and return the plaintext together with
/// the public key it claims to come from. The caller must compare that key
/// with the contact it expected.
pub fn decrypt_message(
    ciphertext: &[u8],
    own: &IdentityKeyPair,
) -> Result<(String, PublicKey), CryptoError> {
    let inner = seal::open(ciphertext, &own.to_x25519_secret())?;

    let min = PUBLIC_KEY_LEN + SIGNATURE_LEN;
    if inner.len() < min {
        return Err(CryptoError::TooShort {
            expected: min,
            got: inner.len(),
        });
    }
    let (sender_bytes, signed) = inner.split_at(PUBLIC_KEY_LEN);
    let sender = PublicKey::from_bytes(sender_bytes)?;
    let message = verify_signed(signed, &sender)?;
    let text = String::from_utf8(message).map_err(|_| CryptoError::InvalidUtf8)?;
    Ok((text, sender))
}
