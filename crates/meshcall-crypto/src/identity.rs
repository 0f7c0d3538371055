//! Identity keys.
//!
//! Each installation has one long-term Ed25519 key pair. The public half is
//! the contact identifier; the same key is converted to X25519 when a peer
//! seals a message to us.

use std::fmt;
use std::hash::{Hash, Hasher};

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use ring::digest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// Ed25519 public key size.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 seed size.
pub const SECRET_KEY_LEN: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 public key. Serialized as lowercase hex.
#[derive(Clone, Copy, Eq)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Parse and validate a 32-byte Ed25519 public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("bad hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Human-readable digest for out-of-band comparison.
    pub fn fingerprint(&self) -> String {
        render_fingerprint(&self.0)
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Birational map from the Ed25519 curve to Curve25519.
    pub(crate) fn to_x25519(&self) -> Result<X25519Public, CryptoError> {
        let compressed = CompressedEdwardsY::from_slice(&self.0)
            .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
        let point = compressed.decompress().ok_or_else(|| {
            CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
        })?;
        Ok(X25519Public::from(point.to_montgomery().to_bytes()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_hex()[..12])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Fingerprint of a raw public key: SHA-256, upper-case hex in groups of four.
///
/// Example: `"3F2A 91C0 …"` (16 groups).
pub fn fingerprint(public_key: &[u8]) -> Result<String, CryptoError> {
    if public_key.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
            public_key.len()
        )));
    }
    Ok(render_fingerprint(public_key))
}

fn render_fingerprint(public_key: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, public_key);
    hex::encode_upper(hash.as_ref())
        .as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Long-term identity signing key. The seed is wiped on drop.
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild from a 32-byte Ed25519 seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut seed: [u8; SECRET_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "identity key must be {SECRET_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(Self { signing_key })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_LEN]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Sign `message` in combined form: `signature ‖ message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature = self.signing_key.sign(message);
        let mut signed = Vec::with_capacity(SIGNATURE_LEN + message.len());
        signed.extend_from_slice(&signature.to_bytes());
        signed.extend_from_slice(message);
        signed
    }

    /// X25519 secret matching [`PublicKey::to_x25519`] for this key.
    pub(crate) fn to_x25519_secret(&self) -> StaticSecret {
        let mut h = Sha512::digest(self.signing_key.as_bytes());
        // Clamp as per RFC 7748 §5
        h[0] &= 248;
        h[31] &= 127;
        h[31] |= 64;
        let mut key = [0u8; 32];
        key.copy_from_slice(&h[..32]);
        h.as_mut_slice().zeroize();
        let secret = StaticSecret::from(key);
        key.zeroize();
        secret
    }
}

/// Verify a combined `signature ‖ message` and return the message.
pub fn verify_signed(signed: &[u8], signer: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    if signed.len() < SIGNATURE_LEN {
        return Err(CryptoError::TooShort {
            expected: SIGNATURE_LEN,
            got: signed.len(),
        });
    }
    let (sig_bytes, message) = signed.split_at(SIGNATURE_LEN);
    let sig_arr: [u8; SIGNATURE_LEN] = sig_bytes
        .try_into()
        .map_err(|_| CryptoError::SignatureVerification)?;
    let signature = Signature::from_bytes(&sig_arr);
    signer
        .verifying_key()?
        .verify(message, &signature)
        .map_err(|_| CryptoError::SignatureVerification)?;
    Ok(message.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_roundtrip() {
        let pair = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(pair.secret_bytes().as_ref()).unwrap();
        assert_eq!(pair.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let key = IdentityKeyPair::generate().public_key();
        let parsed = PublicKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);

        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn public_key_rejects_bad_length() {
        assert!(PublicKey::from_bytes(&[1u8; 31]).is_err());
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let key = IdentityKeyPair::generate().public_key();
        let a = fingerprint(key.as_bytes()).unwrap();
        let b = key.fingerprint();
        assert_eq!(a, b);
        // 32 bytes of SHA-256 -> 64 hex chars -> 16 groups of 4
        assert_eq!(a.split(' ').count(), 16);
        assert!(a.chars().all(|c| c == ' ' || c.is_ascii_hexdigit()));
        assert_eq!(a, a.to_uppercase());
    }

    #[test]
    fn fingerprint_differs_between_keys() {
        let a = IdentityKeyPair::generate().public_key();
        let b = IdentityKeyPair::generate().public_key();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_rejects_bad_length() {
        assert!(fingerprint(&[0u8; 16]).is_err());
        assert!(fingerprint(&[]).is_err());
    }

    #[test]
    fn sign_and_verify() {
        let pair = IdentityKeyPair::generate();
        let signed = pair.sign(b"hello");
        assert_eq!(signed.len(), SIGNATURE_LEN + 5);
        assert_eq!(verify_signed(&signed, &pair.public_key()).unwrap(), b"hello");
    }

    #[test]
    fn verify_rejects_wrong_signer_and_tampering() {
        let pair = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let mut signed = pair.sign(b"hello");

        assert!(matches!(
            verify_signed(&signed, &other.public_key()),
            Err(CryptoError::SignatureVerification)
        ));

        let last = signed.len() - 1;
        signed[last] ^= 0x01;
        assert!(verify_signed(&signed, &pair.public_key()).is_err());

        assert!(matches!(
            verify_signed(&[0u8; 10], &pair.public_key()),
            Err(CryptoError::TooShort { .. })
        ));
    }

    #[test]
    fn x25519_conversion_agrees() {
        let pair = IdentityKeyPair::generate();
        let from_secret = X25519Public::from(&pair.to_x25519_secret());
        let from_public = pair.public_key().to_x25519().unwrap();
        assert_eq!(from_secret.as_bytes(), from_public.as_bytes());
    }
}
