use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("input too short: expected at least {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("sealed message could not be opened")]
    OpenFailed,

    #[error("encryption failed")]
    SealFailed,

    #[error("incorrect password or corrupted database")]
    CannotDecrypt,

    #[error("unrecognized database header")]
    BadHeader,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("random number generator failed")]
    Rng,

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_short_display() {
        let e = CryptoError::TooShort { expected: 48, got: 5 };
        let msg = e.to_string();
        assert!(msg.contains("48"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn cannot_decrypt_does_not_leak_cause() {
        assert_eq!(
            CryptoError::CannotDecrypt.to_string(),
            "incorrect password or corrupted database"
        );
    }
}
