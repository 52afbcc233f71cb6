//! Cryptographic primitives for the multiplex engine
//!
//! This module provides:
//! - The `Obfuscator` contract turning frames into opaque records and back
//! - Plain, AES-256-GCM and ChaCha20-Poly1305 cipher suites
//! - Secure random number generation

mod obfuscator;

pub use obfuscator::{
    make_obfuscator, EncryptionMethod, Obfuscator, PlainObfuscator, RECORD_OVERHEAD_AEAD,
    RECORD_OVERHEAD_PLAIN,
};

use thiserror::Error;

/// Length of the session key in bytes
pub const KEY_LEN: usize = 32;

/// Length of a record nonce (and of the plain suite's IV-equivalent prefix)
pub const NONCE_LEN: usize = 12;

/// Length of the AEAD authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("obfuscated record truncated: {0} bytes")]
    BadPayloadLength(usize),

    #[error("AEAD verification failed")]
    DecryptionFailed,

    #[error("AEAD sealing failed")]
    EncryptionFailed,

    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("destination buffer too small: {needed} > {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("unknown encryption method: {0:#04x}")]
    UnknownMethod(u8),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system CSPRNG failure");
}

/// Generate a random record nonce
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_nonce_uniqueness() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
