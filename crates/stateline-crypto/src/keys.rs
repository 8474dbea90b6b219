//! Pre-shared key generation and encoding
//!
//! Session keys are issued out of band (alongside the identity token) and
//! handed to the client base64-encoded.

use crate::{CipherAlgorithm, CryptoError};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;

/// Generate a random key for the given cipher algorithm.
pub fn generate_key(algorithm: CipherAlgorithm) -> Vec<u8> {
    let mut key = vec![0u8; algorithm.key_size()];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Encode a key to base64 for transmission.
pub fn encode_key(key: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(key)
}

/// Decode a key from base64.
pub fn decode_key(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| CryptoError::KeyFailed(format!("invalid base64 key: {e}")))
}

/// Environment variable used to hand the session key to the client binary.
pub const KEY_ENV_VAR: &str = "STATELINE_KEY";

/// Read the session key from the environment and immediately unset it.
pub fn key_from_env() -> Option<String> {
    match std::env::var(KEY_ENV_VAR) {
        Ok(key) => {
            std::env::remove_var(KEY_ENV_VAR);
            Some(key)
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_matches_algorithm_size() {
        assert_eq!(generate_key(CipherAlgorithm::Aes128Gcm).len(), 16);
        assert_eq!(generate_key(CipherAlgorithm::Aes256Gcm).len(), 32);
        assert_eq!(generate_key(CipherAlgorithm::ChaCha20Poly1305).len(), 32);
    }

    #[test]
    fn key_encoding_roundtrips() {
        let key = generate_key(CipherAlgorithm::Aes256Gcm);
        let encoded = encode_key(&key);
        assert_eq!(decode_key(&encoded).unwrap(), key);
    }

    #[test]
    fn malformed_base64_is_rejected() {
        assert!(decode_key("not!!valid@@base64").is_err());
    }
}
