//! Cryptographic primitives for Stateline
//!
//! Authenticated encryption for wire envelopes using modern AEAD ciphers,
//! plus pre-shared key generation and encoding helpers.

pub mod cipher;
pub mod keys;

pub use cipher::{create_cipher, Cipher, CipherAlgorithm, NonceGenerator, NONCE_SIZE, TAG_SIZE};
pub use keys::{decode_key, encode_key, generate_key, key_from_env, KEY_ENV_VAR};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key handling failed: {0}")]
    KeyFailed(String),
}
