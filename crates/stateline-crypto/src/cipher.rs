//! AEAD cipher implementations
//!
//! All supported ciphers use a 12-byte nonce and a 16-byte authentication
//! tag, so the wire format does not vary with the algorithm.

use crate::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;

/// Authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Nonce size in bytes, shared by all supported algorithms.
pub const NONCE_SIZE: usize = 12;

/// Supported cipher algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CipherAlgorithm {
    /// AES-128-GCM
    #[cfg_attr(feature = "clap", value(name = "aes-gcm"))]
    Aes128Gcm,
    /// AES-256-GCM
    #[cfg_attr(feature = "clap", value(name = "aes-256-gcm"))]
    Aes256Gcm,
    /// ChaCha20-Poly1305
    #[cfg_attr(feature = "clap", value(name = "chacha20-poly1305"))]
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    /// Key size in bytes for this algorithm.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::ChaCha20Poly1305 => 32,
        }
    }
}

/// Trait for AEAD cipher operations
pub trait Cipher: Send + Sync {
    /// Encrypt a message, binding the associated data into the tag.
    fn encrypt(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a message. Fails on any tag or associated-data mismatch.
    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn algorithm(&self) -> CipherAlgorithm;
}

/// Generic AEAD wrapper; all three supported ciphers share the same
/// nonce/tag dimensions, so one implementation covers them.
struct AeadCipher<A> {
    inner: A,
    algorithm: CipherAlgorithm,
}

impl<A> Cipher for AeadCipher<A>
where
    A: Aead + Send + Sync,
{
    fn encrypt(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                got: nonce.len(),
            });
        }
        self.inner
            .encrypt(
                aes_gcm::aead::Nonce::<A>::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                got: nonce.len(),
            });
        }
        self.inner
            .decrypt(
                aes_gcm::aead::Nonce::<A>::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// Create a cipher instance from an algorithm and key.
pub fn create_cipher(
    algorithm: CipherAlgorithm,
    key: &[u8],
) -> Result<Box<dyn Cipher>, CryptoError> {
    if key.len() != algorithm.key_size() {
        return Err(CryptoError::InvalidKeyLength {
            expected: algorithm.key_size(),
            got: key.len(),
        });
    }
    match algorithm {
        CipherAlgorithm::Aes128Gcm => Ok(Box::new(AeadCipher {
            inner: Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                expected: algorithm.key_size(),
                got: key.len(),
            })?,
            algorithm,
        })),
        CipherAlgorithm::Aes256Gcm => Ok(Box::new(AeadCipher {
            inner: Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                expected: algorithm.key_size(),
                got: key.len(),
            })?,
            algorithm,
        })),
        CipherAlgorithm::ChaCha20Poly1305 => Ok(Box::new(AeadCipher {
            inner: ChaCha20Poly1305::new_from_slice(key).map_err(|_| {
                CryptoError::InvalidKeyLength {
                    expected: algorithm.key_size(),
                    got: key.len(),
                }
            })?,
            algorithm,
        })),
    }
}

/// Counter-based nonce generator.
///
/// The first four nonce bytes are a random per-generator prefix, so many
/// connections can share one key without ever repeating a (key, nonce)
/// pair. The high bit of the counter word encodes the direction (client or
/// server) so the two sides of a connection never collide either. Nonces
/// travel on the wire with the ciphertext; the receiver never has to
/// predict them.
pub struct NonceGenerator {
    prefix: [u8; 4],
    counter: u64,
    server_side: bool,
}

impl NonceGenerator {
    pub fn new(server_side: bool) -> Self {
        Self {
            prefix: rand::random(),
            counter: 0,
            server_side,
        }
    }

    /// Generate the next nonce.
    pub fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&self.prefix);
        let word = if self.server_side {
            0x8000_0000_0000_0000 | self.counter
        } else {
            self.counter
        };
        nonce[4..].copy_from_slice(&word.to_be_bytes());

        self.counter += 1;
        if self.counter >= 0x7FFF_FFFF_FFFF_FFFF {
            // Centuries away at any plausible envelope rate.
            panic!("nonce counter exhausted");
        }
        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY32: [u8; 32] = [7u8; 32];

    #[test]
    fn encrypt_decrypt_roundtrip_all_algorithms() {
        for algorithm in [
            CipherAlgorithm::Aes128Gcm,
            CipherAlgorithm::Aes256Gcm,
            CipherAlgorithm::ChaCha20Poly1305,
        ] {
            let key = vec![7u8; algorithm.key_size()];
            let cipher = create_cipher(algorithm, &key).unwrap();
            let nonce = [1u8; NONCE_SIZE];

            let ciphertext = cipher.encrypt(&nonce, b"hello party", b"hdr").unwrap();
            assert_eq!(ciphertext.len(), b"hello party".len() + TAG_SIZE);

            let plaintext = cipher.decrypt(&nonce, &ciphertext, b"hdr").unwrap();
            assert_eq!(plaintext, b"hello party");
        }
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let cipher = create_cipher(CipherAlgorithm::ChaCha20Poly1305, &KEY32).unwrap();
        let nonce = [2u8; NONCE_SIZE];
        let mut ciphertext = cipher.encrypt(&nonce, b"payload", &[]).unwrap();
        ciphertext[0] ^= 0x01;

        assert!(matches!(
            cipher.decrypt(&nonce, &ciphertext, &[]),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn mismatched_aad_fails_closed() {
        let cipher = create_cipher(CipherAlgorithm::Aes256Gcm, &KEY32).unwrap();
        let nonce = [3u8; NONCE_SIZE];
        let ciphertext = cipher.encrypt(&nonce, b"payload", b"seq=1").unwrap();

        assert!(cipher.decrypt(&nonce, &ciphertext, b"seq=2").is_err());
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        assert!(matches!(
            create_cipher(CipherAlgorithm::Aes256Gcm, &[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: 16
            })
        ));
    }

    #[test]
    fn parallel_generators_on_one_key_use_distinct_nonce_streams() {
        // Two sessions against the same listener share its key; their
        // generators must not replay each other's nonces at equal counters.
        let mut a = NonceGenerator::new(true);
        let mut b = NonceGenerator::new(true);
        assert_ne!(a.next_nonce(), b.next_nonce());
        assert_ne!(a.next_nonce(), b.next_nonce());
    }

    #[test]
    fn nonce_directions_never_collide() {
        let mut client = NonceGenerator::new(false);
        let mut server = NonceGenerator::new(true);

        let c: Vec<_> = (0..8).map(|_| client.next_nonce()).collect();
        let s: Vec<_> = (0..8).map(|_| server.next_nonce()).collect();
        for nonce in &c {
            assert!(!s.contains(nonce));
        }
        // And each side is strictly unique.
        for i in 0..c.len() {
            for j in (i + 1)..c.len() {
                assert_ne!(c[i], c[j]);
            }
        }
    }
}
