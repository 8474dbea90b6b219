//! Wire envelopes and the seal/open pipeline
//!
//! An envelope is one framed wire unit. On seal the plaintext payload is
//! checksummed, compressed (unless tiny), then AEAD-encrypted with the
//! envelope header bound in as associated data. The layout is
//! `[kind:1][priority:1][sequence:8][length:4][payload:N][checksum:4]`,
//! big-endian, where the payload is `nonce || ciphertext` and the checksum
//! covers the plaintext before compression.

use crate::NetError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use stateline_crypto::{Cipher, NonceGenerator, NONCE_SIZE, TAG_SIZE};
use stateline_state::{CompressionAlgorithm, Compressor};

/// Envelope type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Full snapshot payload.
    Full = 0,
    /// Sparse delta payload.
    Delta = 1,
    /// Keepalive, empty payload.
    Heartbeat = 2,
    /// Cumulative acknowledgment; payload is the acked sequence.
    Ack = 3,
    /// Forced full-snapshot resync.
    Resync = 4,
    /// Handshake, client to server.
    Hello = 5,
    /// Handshake, server to client.
    HelloAck = 6,
}

impl EnvelopeKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Full),
            1 => Some(Self::Delta),
            2 => Some(Self::Heartbeat),
            3 => Some(Self::Ack),
            4 => Some(Self::Resync),
            5 => Some(Self::Hello),
            6 => Some(Self::HelloAck),
            _ => None,
        }
    }
}

/// Strict delivery tiers. High drains before Medium, Medium before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl Priority {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::High),
            1 => Some(Self::Medium),
            2 => Some(Self::Low),
            _ => None,
        }
    }
}

/// One framed wire unit. Owned by the sending connection until acked.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub priority: Priority,
    pub sequence: u64,
    pub payload: Bytes,
    pub checksum: u32,
}

/// Fixed header length: kind + priority + sequence + payload length.
pub const HEADER_LEN: usize = 1 + 1 + 8 + 4;

/// Trailing checksum length.
pub const TRAILER_LEN: usize = 4;

impl Envelope {
    /// Append the framed envelope to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), NetError> {
        if self.payload.len() > u32::MAX as usize {
            return Err(NetError::Protocol("envelope payload too large".into()));
        }
        buf.reserve(HEADER_LEN + self.payload.len() + TRAILER_LEN);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.priority as u8);
        buf.put_u64(self.sequence);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.put_u32(self.checksum);
        Ok(())
    }

    /// Decode one envelope from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, NetError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek the payload length without consuming the header.
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[10..14]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        if buf.len() < HEADER_LEN + payload_len + TRAILER_LEN {
            return Ok(None);
        }

        let kind = EnvelopeKind::from_u8(buf.get_u8())
            .ok_or_else(|| NetError::Protocol("unknown envelope kind".into()))?;
        let priority = Priority::from_u8(buf.get_u8())
            .ok_or_else(|| NetError::Protocol("unknown envelope priority".into()))?;
        let sequence = buf.get_u64();
        let _ = buf.get_u32();
        let payload = buf.split_to(payload_len).freeze();
        let checksum = buf.get_u32();

        Ok(Some(Envelope {
            kind,
            priority,
            sequence,
            payload,
            checksum,
        }))
    }
}

/// Payloads below this size skip compression; the framing overhead would
/// exceed any savings.
const MIN_COMPRESS_LEN: usize = 64;

/// Payloads below this size compress with LZ4, larger ones with zstd.
const LZ4_CUTOFF: usize = 1024;

const TAG_PLAIN: u8 = 0;
const TAG_LZ4: u8 = 1;
const TAG_ZSTD: u8 = 2;

/// Seals plaintext payloads into envelopes and opens them back up.
///
/// One codec instance per connection direction. Nonces combine a random
/// per-codec prefix with a direction-tagged counter, so connections sharing
/// one key cannot repeat a (key, nonce) pair.
pub struct EnvelopeCodec {
    cipher: Box<dyn Cipher>,
    nonce_gen: NonceGenerator,
    lz4: Compressor,
    zstd: Compressor,
}

impl EnvelopeCodec {
    pub fn new(cipher: Box<dyn Cipher>, server_side: bool) -> Self {
        Self {
            cipher,
            nonce_gen: NonceGenerator::new(server_side),
            lz4: Compressor::new(CompressionAlgorithm::Lz4),
            zstd: Compressor::new(CompressionAlgorithm::Zstd),
        }
    }

    /// Compress and encrypt `plaintext` into an envelope.
    pub fn seal(
        &mut self,
        kind: EnvelopeKind,
        priority: Priority,
        sequence: u64,
        plaintext: &[u8],
    ) -> Result<Envelope, NetError> {
        let checksum = crc32fast::hash(plaintext);

        let (tag, body) = if plaintext.len() < MIN_COMPRESS_LEN {
            (TAG_PLAIN, plaintext.to_vec())
        } else if plaintext.len() < LZ4_CUTOFF {
            (TAG_LZ4, self.lz4.compress(plaintext)?)
        } else {
            (TAG_ZSTD, self.zstd.compress(plaintext)?)
        };

        let mut framed = Vec::with_capacity(1 + body.len());
        framed.push(tag);
        framed.extend_from_slice(&body);

        let nonce = self.nonce_gen.next_nonce();
        let aad = header_aad(kind, priority, sequence);
        let ciphertext = self.cipher.encrypt(&nonce, &framed, &aad)?;

        let mut payload = BytesMut::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        Ok(Envelope {
            kind,
            priority,
            sequence,
            payload: payload.freeze(),
            checksum,
        })
    }

    /// Decrypt and decompress an envelope back to its plaintext payload.
    ///
    /// Authentication failure is [`NetError::Decrypt`] (connection-fatal);
    /// a plaintext checksum mismatch is [`NetError::Integrity`] (drop the
    /// envelope, request a resend).
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, NetError> {
        if envelope.payload.len() < NONCE_SIZE + TAG_SIZE {
            return Err(NetError::Protocol("envelope payload truncated".into()));
        }
        let (nonce, ciphertext) = envelope.payload.split_at(NONCE_SIZE);

        let aad = header_aad(envelope.kind, envelope.priority, envelope.sequence);
        let framed = self
            .cipher
            .decrypt(nonce, ciphertext, &aad)
            .map_err(|_| NetError::Decrypt)?;

        let (tag, body) = framed
            .split_first()
            .ok_or_else(|| NetError::Protocol("empty envelope body".into()))?;
        let plaintext = match *tag {
            TAG_PLAIN => body.to_vec(),
            TAG_LZ4 => self.lz4.decompress(body)?,
            TAG_ZSTD => self.zstd.decompress(body)?,
            other => {
                return Err(NetError::Protocol(format!(
                    "unknown compression tag {other}"
                )))
            }
        };

        if crc32fast::hash(&plaintext) != envelope.checksum {
            return Err(NetError::Integrity {
                sequence: envelope.sequence,
            });
        }
        Ok(plaintext)
    }
}

fn header_aad(kind: EnvelopeKind, priority: Priority, sequence: u64) -> [u8; 10] {
    let mut aad = [0u8; 10];
    aad[0] = kind as u8;
    aad[1] = priority as u8;
    aad[2..].copy_from_slice(&sequence.to_be_bytes());
    aad
}

/// Encode the payload of an Ack envelope.
pub fn ack_payload(acked_sequence: u64) -> [u8; 8] {
    acked_sequence.to_be_bytes()
}

/// Parse the payload of an Ack envelope.
pub fn parse_ack(plaintext: &[u8]) -> Result<u64, NetError> {
    let bytes: [u8; 8] = plaintext
        .try_into()
        .map_err(|_| NetError::Protocol("malformed ack payload".into()))?;
    Ok(u64::from_be_bytes(bytes))
}
