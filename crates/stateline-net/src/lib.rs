//! Networking core for Stateline
//!
//! Wire envelopes (compress, encrypt, checksum), the per-link connection
//! state machine with ordered delivery and bounded reconnection, the
//! priority-batched outbound scheduler, and the transport seam.

pub mod connection;
pub mod envelope;
pub mod protocol;
pub mod scheduler;
pub mod transport;

pub use connection::{
    AckOutcome, Connection, ConnectionState, MessageStats, ReceiveOutcome, ReconnectPolicy,
};
pub use envelope::{ack_payload, parse_ack, Envelope, EnvelopeCodec, EnvelopeKind, Priority};
pub use protocol::{Handshake, ResumeMode, StateFrame, PROTOCOL_VERSION};
pub use scheduler::{EnqueueOutcome, OutboundScheduler, SchedulerConfig};
pub use transport::{
    memory_pair, FrameTransport, MemoryTransport, QuicConnector, QuicListener, QuicTransport,
    TransportConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    /// Reconnection attempts exhausted or connect refused. Terminal for the
    /// owning connection object.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Plaintext checksum mismatch after a successful decrypt. The envelope
    /// is dropped and a resend requested; the connection survives.
    #[error("envelope integrity check failed at sequence {sequence}")]
    Integrity { sequence: u64 },

    /// AEAD authentication failure. The link is treated as compromised and
    /// torn down.
    #[error("envelope decryption failed")]
    Decrypt,

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] stateline_crypto::CryptoError),

    #[error("state error: {0}")]
    State(#[from] stateline_state::StateError),
}
