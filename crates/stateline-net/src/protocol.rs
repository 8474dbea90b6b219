//! Handshake protocol messages
//!
//! The handshake rides in `Hello`/`HelloAck` envelopes at sequence 0, before
//! any state traffic. The client presents an opaque bearer token and its
//! last applied state version; the server answers with the session id and
//! whether the gap can be bridged with deltas or needs a full resync.

use crate::NetError;
use rkyv::{Archive, Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// How the server resumes a returning client.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum ResumeMode {
    /// The retained diff history covers the client's gap; deltas follow.
    DeltaStream,
    /// History no longer covers the gap; a Resync envelope follows.
    FullResync,
}

/// Handshake messages.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum Handshake {
    Hello {
        /// Opaque bearer credential, validated by the identity collaborator.
        token: Vec<u8>,
        protocol_version: u32,
        /// Highest state version the client has applied; 0 for a fresh join.
        last_applied_version: u64,
    },
    HelloAck {
        session_id: u64,
        resume: ResumeMode,
    },
    Rejected {
        reason: String,
    },
}

impl Handshake {
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetError> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|b| b.to_vec())
            .map_err(|e| NetError::Protocol(format!("handshake serialization failed: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetError> {
        let archived = rkyv::check_archived_root::<Self>(bytes)
            .map_err(|e| NetError::Protocol(format!("handshake validation failed: {e}")))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| NetError::Protocol(format!("handshake deserialization failed: {e}")))
    }
}

/// Attributed state payload carried by `Full`, `Delta`, and `Resync`
/// envelopes. Attribution lets one room broadcast stream carry state for
/// many players; the server rejects inbound frames whose player does not
/// match the session's authenticated identity.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct StateFrame {
    pub player_id: String,
    /// Serialized snapshot or delta.
    pub body: Vec<u8>,
}

impl StateFrame {
    pub fn new(player_id: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            player_id: player_id.into(),
            body,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NetError> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|b| b.to_vec())
            .map_err(|e| NetError::Protocol(format!("state frame serialization failed: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetError> {
        let archived = rkyv::check_archived_root::<Self>(bytes)
            .map_err(|e| NetError::Protocol(format!("state frame validation failed: {e}")))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| NetError::Protocol(format!("state frame deserialization failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let hello = Handshake::Hello {
            token: b"bearer-xyz".to_vec(),
            protocol_version: PROTOCOL_VERSION,
            last_applied_version: 42,
        };

        let bytes = hello.to_bytes().unwrap();
        match Handshake::from_bytes(&bytes).unwrap() {
            Handshake::Hello {
                token,
                protocol_version,
                last_applied_version,
            } => {
                assert_eq!(token, b"bearer-xyz");
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(last_applied_version, 42);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(Handshake::from_bytes(&[0u8; 3]).is_err());
    }

    #[test]
    fn state_frame_roundtrip() {
        let frame = StateFrame::new("p7", vec![1, 2, 3]);
        let back = StateFrame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(back.player_id, "p7");
        assert_eq!(back.body, vec![1, 2, 3]);
    }
}
