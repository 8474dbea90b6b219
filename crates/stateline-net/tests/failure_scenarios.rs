//! Failure-path scenarios across the codec and connection layers.

use bytes::{Bytes, BytesMut};
use stateline_crypto::{create_cipher, CipherAlgorithm};
use stateline_net::{
    Connection, ConnectionState, Envelope, EnvelopeCodec, EnvelopeKind, NetError, Priority,
    ReconnectPolicy,
};

const KEY: [u8; 32] = [3u8; 32];

fn codec(server_side: bool) -> EnvelopeCodec {
    EnvelopeCodec::new(
        create_cipher(CipherAlgorithm::Aes256Gcm, &KEY).unwrap(),
        server_side,
    )
}

#[test]
fn corrupt_checksum_drops_envelope_but_connection_survives() {
    let mut sender = codec(false);
    let receiver = codec(true);
    let mut conn = Connection::new(ReconnectPolicy::default());
    conn.handshake_complete();

    let good = sender
        .seal(EnvelopeKind::Delta, Priority::High, 1, b"state update")
        .unwrap();
    let mut bad = sender
        .seal(EnvelopeKind::Delta, Priority::High, 2, b"later update")
        .unwrap();
    bad.checksum ^= 0xffff_ffff;

    assert!(receiver.open(&good).is_ok());
    conn.receive(good);

    // The corrupt envelope is dropped before ordering; the link stays up
    // and the session requests a resend by re-acking sequence 1.
    match receiver.open(&bad) {
        Err(NetError::Integrity { sequence }) => assert_eq!(sequence, 2),
        other => panic!("expected integrity failure, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.last_delivered_sequence(), 1);
}

#[test]
fn auth_failure_is_fatal_for_the_link() {
    let mut sender = codec(false);
    let receiver = codec(true);

    let mut envelope = sender
        .seal(EnvelopeKind::Delta, Priority::High, 1, b"state update")
        .unwrap();
    let mut tampered = envelope.payload.to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    envelope.payload = Bytes::from(tampered);

    assert!(matches!(receiver.open(&envelope), Err(NetError::Decrypt)));
}

#[test]
fn batched_frames_decode_into_individually_ackable_envelopes() {
    let mut sender = codec(false);
    let receiver = codec(true);
    let mut conn = Connection::new(ReconnectPolicy::default());
    conn.handshake_complete();

    // One combined transport write carrying three envelopes.
    let mut wire = BytesMut::new();
    for seq in 1..=3u64 {
        sender
            .seal(EnvelopeKind::Delta, Priority::Medium, seq, b"payload")
            .unwrap()
            .encode(&mut wire)
            .unwrap();
    }

    let mut delivered = Vec::new();
    while let Some(envelope) = Envelope::decode(&mut wire).unwrap() {
        assert!(receiver.open(&envelope).is_ok());
        delivered.extend(conn.receive(envelope).ready);
    }

    let sequences: Vec<u64> = delivered.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(conn.last_delivered_sequence(), 3);
}

#[test]
fn exhausted_reconnects_surface_as_terminal_close() {
    let policy = ReconnectPolicy {
        base: std::time::Duration::from_millis(10),
        max_delay: std::time::Duration::from_millis(40),
        max_attempts: 3,
    };
    let mut conn = Connection::new(policy);
    conn.handshake_complete();

    for _ in 0..3 {
        conn.on_failure();
    }
    assert_eq!(conn.state(), ConnectionState::Reconnecting);

    let delays: Vec<_> = std::iter::from_fn(|| conn.begin_reconnect_attempt()).collect();
    assert_eq!(delays.len(), 3);
    assert_eq!(conn.state(), ConnectionState::Closed);
    // A closed connection never schedules further attempts.
    assert_eq!(conn.begin_reconnect_attempt(), None);
}
