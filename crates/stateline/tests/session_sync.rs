//! End-to-end session tests over in-memory transports.

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use stateline::{
    ClientConfig, ClientSession, Dialer, PlayerIdToken, Server, ServerConfig, SessionEvent,
};
use stateline_crypto::{create_cipher, CipherAlgorithm};
use stateline_net::{
    ack_payload, memory_pair, parse_ack, Envelope, EnvelopeCodec, EnvelopeKind, FrameTransport,
    Handshake, MemoryTransport, NetError, Priority, ResumeMode, StateFrame, PROTOCOL_VERSION,
};
use stateline_state::{Delta, FieldMap, Snapshot, Value};
use stateline_store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const KEY: [u8; 32] = [7u8; 32];
const WAIT: Duration = Duration::from_secs(10);

fn test_server() -> Arc<Server> {
    Arc::new(Server::new(
        ServerConfig::default(),
        KEY.to_vec(),
        Arc::new(MemoryStore::new()),
        Arc::new(PlayerIdToken),
    ))
}

fn player_fields(hp: i64) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("hitpoints", Value::Int(hp));
    fields.insert("mana_points", Value::Int(40));
    fields.insert("position_x", Value::Float(12.5));
    fields.insert("position_y", Value::Float(-3.0));
    fields.insert("zone_name", Value::Str("harbor-district".into()));
    fields.insert("display_name", Value::Str("karn-the-bold".into()));
    fields.insert("inventory_gold", Value::Int(250));
    fields.insert("quest_stage", Value::Int(3));
    fields
}

/// Hand-driven protocol client for deterministic wire-level assertions.
struct TestClient {
    transport: MemoryTransport,
    codec: EnvelopeCodec,
    buf: BytesMut,
    seq: u64,
}

impl TestClient {
    async fn connect(
        server: &Arc<Server>,
        room: &str,
        player: &str,
        last_applied: u64,
    ) -> (Self, ResumeMode) {
        let (client_t, server_t) = memory_pair(64);
        let srv = Arc::clone(server);
        let room = room.to_string();
        tokio::spawn(async move {
            let _ = srv.handle_session(server_t, &room).await;
        });

        let mut client = Self {
            transport: client_t,
            codec: EnvelopeCodec::new(
                create_cipher(CipherAlgorithm::Aes256Gcm, &KEY).unwrap(),
                false,
            ),
            buf: BytesMut::new(),
            seq: 0,
        };

        let hello = Handshake::Hello {
            token: player.as_bytes().to_vec(),
            protocol_version: PROTOCOL_VERSION,
            last_applied_version: last_applied,
        }
        .to_bytes()
        .unwrap();
        client.send_raw(EnvelopeKind::Hello, 0, &hello).await;

        let (envelope, plaintext) = client.next(EnvelopeKind::HelloAck).await;
        assert_eq!(envelope.sequence, 0);
        let Handshake::HelloAck { resume, .. } = Handshake::from_bytes(&plaintext).unwrap() else {
            panic!("handshake was rejected");
        };
        (client, resume)
    }

    async fn send_raw(&mut self, kind: EnvelopeKind, sequence: u64, plaintext: &[u8]) {
        let envelope = self
            .codec
            .seal(kind, Priority::High, sequence, plaintext)
            .unwrap();
        let mut wire = BytesMut::new();
        envelope.encode(&mut wire).unwrap();
        self.transport.send(&wire).await.unwrap();
    }

    async fn send_frame(&mut self, kind: EnvelopeKind, player: &str, body: Vec<u8>) {
        self.seq += 1;
        let frame = StateFrame::new(player, body).to_bytes().unwrap();
        self.send_raw(kind, self.seq, &frame).await;
    }

    /// Read envelopes until one of the wanted kind arrives.
    async fn next(&mut self, want: EnvelopeKind) -> (Envelope, Vec<u8>) {
        loop {
            if let Some(envelope) = Envelope::decode(&mut self.buf).unwrap() {
                let plaintext = self.codec.open(&envelope).unwrap();
                if envelope.kind == want {
                    return (envelope, plaintext);
                }
                continue;
            }
            let chunk = timeout(WAIT, self.transport.recv())
                .await
                .expect("timed out waiting for envelope")
                .unwrap()
                .expect("server closed the stream");
            self.buf.extend_from_slice(&chunk);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delta_commits_broadcast_and_conflicts_resync() {
    let server = test_server();
    server
        .resolver()
        .create("p1", Snapshot::new(10, 0, player_fields(100)))
        .await
        .unwrap();

    let (mut alice, resume) = TestClient::connect(&server, "arena", "p1", 10).await;
    assert_eq!(resume, ResumeMode::DeltaStream);
    let (mut bob, resume) = TestClient::connect(&server, "arena", "p2", 0).await;
    assert_eq!(resume, ResumeMode::DeltaStream);

    // Alice commits hp 100 -> 95 against her version 10.
    let mut changes = FieldMap::new();
    changes.insert("hitpoints", Value::Int(95));
    let delta = Delta {
        base_version: 10,
        result_version: 11,
        timestamp: 777,
        changes: changes.clone(),
    };
    alice
        .send_frame(EnvelopeKind::Delta, "p1", delta.to_bytes().unwrap())
        .await;

    // The commit is acked to Alice and fanned out to Bob.
    let (_, ack) = alice.next(EnvelopeKind::Ack).await;
    assert_eq!(parse_ack(&ack).unwrap(), 1);

    let (_, plaintext) = bob.next(EnvelopeKind::Delta).await;
    let frame = StateFrame::from_bytes(&plaintext).unwrap();
    assert_eq!(frame.player_id, "p1");
    let relayed = Delta::from_bytes(&frame.body).unwrap();
    assert_eq!(relayed.result_version, 11);
    assert_eq!(relayed.changes.get("hitpoints"), Some(&Value::Int(95)));

    // Replaying the stale base must not commit; the server answers with the
    // authoritative snapshot instead.
    alice
        .send_frame(EnvelopeKind::Delta, "p1", delta.to_bytes().unwrap())
        .await;
    let (_, plaintext) = alice.next(EnvelopeKind::Resync).await;
    let frame = StateFrame::from_bytes(&plaintext).unwrap();
    let authoritative = Snapshot::from_bytes(&frame.body).unwrap();
    assert_eq!(authoritative.version, 11);
    assert_eq!(
        authoritative.fields.get("hitpoints"),
        Some(&Value::Int(95))
    );

    let record = server.resolver().current("p1").await.unwrap().unwrap();
    assert_eq!(record.version, 11);
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_client_resumes_with_a_full_resync() {
    let server = test_server();
    server
        .resolver()
        .create("p1", Snapshot::new(11, 0, player_fields(95)))
        .await
        .unwrap();

    // Applied version 0 against a server at 11: the gap cannot be bridged.
    let (mut client, resume) = TestClient::connect(&server, "arena", "p1", 0).await;
    assert_eq!(resume, ResumeMode::FullResync);

    let (envelope, plaintext) = client.next(EnvelopeKind::Resync).await;
    assert_eq!(envelope.sequence, 1);
    let frame = StateFrame::from_bytes(&plaintext).unwrap();
    let snapshot = Snapshot::from_bytes(&frame.body).unwrap();
    assert_eq!(snapshot.version, 11);
    assert_eq!(snapshot.fields.get("hitpoints"), Some(&Value::Int(95)));
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_player_frames_are_dropped() {
    let server = test_server();
    let (mut alice, _) = TestClient::connect(&server, "arena", "p1", 0).await;

    // A frame claiming another player's identity must not touch the store.
    let mut changes = FieldMap::new();
    changes.insert("hitpoints", Value::Int(1));
    let delta = Delta {
        base_version: 0,
        result_version: 1,
        timestamp: 1,
        changes,
    };
    alice
        .send_frame(EnvelopeKind::Delta, "p2", delta.to_bytes().unwrap())
        .await;

    // The envelope itself is still acked (delivery, not acceptance).
    let (_, ack) = alice.next(EnvelopeKind::Ack).await;
    assert_eq!(parse_ack(&ack).unwrap(), 1);
    assert!(server.resolver().current("p2").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_control_envelopes_do_not_end_the_session() {
    let server = test_server();
    server
        .resolver()
        .create("p1", Snapshot::new(10, 0, player_fields(100)))
        .await
        .unwrap();
    let (mut alice, _) = TestClient::connect(&server, "arena", "p1", 10).await;

    // An ack whose plaintext checksum no longer matches is dropped without
    // tearing the session down.
    let mut corrupt = alice
        .codec
        .seal(EnvelopeKind::Ack, Priority::High, 0, &ack_payload(5))
        .unwrap();
    corrupt.checksum ^= 0xdead_beef;
    let mut wire = BytesMut::new();
    corrupt.encode(&mut wire).unwrap();
    alice.transport.send(&wire).await.unwrap();

    // The session still commits and acks normally afterwards.
    let mut changes = FieldMap::new();
    changes.insert("hitpoints", Value::Int(95));
    let delta = Delta {
        base_version: 10,
        result_version: 11,
        timestamp: 5,
        changes,
    };
    alice
        .send_frame(EnvelopeKind::Delta, "p1", delta.to_bytes().unwrap())
        .await;
    let (_, ack) = alice.next(EnvelopeKind::Ack).await;
    assert_eq!(parse_ack(&ack).unwrap(), 1);
    let record = server.resolver().current("p1").await.unwrap().unwrap();
    assert_eq!(record.version, 11);
}

/// Dialer handing out one pre-connected in-memory transport.
struct OnceDialer(Option<MemoryTransport>);

#[async_trait]
impl Dialer for OnceDialer {
    async fn dial(&mut self) -> Result<Box<dyn FrameTransport>, NetError> {
        self.0
            .take()
            .map(|t| Box::new(t) as Box<dyn FrameTransport>)
            .ok_or_else(|| NetError::ConnectionFailed("transport already used".into()))
    }
}

fn spawn_client(server: &Arc<Server>, room: &str, player: &str) -> stateline::ClientHandle {
    let (client_t, server_t) = memory_pair(64);
    let srv = Arc::clone(server);
    let room = room.to_string();
    tokio::spawn(async move {
        let _ = srv.handle_session(server_t, &room).await;
    });

    let (session, handle) = ClientSession::new(
        Box::new(OnceDialer(Some(client_t))),
        &KEY,
        ClientConfig::new(player),
    )
    .unwrap();
    tokio::spawn(session.run());
    handle
}

async fn next_state(handle: &mut stateline::ClientHandle) -> (String, Snapshot) {
    loop {
        let event = timeout(WAIT, handle.events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session ended");
        if let SessionEvent::State {
            player_id,
            snapshot,
        } = event
        {
            return (player_id, snapshot);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn client_sessions_share_room_state() -> Result<()> {
    let server = test_server();
    let alice = spawn_client(&server, "arena", "alice");
    let mut bob = spawn_client(&server, "arena", "bob");

    // Both sessions must be in the room before the first publish.
    let rooms = server.rooms();
    timeout(WAIT, async {
        while rooms.member_count("arena").await < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    // Alice's first update diffs against an empty base, so it travels as a
    // full snapshot and seeds Bob's view of her.
    alice.updates.send(player_fields(100))?;
    let (player, snapshot) = next_state(&mut bob).await;
    assert_eq!(player, "alice");
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.fields.get("hitpoints"), Some(&Value::Int(100)));

    // The second update is a sparse delta applied on top of that base.
    alice.updates.send(player_fields(87))?;
    let (player, snapshot) = next_state(&mut bob).await;
    assert_eq!(player, "alice");
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.fields.get("hitpoints"), Some(&Value::Int(87)));
    assert_eq!(
        snapshot.fields.get("zone_name"),
        Some(&Value::Str("harbor-district".into()))
    );

    let record = server.resolver().current("alice").await.unwrap().unwrap();
    assert_eq!(record.version, 2);
    Ok(())
}
