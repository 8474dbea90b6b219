//! Stateline server implementation
//!
//! One session task per connected client. A session authenticates the
//! client's token, decides between delta resume and full resync, then loops:
//! inbound envelopes are decrypted, ordered, and committed through the
//! resolver; committed state fans out to the client's room; outbound traffic
//! drains through the priority scheduler into batched transport writes.

use crate::room::{RoomRegistry, RoomUpdate};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use stateline_crypto::{create_cipher, CipherAlgorithm};
use stateline_net::{
    ack_payload, parse_ack, Connection, ConnectionState, Envelope, EnvelopeCodec, EnvelopeKind,
    FrameTransport, Handshake, NetError, OutboundScheduler, Priority, ReconnectPolicy, ResumeMode,
    SchedulerConfig, StateFrame, PROTOCOL_VERSION,
};
use stateline_state::{Delta, FieldMap, Snapshot};
use stateline_store::{CommitError, Resolver, StateStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Server tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cipher: CipherAlgorithm,
    pub scheduler: SchedulerConfig,
    /// How often the outbound scheduler is polled for a due flush.
    pub flush_tick: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cipher: CipherAlgorithm::Aes256Gcm,
            scheduler: SchedulerConfig::default(),
            flush_tick: Duration::from_millis(10),
        }
    }
}

/// Identity collaborator: turns an opaque bearer token into a player id.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &[u8]) -> Result<String, String>;
}

/// Development validator: the token bytes are the UTF-8 player id.
pub struct PlayerIdToken;

#[async_trait]
impl TokenValidator for PlayerIdToken {
    async fn validate(&self, token: &[u8]) -> Result<String, String> {
        let id = std::str::from_utf8(token).map_err(|_| "token is not valid utf-8".to_string())?;
        if id.is_empty() {
            return Err("empty token".to_string());
        }
        Ok(id.to_string())
    }
}

/// Live sessions, keyed by connection id.
#[derive(Default)]
pub struct ConnectionTable {
    sessions: RwLock<HashMap<Uuid, String>>,
}

impl ConnectionTable {
    pub async fn register(&self, session: Uuid, player_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session, player_id.to_string());
        info!(%session, player = player_id, active = sessions.len(), "session registered");
    }

    pub async fn deregister(&self, session: Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(&session).is_some() {
            info!(%session, active = sessions.len(), "session deregistered");
        }
    }

    pub async fn active(&self) -> usize {
        self.sessions.read().await.len()
    }
}

pub struct Server {
    config: ServerConfig,
    key: Vec<u8>,
    resolver: Resolver,
    rooms: Arc<RoomRegistry>,
    table: Arc<ConnectionTable>,
    validator: Arc<dyn TokenValidator>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        key: Vec<u8>,
        store: Arc<dyn StateStore>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            config,
            key,
            resolver: Resolver::new(store),
            rooms: Arc::new(RoomRegistry::new()),
            table: Arc::new(ConnectionTable::default()),
            validator,
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn rooms(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.rooms)
    }

    pub fn connections(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.table)
    }

    /// Run one client session to completion over the given transport.
    pub async fn handle_session<T: FrameTransport>(
        &self,
        mut transport: T,
        room_id: &str,
    ) -> Result<()> {
        let mut codec = EnvelopeCodec::new(create_cipher(self.config.cipher, &self.key)?, true);
        let mut conn = Connection::new(ReconnectPolicy::default());
        let mut rx_buf = BytesMut::new();

        // Nothing is accepted before a valid handshake.
        let player_id = match self
            .accept_handshake(&mut transport, &mut rx_buf, &mut codec, &mut conn)
            .await
        {
            Ok(player_id) => player_id,
            Err(e) => {
                conn.handshake_failed();
                return Err(e);
            }
        };

        let session_uuid = conn.id();
        self.table.register(session_uuid, &player_id).await;
        let mut room_rx = self.rooms.join(room_id, session_uuid).await;

        let mut session = Session {
            resolver: self.resolver.clone(),
            rooms: Arc::clone(&self.rooms),
            codec,
            conn,
            scheduler: OutboundScheduler::new(self.config.scheduler.clone()),
            player_id: player_id.clone(),
            room_id: room_id.to_string(),
        };
        let mut flush_tick = time::interval(self.config.flush_tick);

        let mut result = Ok(());
        'session: loop {
            tokio::select! {
                frame = transport.recv() => match frame {
                    Ok(Some(chunk)) => {
                        rx_buf.extend_from_slice(&chunk);
                        loop {
                            match Envelope::decode(&mut rx_buf) {
                                Ok(Some(envelope)) => {
                                    if let Err(e) = session.on_envelope(envelope).await {
                                        result = Err(e);
                                        break 'session;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    result = Err(e.into());
                                    break 'session;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        info!(session = %session_uuid, "client closed the stream");
                        break 'session;
                    }
                    Err(e) => {
                        result = Err(e.into());
                        break 'session;
                    }
                },
                update = room_rx.recv() => match update {
                    Some(update) => {
                        if let Err(e) = session.queue_data(update.kind, update.priority, &update.payload) {
                            result = Err(e);
                            break 'session;
                        }
                    }
                    // Subscription replaced by a rejoin of the same player.
                    None => break 'session,
                },
                _ = flush_tick.tick() => {
                    if session.scheduler.due(Instant::now()) {
                        let batch = session.scheduler.flush(Instant::now());
                        if let Err(e) = write_batch(&mut transport, &batch).await {
                            result = Err(e);
                            break 'session;
                        }
                    }
                }
            }
        }

        self.rooms.leave(room_id, session_uuid).await;
        self.table.deregister(session_uuid).await;
        if let Err(e) = &result {
            error!(session = %session_uuid, player = player_id, error = %e, "session ended with error");
        }
        result
    }

    /// Read the Hello, authenticate it, and answer with HelloAck plus a
    /// resync when the client's applied version is behind.
    async fn accept_handshake<T: FrameTransport>(
        &self,
        transport: &mut T,
        rx_buf: &mut BytesMut,
        codec: &mut EnvelopeCodec,
        conn: &mut Connection,
    ) -> Result<String> {
        let envelope = loop {
            if let Some(envelope) = Envelope::decode(rx_buf)? {
                break envelope;
            }
            let chunk = transport
                .recv()
                .await?
                .ok_or(NetError::ConnectionFailed("closed before handshake".into()))?;
            rx_buf.extend_from_slice(&chunk);
        };

        if envelope.kind != EnvelopeKind::Hello || envelope.sequence != 0 {
            bail!(NetError::Protocol("expected hello envelope".into()));
        }
        let plaintext = codec.open(&envelope)?;
        let Handshake::Hello {
            token,
            protocol_version,
            last_applied_version,
        } = Handshake::from_bytes(&plaintext)?
        else {
            bail!(NetError::Protocol("unexpected handshake message".into()));
        };

        if protocol_version != PROTOCOL_VERSION {
            let reason = format!(
                "unsupported protocol version {protocol_version}, server speaks {PROTOCOL_VERSION}"
            );
            self.reject(transport, codec, &reason).await?;
            bail!(NetError::Rejected(reason));
        }

        let player_id = match self.validator.validate(&token).await {
            Ok(player_id) => player_id,
            Err(reason) => {
                warn!(reason, "handshake token rejected");
                self.reject(transport, codec, &reason).await?;
                bail!(NetError::Rejected(reason));
            }
        };

        let record = self.ensure_record(&player_id).await?;
        let resume = if record.version > last_applied_version {
            ResumeMode::FullResync
        } else {
            ResumeMode::DeltaStream
        };
        let session_id: u64 = rand::random();
        info!(
            player = player_id,
            session_id,
            ?resume,
            server_version = record.version,
            client_version = last_applied_version,
            "handshake accepted"
        );

        let ack = Handshake::HelloAck { session_id, resume }.to_bytes()?;
        let mut batch = vec![codec.seal(EnvelopeKind::HelloAck, Priority::High, 0, &ack)?];

        conn.handshake_complete();
        conn.set_last_applied_version(record.version);
        if resume == ResumeMode::FullResync {
            let frame =
                StateFrame::new(&player_id, record.snapshot.to_bytes().map_err(NetError::from)?)
                    .to_bytes()?;
            let envelope = codec.seal(
                EnvelopeKind::Resync,
                Priority::High,
                conn.next_sequence(),
                &frame,
            )?;
            conn.record_sent(envelope.clone());
            batch.push(envelope);
        }
        write_batch(transport, &batch).await?;
        Ok(player_id)
    }

    async fn reject<T: FrameTransport>(
        &self,
        transport: &mut T,
        codec: &mut EnvelopeCodec,
        reason: &str,
    ) -> Result<()> {
        let rejected = Handshake::Rejected {
            reason: reason.to_string(),
        }
        .to_bytes()?;
        let envelope = codec.seal(EnvelopeKind::HelloAck, Priority::High, 0, &rejected)?;
        write_batch(transport, &[envelope]).await
    }

    /// Load the player's record, creating an empty one on first join.
    async fn ensure_record(
        &self,
        player_id: &str,
    ) -> Result<stateline_store::PersistedRecord> {
        if let Some(record) = self.resolver.current(player_id).await? {
            return Ok(record);
        }
        let fresh = Snapshot::new(0, now_ms(), FieldMap::new());
        match self.resolver.create(player_id, fresh).await {
            Ok(()) => {}
            // Lost a create race to a concurrent session; the record exists.
            Err(CommitError::Store(StoreError::Conflict { .. })) => {}
            Err(e) => return Err(e.into()),
        }
        self.resolver
            .current(player_id)
            .await?
            .context("record missing after create")
    }
}

/// Mutable per-session state, split out so the select loop can borrow the
/// transport independently.
struct Session {
    resolver: Resolver,
    rooms: Arc<RoomRegistry>,
    codec: EnvelopeCodec,
    conn: Connection,
    scheduler: OutboundScheduler,
    player_id: String,
    room_id: String,
}

impl Session {
    async fn on_envelope(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.kind {
            EnvelopeKind::Hello | EnvelopeKind::HelloAck => {
                warn!(player = self.player_id, "handshake envelope after handshake, ignoring");
                Ok(())
            }
            EnvelopeKind::Ack => self.on_ack(&envelope),
            // Client keepalive: answer with the delivery watermark.
            EnvelopeKind::Heartbeat => {
                if self.open_control(&envelope)?.is_none() {
                    return Ok(());
                }
                self.queue_ack()
            }
            EnvelopeKind::Full | EnvelopeKind::Delta | EnvelopeKind::Resync => {
                self.on_data(envelope).await
            }
        }
    }

    /// Decrypt a control envelope. A plaintext checksum failure drops it
    /// and the connection survives; only an AEAD failure is fatal.
    fn open_control(&mut self, envelope: &Envelope) -> Result<Option<Vec<u8>>> {
        match self.codec.open(envelope) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(NetError::Integrity { sequence }) => {
                warn!(
                    player = self.player_id,
                    sequence,
                    kind = ?envelope.kind,
                    "corrupt control envelope dropped"
                );
                Ok(None)
            }
            Err(e) => Err(fatal_if_decrypt(e)),
        }
    }

    fn on_ack(&mut self, envelope: &Envelope) -> Result<()> {
        let Some(plaintext) = self.open_control(envelope)? else {
            return Ok(());
        };
        let acked = parse_ack(&plaintext)?;
        let outcome = self.conn.record_ack(acked);
        if outcome.duplicate {
            // Duplicate ack is the client's resend request.
            for resend in self.conn.retransmit_pending() {
                debug!(player = self.player_id, sequence = resend.sequence, "retransmitting");
                self.scheduler.enqueue(resend);
            }
        }
        Ok(())
    }

    /// Ordered state traffic: verify, reorder, commit, broadcast, ack.
    async fn on_data(&mut self, envelope: Envelope) -> Result<()> {
        // Verify before ordering so corrupt envelopes never advance the
        // reorder buffer; the plaintext is recovered again on release.
        match self.codec.open(&envelope) {
            Ok(_) => {}
            Err(NetError::Integrity { sequence }) => {
                warn!(
                    player = self.player_id,
                    sequence, "integrity check failed, requesting resend"
                );
                return self.queue_ack();
            }
            Err(e) => return Err(fatal_if_decrypt(e)),
        }

        let outcome = self.conn.receive(envelope);
        if outcome.duplicate {
            // The client missed our ack; repeat it.
            return self.queue_ack();
        }
        for ready in outcome.ready {
            let plaintext = self.codec.open(&ready)?;
            let frame = StateFrame::from_bytes(&plaintext)?;
            if frame.player_id != self.player_id {
                warn!(
                    player = self.player_id,
                    claimed = frame.player_id,
                    "state frame for a foreign player, dropping"
                );
                continue;
            }
            match ready.kind {
                EnvelopeKind::Delta => self.commit_delta(&frame.body, &plaintext).await?,
                EnvelopeKind::Full => self.commit_full(&frame.body).await?,
                // Client lost its base and asks for the authoritative state.
                EnvelopeKind::Resync => {
                    let record = self
                        .resolver
                        .current(&self.player_id)
                        .await?
                        .context("record missing for live session")?;
                    self.queue_resync(&record.snapshot)?;
                }
                _ => unreachable!("control kinds handled before ordering"),
            }
        }
        // Ack the watermark either way: after delivery it confirms progress,
        // and across a gap the repeated value asks the client to resend.
        self.queue_ack()
    }

    async fn commit_delta(&mut self, body: &[u8], frame_bytes: &[u8]) -> Result<()> {
        let delta = Delta::from_bytes(body).map_err(NetError::from)?;
        match self.resolver.commit(&self.player_id, &delta).await {
            Ok(outcome) => {
                self.conn.set_last_applied_version(outcome.new_version);
                debug!(
                    player = self.player_id,
                    version = outcome.new_version,
                    "delta committed"
                );
                self.rooms
                    .publish(
                        &self.room_id,
                        self.conn.id(),
                        RoomUpdate {
                            player_id: self.player_id.clone(),
                            kind: EnvelopeKind::Delta,
                            payload: Bytes::copy_from_slice(frame_bytes),
                            priority: Priority::High,
                        },
                    )
                    .await;
                Ok(())
            }
            Err(CommitError::VersionConflict { base, current }) => {
                warn!(
                    player = self.player_id,
                    base,
                    current = current.version,
                    "delta conflicted, sending authoritative state"
                );
                self.queue_resync(&current)
            }
            Err(CommitError::Validation(reason)) => {
                warn!(player = self.player_id, reason, "delta rejected, resyncing client");
                let record = self
                    .resolver
                    .current(&self.player_id)
                    .await?
                    .context("record missing for live session")?;
                self.queue_resync(&record.snapshot)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_full(&mut self, body: &[u8]) -> Result<()> {
        let snapshot = Snapshot::from_bytes(body).map_err(NetError::from)?;
        match self
            .resolver
            .commit_snapshot(&self.player_id, snapshot.fields, snapshot.timestamp)
            .await
        {
            Ok(outcome) => {
                self.conn.set_last_applied_version(outcome.new_version);
                let frame = StateFrame::new(
                    &self.player_id,
                    outcome.snapshot.to_bytes().map_err(NetError::from)?,
                )
                .to_bytes()?;
                self.rooms
                    .publish(
                        &self.room_id,
                        self.conn.id(),
                        RoomUpdate {
                            player_id: self.player_id.clone(),
                            kind: EnvelopeKind::Full,
                            payload: Bytes::from(frame),
                            priority: Priority::Medium,
                        },
                    )
                    .await;
                Ok(())
            }
            Err(CommitError::VersionConflict { current, .. }) => self.queue_resync(&current),
            Err(e) => Err(e.into()),
        }
    }

    fn queue_resync(&mut self, snapshot: &Snapshot) -> Result<()> {
        let frame = StateFrame::new(
            &self.player_id,
            snapshot.to_bytes().map_err(NetError::from)?,
        )
        .to_bytes()?;
        self.queue_data(EnvelopeKind::Resync, Priority::High, &frame)
    }

    fn queue_ack(&mut self) -> Result<()> {
        let payload = ack_payload(self.conn.last_delivered_sequence());
        self.queue_control(EnvelopeKind::Ack, Priority::High, &payload)
    }

    /// Sequence-bearing, retained until acked.
    fn queue_data(&mut self, kind: EnvelopeKind, priority: Priority, plaintext: &[u8]) -> Result<()> {
        let sequence = self.conn.next_sequence();
        let envelope = self.codec.seal(kind, priority, sequence, plaintext)?;
        if self.conn.record_sent(envelope.clone()) == ConnectionState::Reconnecting {
            // The client stopped acking; end the session and let it
            // re-handshake into a resync.
            bail!(NetError::Transport(
                "client stopped acknowledging, retention exhausted".into()
            ));
        }
        self.scheduler.enqueue(envelope);
        Ok(())
    }

    /// Control traffic rides the reserved sequence slot and is never retained.
    fn queue_control(&mut self, kind: EnvelopeKind, priority: Priority, plaintext: &[u8]) -> Result<()> {
        let envelope = self.codec.seal(kind, priority, 0, plaintext)?;
        self.scheduler.enqueue(envelope);
        Ok(())
    }
}

/// An AEAD failure means the peer's key is wrong or the stream is hostile;
/// everything else at this point is a per-envelope problem.
fn fatal_if_decrypt(e: NetError) -> anyhow::Error {
    if matches!(e, NetError::Decrypt) {
        error!("envelope failed authentication, tearing down session");
    }
    e.into()
}

/// Encode a batch of envelopes into one transport write.
pub(crate) async fn write_batch<T: FrameTransport + ?Sized>(
    transport: &mut T,
    batch: &[Envelope],
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut buf = BytesMut::new();
    for envelope in batch {
        envelope.encode(&mut buf)?;
    }
    transport.send(&buf).await?;
    Ok(())
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
