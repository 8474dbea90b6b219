//! Stateline client implementation
//!
//! The session owns the link: it handshakes, turns local state updates into
//! delta envelopes, applies authoritative state from the server, and drives
//! heartbeats and reconnection. The application talks to it through two
//! channels: local snapshots in, session events out.

use crate::server::{now_ms, write_batch};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use stateline_crypto::{create_cipher, CipherAlgorithm};
use stateline_net::{
    ack_payload, parse_ack, Connection, ConnectionState, Envelope, EnvelopeCodec, EnvelopeKind,
    FrameTransport, Handshake, NetError, OutboundScheduler, Priority, QuicConnector,
    ReconnectPolicy, SchedulerConfig, StateFrame, TransportConfig, PROTOCOL_VERSION,
};
use stateline_state::{apply, diff, Delta, FieldMap, Snapshot, StatePayload};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

/// Produces a fresh transport for each connection attempt.
#[async_trait]
pub trait Dialer: Send {
    async fn dial(&mut self) -> Result<Box<dyn FrameTransport>, NetError>;
}

/// Default dialer: QUIC to a fixed server address.
pub struct QuicDialer {
    connector: QuicConnector,
    addr: SocketAddr,
}

impl QuicDialer {
    pub fn new(addr: SocketAddr, config: TransportConfig) -> Result<Self, NetError> {
        Ok(Self {
            connector: QuicConnector::new(config)?,
            addr,
        })
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    async fn dial(&mut self) -> Result<Box<dyn FrameTransport>, NetError> {
        Ok(Box::new(self.connector.connect(self.addr).await?))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub cipher: CipherAlgorithm,
    /// Opaque bearer token presented in the handshake.
    pub token: Vec<u8>,
    /// Identity the server is expected to resolve the token to.
    pub player_id: String,
    pub reconnect: ReconnectPolicy,
    pub scheduler: SchedulerConfig,
    pub heartbeat_interval: Duration,
    pub flush_tick: Duration,
}

impl ClientConfig {
    pub fn new(player_id: impl Into<String>) -> Self {
        let player_id = player_id.into();
        Self {
            cipher: CipherAlgorithm::Aes256Gcm,
            token: player_id.clone().into_bytes(),
            player_id,
            reconnect: ReconnectPolicy::default(),
            scheduler: SchedulerConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            flush_tick: Duration::from_millis(10),
        }
    }
}

/// What the session reports back to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Authoritative state for a player: a roommate's committed update, or
    /// our own state after the server overruled us.
    State {
        player_id: String,
        snapshot: Snapshot,
    },
    /// The link degraded or recovered.
    Link(ConnectionState),
}

/// Application-facing handles for a running session.
pub struct ClientHandle {
    /// Local desired state; each send becomes at most one delta.
    pub updates: mpsc::UnboundedSender<FieldMap>,
    /// Authoritative state and link changes from the session.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub struct ClientSession {
    dialer: Box<dyn Dialer>,
    config: ClientConfig,
    codec: EnvelopeCodec,
    conn: Connection,
    scheduler: OutboundScheduler,
    /// Last state the server is believed to hold for us; deltas diff
    /// against it, and a resync replaces it.
    synced: Snapshot,
    /// Roommates' last known snapshots, for applying their deltas.
    peers: HashMap<String, Snapshot>,
    rx_buf: BytesMut,
    last_inbound: Instant,
    updates_rx: mpsc::UnboundedReceiver<FieldMap>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientSession {
    pub fn new(
        dialer: Box<dyn Dialer>,
        key: &[u8],
        config: ClientConfig,
    ) -> Result<(Self, ClientHandle)> {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            dialer,
            codec: EnvelopeCodec::new(create_cipher(config.cipher, key)?, false),
            conn: Connection::new(config.reconnect.clone()),
            scheduler: OutboundScheduler::new(config.scheduler.clone()),
            synced: Snapshot::new(0, 0, FieldMap::new()),
            peers: HashMap::new(),
            rx_buf: BytesMut::new(),
            last_inbound: Instant::now(),
            updates_rx,
            events_tx,
            config,
        };
        Ok((
            session,
            ClientHandle {
                updates: updates_tx,
                events: events_rx,
            },
        ))
    }

    /// Run the session until the update channel closes, the server closes
    /// the stream, or reconnection is exhausted.
    pub async fn run(mut self) -> Result<()> {
        let mut transport = self.dialer.dial().await?;
        self.handshake(&mut transport).await?;

        loop {
            match self.drive(&mut transport).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "session interrupted");
                    if self.conn.state() == ConnectionState::Closed {
                        return Err(e);
                    }
                    while matches!(
                        self.conn.state(),
                        ConnectionState::Connected | ConnectionState::Degraded
                    ) {
                        if self.conn.on_failure() == ConnectionState::Reconnecting {
                            break;
                        }
                    }
                    self.emit(SessionEvent::Link(ConnectionState::Reconnecting));
                    transport = self.reconnect().await?;
                }
            }
        }
    }

    /// Backoff-dial until a handshake succeeds or the attempt budget runs
    /// out. Unacked envelopes are queued for resend on the new link.
    async fn reconnect(&mut self) -> Result<Box<dyn FrameTransport>> {
        while let Some(delay) = self.conn.begin_reconnect_attempt() {
            time::sleep(delay).await;
            self.rx_buf.clear();
            match self.dialer.dial().await {
                Ok(mut transport) => match self.handshake(&mut transport).await {
                    Ok(()) => {
                        for envelope in self.conn.retransmit_pending() {
                            self.scheduler.enqueue(envelope);
                        }
                        self.emit(SessionEvent::Link(ConnectionState::Connected));
                        return Ok(transport);
                    }
                    Err(e) if self.conn.state() == ConnectionState::Closed => return Err(e),
                    Err(e) => warn!(error = %e, "reconnect handshake failed"),
                },
                Err(e) => warn!(error = %e, "reconnect dial failed"),
            }
        }
        self.emit(SessionEvent::Link(ConnectionState::Closed));
        bail!(NetError::ConnectionFailed(
            "reconnection attempts exhausted".into()
        ))
    }

    async fn handshake(&mut self, transport: &mut Box<dyn FrameTransport>) -> Result<()> {
        let hello = Handshake::Hello {
            token: self.config.token.clone(),
            protocol_version: PROTOCOL_VERSION,
            last_applied_version: self.synced.version,
        }
        .to_bytes()?;
        let envelope = self.codec.seal(EnvelopeKind::Hello, Priority::High, 0, &hello)?;
        write_batch(transport.as_mut(), &[envelope]).await?;

        let reply = loop {
            if let Some(envelope) = Envelope::decode(&mut self.rx_buf)? {
                break envelope;
            }
            let chunk = transport
                .recv()
                .await?
                .ok_or(NetError::ConnectionFailed("closed during handshake".into()))?;
            self.rx_buf.extend_from_slice(&chunk);
        };
        if reply.kind != EnvelopeKind::HelloAck {
            bail!(NetError::Protocol("expected hello ack".into()));
        }
        let plaintext = self.codec.open(&reply)?;
        match Handshake::from_bytes(&plaintext)? {
            Handshake::HelloAck { session_id, resume } => {
                info!(session_id, ?resume, "session established");
                self.conn.handshake_complete();
                self.last_inbound = Instant::now();
                // On FullResync the authoritative snapshot follows as a
                // Resync envelope and lands through the normal inbound path.
                Ok(())
            }
            Handshake::Rejected { reason } => {
                self.conn.handshake_failed();
                bail!(NetError::Rejected(reason))
            }
            Handshake::Hello { .. } => bail!(NetError::Protocol("unexpected hello".into())),
        }
    }

    /// Main loop on one live transport. Returns `Ok` on orderly shutdown and
    /// `Err` when the link needs to be re-established.
    async fn drive(&mut self, transport: &mut Box<dyn FrameTransport>) -> Result<()> {
        let mut flush_tick = time::interval(self.config.flush_tick);
        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = transport.recv() => match frame {
                    Ok(Some(chunk)) => {
                        self.rx_buf.extend_from_slice(&chunk);
                        self.last_inbound = Instant::now();
                        while let Some(envelope) = Envelope::decode(&mut self.rx_buf)? {
                            self.on_envelope(envelope)?;
                        }
                    }
                    Ok(None) => {
                        info!("server closed the stream");
                        self.conn.close();
                        return Ok(());
                    }
                    Err(e) => bail!(e),
                },
                update = self.updates_rx.recv() => match update {
                    Some(fields) => self.queue_local_update(fields)?,
                    None => {
                        // Application is done; push out anything still queued.
                        let batch = self.scheduler.flush(Instant::now());
                        write_batch(transport.as_mut(), &batch).await?;
                        self.conn.close();
                        return Ok(());
                    }
                },
                _ = heartbeat.tick() => {
                    if self.last_inbound.elapsed() >= self.config.heartbeat_interval * 2 {
                        let state = self.conn.on_failure();
                        self.emit(SessionEvent::Link(state));
                        if state == ConnectionState::Reconnecting {
                            bail!(NetError::Timeout);
                        }
                    } else if self.conn.state() == ConnectionState::Degraded {
                        self.conn.on_success();
                        self.emit(SessionEvent::Link(ConnectionState::Connected));
                    }
                    self.queue_control(EnvelopeKind::Heartbeat, Priority::Low, &[])?;
                }
                _ = flush_tick.tick() => {
                    if self.scheduler.due(Instant::now()) {
                        let batch = self.scheduler.flush(Instant::now());
                        write_batch(transport.as_mut(), &batch).await?;
                    }
                }
            }
        }
    }

    /// Diff the desired fields against the last synced state and queue the
    /// resulting delta (or full snapshot) for the server.
    fn queue_local_update(&mut self, fields: FieldMap) -> Result<()> {
        let target = Snapshot::new(self.synced.version + 1, now_ms(), fields);
        let (kind, body) = match diff(&self.synced, &target).map_err(NetError::from)? {
            StatePayload::Delta(delta) if delta.is_empty() => return Ok(()),
            StatePayload::Delta(delta) => (
                EnvelopeKind::Delta,
                delta.to_bytes().map_err(NetError::from)?,
            ),
            StatePayload::Full(full) => (
                EnvelopeKind::Full,
                full.to_bytes().map_err(NetError::from)?,
            ),
        };
        let frame = StateFrame::new(&self.config.player_id, body).to_bytes()?;
        // Optimistic: assume the commit lands. A conflict comes back as a
        // Resync envelope and rewinds `synced` to the server's truth.
        self.synced = target;
        self.queue_data(kind, Priority::High, &frame)
    }

    fn on_envelope(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.kind {
            EnvelopeKind::Hello | EnvelopeKind::HelloAck => Ok(()),
            EnvelopeKind::Heartbeat => Ok(()),
            EnvelopeKind::Ack => {
                let plaintext = match self.codec.open(&envelope) {
                    Ok(plaintext) => plaintext,
                    Err(NetError::Integrity { sequence }) => {
                        // Recoverable: drop the corrupt ack, a later one
                        // carries the same cumulative watermark.
                        warn!(sequence, "corrupt ack dropped");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                let acked = parse_ack(&plaintext)?;
                let outcome = self.conn.record_ack(acked);
                if outcome.duplicate && self.conn.pending_len() > 0 {
                    debug!(acked, pending = self.conn.pending_len(), "resend requested");
                    for resend in self.conn.retransmit_pending() {
                        self.scheduler.enqueue(resend);
                    }
                }
                Ok(())
            }
            EnvelopeKind::Full | EnvelopeKind::Delta | EnvelopeKind::Resync => {
                if let Err(e) = self.codec.open(&envelope) {
                    return match e {
                        NetError::Integrity { sequence } => {
                            warn!(sequence, "integrity check failed, requesting resend");
                            self.queue_ack()
                        }
                        e => Err(e.into()),
                    };
                }
                let outcome = self.conn.receive(envelope);
                if outcome.duplicate {
                    return self.queue_ack();
                }
                for ready in outcome.ready {
                    let plaintext = self.codec.open(&ready)?;
                    let frame = StateFrame::from_bytes(&plaintext)?;
                    self.apply_frame(ready.kind, frame)?;
                }
                self.queue_ack()
            }
        }
    }

    /// Fold one authoritative state frame into our view.
    fn apply_frame(&mut self, kind: EnvelopeKind, frame: StateFrame) -> Result<()> {
        match kind {
            EnvelopeKind::Delta => {
                let delta = Delta::from_bytes(&frame.body).map_err(NetError::from)?;
                if frame.player_id == self.config.player_id {
                    // The server never echoes our own deltas; treat it as a
                    // hint that our view is stale and ask for a resync.
                    warn!("own delta echoed by server, requesting resync");
                    return self.request_resync();
                }
                let Some(base) = self.peers.get(&frame.player_id) else {
                    debug!(
                        player = frame.player_id,
                        "delta for unknown peer, waiting for a full snapshot"
                    );
                    return Ok(());
                };
                match apply(base, &delta) {
                    Ok(snapshot) => {
                        self.peers.insert(frame.player_id.clone(), snapshot.clone());
                        self.emit(SessionEvent::State {
                            player_id: frame.player_id,
                            snapshot,
                        });
                    }
                    Err(e) => {
                        // Out of step with this peer; a later full will heal it.
                        warn!(player = frame.player_id, error = %e, "peer delta did not apply");
                        self.peers.remove(&frame.player_id);
                    }
                }
                Ok(())
            }
            EnvelopeKind::Full | EnvelopeKind::Resync => {
                let snapshot = Snapshot::from_bytes(&frame.body).map_err(NetError::from)?;
                if frame.player_id == self.config.player_id {
                    info!(version = snapshot.version, "synced to authoritative state");
                    self.conn.set_last_applied_version(snapshot.version);
                    self.synced = snapshot.clone();
                } else {
                    self.peers
                        .insert(frame.player_id.clone(), snapshot.clone());
                }
                self.emit(SessionEvent::State {
                    player_id: frame.player_id,
                    snapshot,
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Ask the server for our authoritative snapshot.
    pub fn request_resync(&mut self) -> Result<()> {
        let frame = StateFrame::new(&self.config.player_id, Vec::new()).to_bytes()?;
        self.queue_data(EnvelopeKind::Resync, Priority::High, &frame)
    }

    fn queue_ack(&mut self) -> Result<()> {
        let payload = ack_payload(self.conn.last_delivered_sequence());
        self.queue_control(EnvelopeKind::Ack, Priority::High, &payload)
    }

    fn queue_data(&mut self, kind: EnvelopeKind, priority: Priority, plaintext: &[u8]) -> Result<()> {
        let sequence = self.conn.next_sequence();
        let envelope = self.codec.seal(kind, priority, sequence, plaintext)?;
        if self.conn.record_sent(envelope.clone()) == ConnectionState::Reconnecting {
            // The server stopped acking; drop the link. Everything pending,
            // this envelope included, replays after the reconnect.
            bail!(NetError::Transport(
                "server stopped acknowledging, retention exhausted".into()
            ));
        }
        self.scheduler.enqueue(envelope);
        Ok(())
    }

    fn queue_control(&mut self, kind: EnvelopeKind, priority: Priority, plaintext: &[u8]) -> Result<()> {
        let envelope = self.codec.seal(kind, priority, 0, plaintext)?;
        self.scheduler.enqueue(envelope);
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        // The application may have stopped listening; that is not an error.
        let _ = self.events_tx.send(event);
    }
}
