//! Per-link connection state machine
//!
//! Owns the sequence counters for one logical client-server link: strictly
//! increasing outbound sequences, in-order release of inbound envelopes via
//! a reorder buffer, retention of unacked envelopes for retransmission, and
//! the Connecting → Connected ⇄ Degraded → Reconnecting → Closed lifecycle
//! with bounded exponential backoff.

use crate::envelope::Envelope;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consecutive send/heartbeat failures tolerated in Degraded before the
/// transport is torn down and reconnection begins.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Unacked envelopes retained per connection before the link is declared
/// failed. Nothing is dropped at the cap; the sender reconnects and replays.
const MAX_PENDING: usize = 256;

/// Connection lifecycle. `Closed` is terminal; retrying requires a new
/// connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Degraded,
    Reconnecting,
    Closed,
}

/// Bounded exponential backoff for reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt: `min(base * 2^attempt, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

/// Per-connection traffic counters.
#[derive(Debug, Default, Clone)]
pub struct MessageStats {
    pub envelopes_sent: u64,
    pub envelopes_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub last_rtt: Option<Duration>,
}

/// Result of processing a cumulative ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Pending envelopes released by this ack.
    pub released: usize,
    /// The ack did not advance the acked sequence. A duplicate ack is the
    /// receiver's resend request for everything still pending beyond it.
    pub duplicate: bool,
}

/// Result of feeding one inbound envelope through the reorder buffer.
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    /// Envelopes now deliverable, in strict sequence order.
    pub ready: Vec<Envelope>,
    /// First missing sequence, when the envelope had to be buffered behind
    /// a gap. The session answers with a duplicate ack to request a resend.
    pub missing: Option<u64>,
    /// The envelope was at or below the delivered watermark and was ignored.
    pub duplicate: bool,
}

struct SentEnvelope {
    envelope: Envelope,
    sent_at: Instant,
}

/// One logical session between a client identity and the server.
pub struct Connection {
    id: Uuid,
    state: ConnectionState,
    last_sent_sequence: u64,
    last_acked_sequence: u64,
    /// Highest contiguous inbound sequence released to the session.
    last_delivered_sequence: u64,
    last_applied_version: u64,
    reorder: BTreeMap<u64, Envelope>,
    pending: VecDeque<SentEnvelope>,
    consecutive_failures: u32,
    reconnect_attempts: u32,
    policy: ReconnectPolicy,
    stats: MessageStats,
}

impl Connection {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Connecting,
            last_sent_sequence: 0,
            last_acked_sequence: 0,
            last_delivered_sequence: 0,
            last_applied_version: 0,
            reorder: BTreeMap::new(),
            pending: VecDeque::new(),
            consecutive_failures: 0,
            reconnect_attempts: 0,
            policy,
            stats: MessageStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &MessageStats {
        &self.stats
    }

    pub fn last_applied_version(&self) -> u64 {
        self.last_applied_version
    }

    pub fn set_last_applied_version(&mut self, version: u64) {
        self.last_applied_version = version;
    }

    pub fn last_delivered_sequence(&self) -> u64 {
        self.last_delivered_sequence
    }

    pub fn last_acked_sequence(&self) -> u64 {
        self.last_acked_sequence
    }

    /// Allocate the next outbound sequence number. Sequence 0 is reserved
    /// for handshake envelopes.
    pub fn next_sequence(&mut self) -> u64 {
        self.last_sent_sequence += 1;
        self.last_sent_sequence
    }

    // --- lifecycle ---

    /// Handshake finished; the link is live.
    pub fn handshake_complete(&mut self) {
        debug_assert!(matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ));
        info!(connection = %self.id, "connection established");
        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        self.reconnect_attempts = 0;
    }

    /// Initial handshake failed: reported to the caller, never retried
    /// automatically.
    pub fn handshake_failed(&mut self) {
        warn!(connection = %self.id, "handshake failed, closing");
        self.state = ConnectionState::Closed;
    }

    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            info!(connection = %self.id, "connection closed");
            self.state = ConnectionState::Closed;
        }
    }

    /// A send attempt or expected heartbeat ack failed.
    pub fn on_failure(&mut self) -> ConnectionState {
        match self.state {
            ConnectionState::Connected => {
                self.consecutive_failures = 1;
                self.state = ConnectionState::Degraded;
                warn!(connection = %self.id, "transient failure, degraded");
            }
            ConnectionState::Degraded => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= FAILURE_THRESHOLD {
                    warn!(
                        connection = %self.id,
                        failures = self.consecutive_failures,
                        "failure threshold reached, reconnecting"
                    );
                    self.state = ConnectionState::Reconnecting;
                }
            }
            _ => {}
        }
        self.state
    }

    /// A send or heartbeat ack succeeded; a degraded link recovers.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == ConnectionState::Degraded {
            info!(connection = %self.id, "link recovered");
            self.state = ConnectionState::Connected;
        }
    }

    /// Start the next reconnection attempt.
    ///
    /// Returns the backoff delay to wait before dialing, or `None` once the
    /// attempt budget is exhausted, in which case the connection is Closed
    /// and the caller must surface [`crate::NetError::ConnectionFailed`].
    pub fn begin_reconnect_attempt(&mut self) -> Option<Duration> {
        if self.state != ConnectionState::Reconnecting {
            return None;
        }
        if self.reconnect_attempts >= self.policy.max_attempts {
            warn!(
                connection = %self.id,
                attempts = self.reconnect_attempts,
                "reconnection attempts exhausted"
            );
            self.state = ConnectionState::Closed;
            return None;
        }
        let delay = self.policy.delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        debug!(
            connection = %self.id,
            attempt = self.reconnect_attempts,
            ?delay,
            "scheduling reconnection attempt"
        );
        Some(delay)
    }

    // --- outbound bookkeeping ---

    /// Retain a sent envelope until it is acknowledged.
    ///
    /// A peer that stops acking eventually saturates the retention buffer.
    /// The envelope is still retained; the connection moves to Reconnecting
    /// so the caller tears the link down and replays the whole pending set
    /// on the next one. Returns the connection state after recording.
    pub fn record_sent(&mut self, envelope: Envelope) -> ConnectionState {
        self.stats.envelopes_sent += 1;
        self.stats.bytes_sent += envelope.payload.len() as u64;
        self.pending.push_back(SentEnvelope {
            envelope,
            sent_at: Instant::now(),
        });
        if self.pending.len() > MAX_PENDING
            && matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Degraded
            )
        {
            warn!(
                connection = %self.id,
                pending = self.pending.len(),
                "unacked retention budget exhausted, reconnecting"
            );
            self.state = ConnectionState::Reconnecting;
        }
        self.state
    }

    /// Process a cumulative ack, releasing every pending envelope at or
    /// below it.
    pub fn record_ack(&mut self, acked: u64) -> AckOutcome {
        if acked <= self.last_acked_sequence {
            return AckOutcome {
                released: 0,
                duplicate: true,
            };
        }
        self.last_acked_sequence = acked;
        let mut released = 0;
        while let Some(front) = self.pending.front() {
            if front.envelope.sequence > acked {
                break;
            }
            if let Some(sent) = self.pending.pop_front() {
                self.stats.last_rtt = Some(sent.sent_at.elapsed());
                released += 1;
            }
        }
        debug!(connection = %self.id, acked, released, "ack processed");
        AckOutcome {
            released,
            duplicate: false,
        }
    }

    /// Clone every unacked envelope for retransmission.
    pub fn retransmit_pending(&mut self) -> Vec<Envelope> {
        let resend: Vec<Envelope> = self
            .pending
            .iter()
            .map(|sent| sent.envelope.clone())
            .collect();
        self.stats.retransmits += resend.len() as u64;
        resend
    }

    /// Number of envelopes awaiting acknowledgment.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // --- inbound ordering ---

    /// Feed one inbound envelope through the reorder buffer.
    ///
    /// Envelopes are released strictly in sequence order; anything past a
    /// gap is buffered and a resend of the first missing sequence is
    /// signalled. Duplicates below the delivered watermark are dropped, so
    /// re-delivery under at-least-once semantics is idempotent here.
    pub fn receive(&mut self, envelope: Envelope) -> ReceiveOutcome {
        self.stats.envelopes_received += 1;
        self.stats.bytes_received += envelope.payload.len() as u64;

        let sequence = envelope.sequence;
        if sequence <= self.last_delivered_sequence {
            debug!(connection = %self.id, sequence, "duplicate envelope ignored");
            return ReceiveOutcome {
                duplicate: true,
                ..ReceiveOutcome::default()
            };
        }
        self.reorder.insert(sequence, envelope);

        let mut ready = Vec::new();
        while let Some(envelope) = self.reorder.remove(&(self.last_delivered_sequence + 1)) {
            self.last_delivered_sequence += 1;
            ready.push(envelope);
        }

        let missing = if ready.is_empty() || !self.reorder.is_empty() {
            Some(self.last_delivered_sequence + 1)
        } else {
            None
        };
        if let Some(missing) = missing {
            debug!(
                connection = %self.id,
                missing,
                buffered = self.reorder.len(),
                "sequence gap, buffering out-of-order envelopes"
            );
        }
        ReceiveOutcome {
            ready,
            missing,
            duplicate: false,
        }
    }
}
