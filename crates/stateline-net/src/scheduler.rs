//! Priority-batched outbound scheduling
//!
//! Three strict tiers, FIFO within each. A flush combines everything queued
//! into one transport write; High always drains before Medium, Medium before
//! Low. Starving Low under sustained High traffic is the intended trade-off.

use crate::envelope::{Envelope, Priority};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Queue depth that triggers an immediate flush.
    pub batch_size: usize,
    /// Longest an envelope may wait before a flush is forced.
    pub max_delay: Duration,
    /// Hard cap across all tiers. Above it, new Low envelopes are shed.
    pub queue_cap: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_delay: Duration::from_millis(50),
            queue_cap: 1024,
        }
    }
}

/// What happened to an enqueued envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Shed under backpressure. A policy outcome, not an error.
    DroppedLow,
}

/// Per-connection outbound queue.
pub struct OutboundScheduler {
    config: SchedulerConfig,
    high: VecDeque<Envelope>,
    medium: VecDeque<Envelope>,
    low: VecDeque<Envelope>,
    last_flush: Instant,
    dropped_low: u64,
}

impl OutboundScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            high: VecDeque::new(),
            medium: VecDeque::new(),
            low: VecDeque::new(),
            last_flush: Instant::now(),
            dropped_low: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Envelopes shed under backpressure so far.
    pub fn dropped_low(&self) -> u64 {
        self.dropped_low
    }

    /// Queue an envelope in its priority tier.
    ///
    /// Above the hard cap, Low envelopes are dropped so memory stays bounded;
    /// High and Medium are always accepted.
    pub fn enqueue(&mut self, envelope: Envelope) -> EnqueueOutcome {
        if envelope.priority == Priority::Low && self.len() >= self.config.queue_cap {
            self.dropped_low += 1;
            warn!(
                sequence = envelope.sequence,
                dropped = self.dropped_low,
                "outbound queue full, shedding low-priority envelope"
            );
            return EnqueueOutcome::DroppedLow;
        }
        match envelope.priority {
            Priority::High => self.high.push_back(envelope),
            Priority::Medium => self.medium.push_back(envelope),
            Priority::Low => self.low.push_back(envelope),
        }
        EnqueueOutcome::Queued
    }

    /// Whether a flush is due: batch size reached, or the oldest queued
    /// envelope has waited past `max_delay` — whichever comes first.
    pub fn due(&self, now: Instant) -> bool {
        if self.is_empty() {
            return false;
        }
        self.len() >= self.config.batch_size
            || now.duration_since(self.last_flush) >= self.config.max_delay
    }

    /// Drain everything queued, strictly High then Medium then Low, FIFO
    /// within each tier. Sequence numbers are untouched so the receiver can
    /// still process and ack envelopes individually.
    pub fn flush(&mut self, now: Instant) -> Vec<Envelope> {
        let mut batch = Vec::with_capacity(self.len());
        batch.extend(self.high.drain(..));
        batch.extend(self.medium.drain(..));
        batch.extend(self.low.drain(..));
        self.last_flush = now;
        if !batch.is_empty() {
            debug!(envelopes = batch.len(), "flushing outbound batch");
        }
        batch
    }
}
