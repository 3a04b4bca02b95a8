//! ICE candidate batching
//!
//! Local candidates are buffered and flushed as one batch message when the
//! buffer reaches `max_batch_size` or when `flush_timeout` has elapsed since the
//! first unflushed candidate, whichever happens first. The batcher is a
//! synchronous core driven with explicit timestamps; the runtime arms a timer
//! for [`IceCandidateBatcher::deadline`] and calls
//! [`IceCandidateBatcher::poll_deadline`] when it fires.
//!
//! After [`IceCandidateBatcher::close`] (the final forced flush at teardown)
//! further candidates are dropped and counted, never retried.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::errors::{TourlinkError, ValidationError};
use crate::transport::IceCandidate;
use crate::types::{ParticipantId, Timestamp};

// ----------------------------------------------------------------------------
// Batch Messages
// ----------------------------------------------------------------------------

/// A candidate with its per-link sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedCandidate {
    pub sequence_number: u64,
    pub candidate: IceCandidate,
}

/// One flushed batch, candidates in generation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateBatch {
    pub batch_id: u64,
    pub candidates: Vec<SequencedCandidate>,
    pub from_id: ParticipantId,
    pub timestamp: Timestamp,
}

impl CandidateBatch {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Receiver's acknowledgment of a processed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: u64,
    pub processed_count: u32,
    pub error_count: u32,
    pub timestamp: Timestamp,
}

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    SizeLimit,
    Deadline,
    Forced,
}

// ----------------------------------------------------------------------------
// Delivery Statistics
// ----------------------------------------------------------------------------

/// Delivery confirmation metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherStats {
    pub batches_flushed: u64,
    pub candidates_flushed: u64,
    pub acks_received: u64,
    pub candidates_processed: u64,
    pub candidate_errors: u64,
    pub delivery_failures: u64,
    pub dropped_after_close: u64,
    pub unacknowledged: Vec<u64>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sent_at: Timestamp,
    size: usize,
}

// ----------------------------------------------------------------------------
// Batcher
// ----------------------------------------------------------------------------

/// Buffers local candidates and produces [`CandidateBatch`]es
#[derive(Debug)]
pub struct IceCandidateBatcher {
    config: BatchConfig,
    from_id: ParticipantId,
    buffer: Vec<SequencedCandidate>,
    first_buffered_at: Option<Timestamp>,
    next_batch_id: u64,
    next_sequence: u64,
    closed: bool,
    in_flight: BTreeMap<u64, InFlight>,
    stats: BatcherStats,
}

impl IceCandidateBatcher {
    pub fn new(from_id: ParticipantId, config: BatchConfig) -> Self {
        Self {
            config,
            from_id,
            buffer: Vec::new(),
            first_buffered_at: None,
            next_batch_id: 1,
            next_sequence: 0,
            closed: false,
            in_flight: BTreeMap::new(),
            stats: BatcherStats::default(),
        }
    }

    /// Buffer a candidate, returning a batch if the size limit was reached
    ///
    /// Malformed candidates are rejected immediately. Candidates arriving after
    /// [`close`](Self::close) are dropped and counted.
    pub fn add_candidate(
        &mut self,
        candidate: IceCandidate,
        now: Timestamp,
    ) -> Result<Option<CandidateBatch>, ValidationError> {
        candidate.validate()?;

        if self.closed {
            self.stats.dropped_after_close += 1;
            warn!(
                from = %self.from_id,
                dropped = self.stats.dropped_after_close,
                "Candidate generated after final flush dropped"
            );
            return Ok(None);
        }

        self.buffer.push(SequencedCandidate {
            sequence_number: self.next_sequence,
            candidate,
        });
        self.next_sequence += 1;
        self.first_buffered_at.get_or_insert(now);

        if self.buffer.len() >= self.config.max_batch_size {
            return Ok(self.flush(FlushReason::SizeLimit, now));
        }
        Ok(None)
    }

    /// When the pending buffer must be flushed, if anything is buffered
    pub fn deadline(&self) -> Option<Timestamp> {
        self.first_buffered_at
            .map(|first| first + self.config.flush_timeout)
    }

    /// Flush if the deadline has passed
    pub fn poll_deadline(&mut self, now: Timestamp) -> Option<CandidateBatch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(FlushReason::Deadline, now),
            _ => None,
        }
    }

    /// Flush everything buffered right now
    pub fn force_flush(&mut self, now: Timestamp) -> Option<CandidateBatch> {
        self.flush(FlushReason::Forced, now)
    }

    /// Final forced flush; later candidates are dropped
    pub fn close(&mut self, now: Timestamp) -> Option<CandidateBatch> {
        let batch = self.force_flush(now);
        self.closed = true;
        batch
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn flush(&mut self, reason: FlushReason, now: Timestamp) -> Option<CandidateBatch> {
        self.first_buffered_at = None;
        if self.buffer.is_empty() {
            return None;
        }

        let candidates = core::mem::take(&mut self.buffer);
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        self.stats.batches_flushed += 1;
        self.stats.candidates_flushed += candidates.len() as u64;
        self.in_flight.insert(
            batch_id,
            InFlight {
                sent_at: now,
                size: candidates.len(),
            },
        );

        debug!(batch_id, size = candidates.len(), ?reason, "Flushing candidate batch");
        Some(CandidateBatch {
            batch_id,
            candidates,
            from_id: self.from_id.clone(),
            timestamp: now,
        })
    }

    // ------------------------------------------------------------------------
    // Acknowledgments
    // ------------------------------------------------------------------------

    /// Record an acknowledgment; returns false for unknown or repeated ids
    pub fn record_ack(&mut self, ack: &BatchAck) -> bool {
        let Some(in_flight) = self.in_flight.remove(&ack.batch_id) else {
            debug!(batch_id = ack.batch_id, "Ignoring ack for unknown batch");
            return false;
        };
        self.stats.acks_received += 1;
        self.stats.candidates_processed += ack.processed_count as u64;
        self.stats.candidate_errors += ack.error_count as u64;
        if ack.error_count > 0 {
            warn!(
                batch_id = ack.batch_id,
                size = in_flight.size,
                errors = ack.error_count,
                "Peer failed to apply candidates"
            );
        }
        true
    }

    /// Report batches unacknowledged past the ack timeout
    ///
    /// Expired batches are not resent; their records stay in the store until
    /// their own TTL.
    pub fn expire_unacked(&mut self, now: Timestamp) -> Vec<TourlinkError> {
        let ack_timeout = self.config.ack_timeout;
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.sent_at.is_expired(ack_timeout, now))
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .map(|batch_id| {
                self.in_flight.remove(&batch_id);
                self.stats.delivery_failures += 1;
                let err = TourlinkError::IceDeliveryFailure {
                    batch_id,
                    reason: format!("no acknowledgment within {}ms", ack_timeout.as_millis()),
                };
                warn!(batch_id, error = %err, "Candidate batch undelivered");
                err
            })
            .collect()
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            unacknowledged: self.in_flight.keys().copied().collect(),
            ..self.stats.clone()
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
