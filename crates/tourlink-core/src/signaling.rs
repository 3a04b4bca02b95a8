//! Signaling data model
//!
//! Records exchanged through the coordination store: the per-channel
//! [`CoordinationState`], candidate records, and the signaling message
//! envelope. Updates to the coordination state are expressed as a partial
//! [`CoordinationUpdate`] and merged purely, so a store transaction can retry
//! the merge against whatever version it reads.

use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::batcher::{BatchAck, CandidateBatch, SequencedCandidate};
use crate::errors::ValidationError;
use crate::transport::{IceCandidate, SessionDescription};
use crate::types::{ParticipantId, Role, Timestamp};

// ----------------------------------------------------------------------------
// Coordination State
// ----------------------------------------------------------------------------

/// Handshake progress shared by both roles of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Initial,
    OfferSent,
    AnswerSent,
    IceExchange,
    Connected,
    Failed,
}

/// Liveness of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    pub connected: bool,
    pub last_seen: Timestamp,
    pub ice_gathering_complete: bool,
}

impl Liveness {
    pub fn fresh(now: Timestamp) -> Self {
        Self {
            connected: true,
            last_seen: now,
            ice_gathering_complete: false,
        }
    }

    /// Flip to disconnected once not refreshed within `ttl`; returns true if flipped
    pub fn expire(&mut self, ttl: Duration, now: Timestamp) -> bool {
        if self.connected && self.last_seen.is_expired(ttl, now) {
            self.connected = false;
            return true;
        }
        false
    }
}

/// Participants registered on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Participants {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guide_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guide: Option<Liveness>,
    #[serde(default)]
    pub attendees: BTreeMap<ParticipantId, Liveness>,
}

/// Shared state for one (tour, language) channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationState {
    pub guide_ready: bool,
    pub attendee_ready: bool,
    pub connection_phase: ConnectionPhase,
    pub participants: Participants,
    pub last_heartbeat: Timestamp,
    pub created_at: Timestamp,
}

impl CoordinationState {
    pub fn new(now: Timestamp) -> Self {
        Self {
            guide_ready: false,
            attendee_ready: false,
            connection_phase: ConnectionPhase::Initial,
            participants: Participants::default(),
            last_heartbeat: now,
            created_at: now,
        }
    }

    pub fn is_ready(&self, role: Role) -> bool {
        match role {
            Role::Guide => self.guide_ready,
            Role::Attendee => self.attendee_ready,
        }
    }

    pub fn liveness(&self, role: Role, id: &ParticipantId) -> Option<&Liveness> {
        match role {
            Role::Guide if self.participants.guide_id.as_ref() == Some(id) => {
                self.participants.guide.as_ref()
            }
            Role::Guide => None,
            Role::Attendee => self.participants.attendees.get(id),
        }
    }

    /// The counterpart of `role`: the guide, or the first live attendee
    pub fn peer_of(&self, role: Role) -> Option<ParticipantId> {
        match role {
            Role::Attendee => self.participants.guide_id.clone(),
            Role::Guide => self
                .participants
                .attendees
                .iter()
                .find(|(_, liveness)| liveness.connected)
                .map(|(id, _)| id.clone()),
        }
    }

    /// Mark every participant not refreshed within `ttl` as disconnected
    pub fn apply_liveness_expiry(&mut self, ttl: Duration, now: Timestamp) -> bool {
        let mut changed = false;
        if let Some(guide) = self.participants.guide.as_mut() {
            changed |= guide.expire(ttl, now);
        }
        for liveness in self.participants.attendees.values_mut() {
            changed |= liveness.expire(ttl, now);
        }
        changed
    }
}

// ----------------------------------------------------------------------------
// Partial Updates
// ----------------------------------------------------------------------------

/// Liveness fields one participant writes about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantUpdate {
    pub role: Role,
    pub participant_id: ParticipantId,
    pub connected: Option<bool>,
    pub ice_gathering_complete: Option<bool>,
    /// Refresh `last_seen`
    pub touch: bool,
}

/// Partial coordination state change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinationUpdate {
    pub guide_ready: Option<bool>,
    pub attendee_ready: Option<bool>,
    pub connection_phase: Option<ConnectionPhase>,
    pub participant: Option<ParticipantUpdate>,
    /// Refresh `last_heartbeat`
    pub heartbeat: bool,
}

impl CoordinationUpdate {
    pub fn ready(role: Role, ready: bool) -> Self {
        match role {
            Role::Guide => Self {
                guide_ready: Some(ready),
                ..Self::default()
            },
            Role::Attendee => Self {
                attendee_ready: Some(ready),
                ..Self::default()
            },
        }
    }

    pub fn phase(phase: ConnectionPhase) -> Self {
        Self {
            connection_phase: Some(phase),
            ..Self::default()
        }
    }

    pub fn with_participant(mut self, update: ParticipantUpdate) -> Self {
        self.participant = Some(update);
        self
    }

    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat = true;
        self
    }

    /// Merge into `current`, returning `None` when nothing would change
    ///
    /// Only the writer's own liveness entry is touched; the other role's
    /// entries are carried over untouched. Timestamps never move backwards.
    pub fn merge(&self, current: &CoordinationState, now: Timestamp) -> Option<CoordinationState> {
        let mut next = current.clone();

        if let Some(ready) = self.guide_ready {
            next.guide_ready = ready;
        }
        if let Some(ready) = self.attendee_ready {
            next.attendee_ready = ready;
        }
        if let Some(phase) = self.connection_phase {
            next.connection_phase = phase;
        }
        if self.heartbeat {
            next.last_heartbeat = next.last_heartbeat.max(now);
        }

        if let Some(update) = &self.participant {
            let entry = match update.role {
                Role::Guide => {
                    if next.participants.guide_id.as_ref() != Some(&update.participant_id) {
                        next.participants.guide_id = Some(update.participant_id.clone());
                        next.participants.guide = None;
                    }
                    next.participants.guide.get_or_insert_with(|| Liveness::fresh(now))
                }
                Role::Attendee => next
                    .participants
                    .attendees
                    .entry(update.participant_id.clone())
                    .or_insert_with(|| Liveness::fresh(now)),
            };
            if let Some(connected) = update.connected {
                entry.connected = connected;
            }
            if let Some(complete) = update.ice_gathering_complete {
                entry.ice_gathering_complete = complete;
            }
            if update.touch {
                entry.last_seen = entry.last_seen.max(now);
            }
        }

        (next != *current).then_some(next)
    }
}

// ----------------------------------------------------------------------------
// Candidate Records
// ----------------------------------------------------------------------------

/// A candidate written to the store for the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate_id: String,
    pub candidate: IceCandidate,
    pub sender: Role,
    pub sender_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ParticipantId>,
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<u64>,
    pub timestamp: Timestamp,
    pub processed: bool,
}

impl IceCandidateRecord {
    /// Store id of the candidate `sender` generated with `sequence_number`
    pub fn id_for(sender: &ParticipantId, sequence_number: u64) -> String {
        format!("{sender}-{sequence_number}")
    }

    /// Addressed to this participant, or to its role when untargeted
    pub fn is_addressed_to(&self, role: Role, id: &ParticipantId) -> bool {
        if self.sender == role {
            return false;
        }
        match &self.target_id {
            Some(target) => target == id,
            None => true,
        }
    }
}

// ----------------------------------------------------------------------------
// Signaling Messages
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    #[serde(rename = "ice-candidate-batch")]
    IceCandidateBatch,
    #[serde(rename = "ice-candidate-batch-ack")]
    IceCandidateBatchAck,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "state_sync")]
    StateSync,
}

/// Message sender
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sender {
    pub role: Role,
    pub participant_id: ParticipantId,
}

/// Periodic health summary carried on heartbeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HealthReport {
    pub quality: u8,
    pub avg_latency_ms: f64,
    pub uptime_secs: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub reconnections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Description(SessionDescription),
    Candidate(SequencedCandidate),
    Batch(CandidateBatch),
    BatchAck(BatchAck),
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        report: Option<HealthReport>,
    },
    StateSync(CoordinationState),
}

/// Signaling message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ParticipantId>,
    pub timestamp: Timestamp,
    pub payload: MessagePayload,
}

impl SignalingMessage {
    pub fn new(
        message_type: MessageType,
        sender: Sender,
        target_id: Option<ParticipantId>,
        payload: MessagePayload,
        now: Timestamp,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            message_type,
            sender,
            target_id,
            timestamp: now,
            payload,
        }
    }

    /// Check that the payload fits the declared type
    pub fn validate(&self) -> Result<(), ValidationError> {
        use crate::transport::SdpKind;

        let consistent = match (&self.message_type, &self.payload) {
            (MessageType::Offer, MessagePayload::Description(d)) => d.kind == SdpKind::Offer,
            (MessageType::Answer, MessagePayload::Description(d)) => d.kind == SdpKind::Answer,
            (MessageType::IceCandidate, MessagePayload::Candidate(_)) => true,
            (MessageType::IceCandidateBatch, MessagePayload::Batch(_)) => true,
            (MessageType::IceCandidateBatchAck, MessagePayload::BatchAck(_)) => true,
            (MessageType::Heartbeat, MessagePayload::Heartbeat { .. }) => true,
            (MessageType::StateSync, MessagePayload::StateSync(_)) => true,
            _ => false,
        };
        if !consistent {
            return Err(ValidationError::MalformedPayload {
                reason: format!("payload does not match message type {:?}", self.message_type),
            });
        }
        if let MessagePayload::Description(description) = &self.payload {
            description.validate()?;
        }
        Ok(())
    }

    /// Addressed to this participant: not its own, and targeted at it or untargeted
    pub fn is_addressed_to(&self, role: Role, id: &ParticipantId) -> bool {
        if self.sender.participant_id == *id || self.sender.role == role {
            return false;
        }
        self.target_id.as_ref().map_or(true, |target| target == id)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
