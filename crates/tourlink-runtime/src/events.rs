//! Session events
//!
//! Every component notification of a session is published on its
//! [`EventBus`](tourlink_core::EventBus) as a [`SessionEvent`].

use serde::Serialize;
use tourlink_core::{
    Alert, BatchAck, DiagnosticReport, ErrorRecord, HealthReport, QualityChange, QualityGrade,
    QualityLevel, RecoveryPlan, RecoverySession, StateChange, Warning,
};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Accepted state machine transition
    StateChanged(StateChange),
    /// Held local candidates released to the batcher
    CandidatesReleased { count: usize },
    BatchSent { batch_id: u64, size: usize },
    BatchAcknowledged(BatchAck),
    /// No acknowledgment arrived within the ack timeout
    BatchUndelivered { batch_id: u64 },
    /// A peer batch was applied to the transport
    RemoteCandidatesApplied {
        batch_id: u64,
        processed: u32,
        errors: u32,
    },
    HealthSampled { score: u8, grade: QualityGrade },
    HealthWarning(Warning),
    HealthAlert(Alert),
    DiagnosticReport(Box<DiagnosticReport>),
    /// New quality settings the consumer should apply to the media path
    QualityChanged(QualityChange),
    EmergencyFallbackComplete { success: bool, level: QualityLevel },
    RecoveryAttemptStarted(RecoveryPlan),
    /// A recovery session closed with its final outcome
    #[serde(rename = "session_complete")]
    RecoveryComplete(RecoverySession),
    RemoteTrack { track_id: String },
    /// Health summary carried on the peer's heartbeat
    PeerReport(HealthReport),
    Error(ErrorRecord),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged(_) => "state_changed",
            SessionEvent::CandidatesReleased { .. } => "candidates_released",
            SessionEvent::BatchSent { .. } => "batch_sent",
            SessionEvent::BatchAcknowledged(_) => "batch_acknowledged",
            SessionEvent::BatchUndelivered { .. } => "batch_undelivered",
            SessionEvent::RemoteCandidatesApplied { .. } => "remote_candidates_applied",
            SessionEvent::HealthSampled { .. } => "health_sampled",
            SessionEvent::HealthWarning(_) => "health_warning",
            SessionEvent::HealthAlert(_) => "health_alert",
            SessionEvent::DiagnosticReport(_) => "diagnostic_report",
            SessionEvent::QualityChanged(_) => "quality_changed",
            SessionEvent::EmergencyFallbackComplete { .. } => "emergency_fallback_complete",
            SessionEvent::RecoveryAttemptStarted(_) => "recovery_attempt_started",
            SessionEvent::RecoveryComplete(_) => "session_complete",
            SessionEvent::RemoteTrack { .. } => "remote_track",
            SessionEvent::PeerReport(_) => "peer_report",
            SessionEvent::Error(_) => "error",
        }
    }
}
