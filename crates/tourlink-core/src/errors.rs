//! Error types for tour audio sessions
//!
//! Specific enums for each collaborator (store, transport, validation) and the
//! unified [`TourlinkError`] that carries the failure taxonomy surfaced by the
//! session orchestrator.

use serde::{Deserialize, Serialize};

use crate::recovery::FailureType;
use crate::state_machine::StateTransitionError;
use crate::types::Role;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Input that is rejected immediately and never retried
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing participant id")]
    MissingParticipantId,
    #[error("Invalid {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("Malformed ICE candidate: {reason}")]
    MalformedCandidate { reason: String },
    #[error("Malformed session description: {reason}")]
    MalformedDescription { reason: String },
    #[error("Malformed signaling payload: {reason}")]
    MalformedPayload { reason: String },
}

/// Coordination store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Store operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Stored value under {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Real-time transport primitive errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Transport operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },
    #[error("Transport is closed")]
    Closed,
    #[error("Remote candidate rejected: {reason}")]
    CandidateRejected { reason: String },
    #[error("Statistics unavailable: {reason}")]
    StatsUnavailable { reason: String },
}

// ----------------------------------------------------------------------------
// Structured Kind
// ----------------------------------------------------------------------------

/// Machine-readable classification of a [`TourlinkError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SignalingTransactionFailure,
    IceDeliveryFailure,
    ConnectionFailure,
    QualityCritical,
    Validation,
    Store,
    Transport,
    StateTransition,
    Serialization,
    Configuration,
    Session,
    Channel,
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for tour audio sessions
#[derive(Debug, thiserror::Error)]
pub enum TourlinkError {
    /// Store write conflict or timeout that outlived its retry budget
    #[error("Signaling transaction on {key} failed after {attempts} attempts: {reason}")]
    SignalingTransactionFailure {
        key: String,
        attempts: u32,
        reason: String,
    },

    /// A candidate batch was never acknowledged
    #[error("ICE batch {batch_id} undelivered: {reason}")]
    IceDeliveryFailure { batch_id: u64, reason: String },

    /// ICE or transport failure; routed to recovery, never retried inline
    #[error("Connection failure ({failure_type:?}): {reason}")]
    ConnectionFailure {
        failure_type: FailureType,
        reason: String,
    },

    /// Quality dropped to critical; routed to the emergency fallback
    #[error("Quality critical (score {score})")]
    QualityCritical { score: u8 },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Session {key} not found")]
    SessionNotFound { key: String },

    #[error("Session {key} already exists")]
    SessionExists { key: String },

    #[error("Session {key} is closed")]
    SessionClosed { key: String },

    #[error("Operation requires the {expected} role")]
    RoleMismatch { expected: Role },

    #[error("Channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Constructors
// ----------------------------------------------------------------------------

impl TourlinkError {
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        TourlinkError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        TourlinkError::Channel {
            message: message.into(),
        }
    }

    pub fn connection_failure<R: Into<String>>(failure_type: FailureType, reason: R) -> Self {
        TourlinkError::ConnectionFailure {
            failure_type,
            reason: reason.into(),
        }
    }

    pub fn malformed_payload<R: Into<String>>(reason: R) -> Self {
        TourlinkError::Validation(ValidationError::MalformedPayload {
            reason: reason.into(),
        })
    }

    /// Structured kind for status and diagnostic surfaces
    pub fn kind(&self) -> ErrorKind {
        match self {
            TourlinkError::SignalingTransactionFailure { .. } => ErrorKind::SignalingTransactionFailure,
            TourlinkError::IceDeliveryFailure { .. } => ErrorKind::IceDeliveryFailure,
            TourlinkError::ConnectionFailure { .. } => ErrorKind::ConnectionFailure,
            TourlinkError::QualityCritical { .. } => ErrorKind::QualityCritical,
            TourlinkError::Validation(_) => ErrorKind::Validation,
            TourlinkError::Store(_) => ErrorKind::Store,
            TourlinkError::Transport(_) => ErrorKind::Transport,
            TourlinkError::StateTransition(_) => ErrorKind::StateTransition,
            TourlinkError::Serialization(_) => ErrorKind::Serialization,
            TourlinkError::Configuration { .. } => ErrorKind::Configuration,
            TourlinkError::SessionNotFound { .. }
            | TourlinkError::SessionExists { .. }
            | TourlinkError::SessionClosed { .. }
            | TourlinkError::RoleMismatch { .. } => ErrorKind::Session,
            TourlinkError::Channel { .. } => ErrorKind::Channel,
        }
    }

    /// Transient failures are recovered locally and never surfaced to callers
    pub fn is_transient(&self) -> bool {
        match self {
            TourlinkError::Store(StoreError::Timeout { .. })
            | TourlinkError::Store(StoreError::Unavailable { .. })
            | TourlinkError::IceDeliveryFailure { .. }
            | TourlinkError::QualityCritical { .. }
            | TourlinkError::ConnectionFailure { .. } => true,
            _ => false,
        }
    }
}

/// Serializable snapshot of an error for status reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TourlinkError> for ErrorRecord {
    fn from(err: &TourlinkError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type TourlinkResult<T> = Result<T, TourlinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = TourlinkError::SignalingTransactionFailure {
            key: "coordination:t:en".into(),
            attempts: 5,
            reason: "conflict".into(),
        };
        assert_eq!(err.kind(), ErrorKind::SignalingTransactionFailure);
        assert!(!err.is_transient());

        let err: TourlinkError = ValidationError::MissingParticipantId.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_connection_failure_is_routed_not_surfaced() {
        let ice = TourlinkError::connection_failure(FailureType::IceFailed, "ice down");
        assert!(ice.is_transient());
        assert_eq!(ice.kind(), ErrorKind::ConnectionFailure);
    }

    #[test]
    fn test_error_record_snapshot() {
        let err = TourlinkError::QualityCritical { score: 12 };
        let record = ErrorRecord::from(&err);
        assert_eq!(record.kind, ErrorKind::QualityCritical);
        assert!(record.message.contains("12"));
    }
}
