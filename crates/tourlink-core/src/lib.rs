//! Tourlink Core
//!
//! Stable types, configuration and the synchronous policies behind
//! peer-to-peer tour audio sessions: the connection lifecycle state machine,
//! candidate batching, health scoring, recovery planning and the quality
//! ladder, plus the collaborator contracts (coordination store, real-time
//! transport) the async runtime drives.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod batcher;
pub mod config;
pub mod degradation;
pub mod errors;
pub mod event_bus;
pub mod health;
pub mod recovery;
pub mod signaling;
pub mod state_machine;
pub mod store;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use batcher::{BatchAck, BatcherStats, CandidateBatch, IceCandidateBatcher, SequencedCandidate};
pub use config::{
    BatchConfig, ChannelConfig, DegradationConfig, HealthConfig, RecoveryConfig,
    SignalingConfig, TourlinkConfig,
};
pub use degradation::{
    ChangeReason, DegradationManager, DeviceProfile, FallbackStrategy, QualityChange,
    QualityLevel, QualityMetrics, StrategySettings,
};
pub use errors::{
    ErrorKind, ErrorRecord, StoreError, TourlinkError, TourlinkResult, TransportError,
    ValidationError,
};
pub use event_bus::{EventBus, SubscriptionId};
pub use health::{
    Alert, AlertReason, DiagnosticReport, HealthMonitor, MetricSample, QualityGrade,
    SampleOutcome, Warning, WarningKind,
};
pub use recovery::{
    AttemptOutcome, AttemptResult, Failure, FailureCause, FailureType, FinalOutcome,
    RecoveryDecision, RecoveryPlan, RecoveryPlanner, RecoverySession, RecoveryStrategy,
};
pub use signaling::{
    ConnectionPhase, CoordinationState, CoordinationUpdate, HealthReport, IceCandidateRecord,
    Liveness, MessagePayload, MessageType, ParticipantUpdate, SignalingMessage,
};
pub use state_machine::{
    AuditEntry, ConnectionEvent, ConnectionState, ConnectionStateMachine, SessionPhase,
    StateChange, StateTransitionError,
};
pub use store::{CasOutcome, CoordinationStore, InMemoryStore, Versioned};
pub use transport::{
    IceCandidate, IceConnectionState, RealtimeTransport, SdpKind, SessionDescription,
    TransportEvent, TransportFactory, TransportState, TransportStats,
};
pub use types::{
    ChannelKey, ManualTimeSource, ParticipantId, Role, SessionKey, SystemTimeSource,
    TimeSource, Timestamp,
};
