//! Tourlink Runtime Engine
//!
//! The async side of tour audio links, including:
//! - `SessionOrchestrator`: the registry and façade consumers talk to
//! - `Session`: one peer link with its timers, signaling and recovery
//! - `SignalingCoordinator`: offer/answer and candidate exchange over a
//!   shared coordination store
//! - `SessionScheduler`: named one-shot and periodic timers per session
//!
//! `tourlink-core` provides the synchronous policies and collaborator
//! contracts; this crate drives them on tokio.

pub mod clock;
pub mod coordinator;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod sim;

pub use clock::TokioTimeSource;
pub use coordinator::SignalingCoordinator;
pub use events::SessionEvent;
pub use orchestrator::{OrchestratorBuilder, SessionOrchestrator};
pub use recovery::{run_recovery, RecoveryExecutor};
pub use scheduler::{timers, SessionScheduler};
pub use session::{Session, SessionDiagnostics, SessionStatus};
pub use sim::{LinkConditions, SimulatedTransport, SimulatedTransportFactory};

// Re-export core types for convenience
pub use tourlink_core::{
    ConnectionState, CoordinationStore, InMemoryStore, QualityLevel, Role, SessionKey,
    TourlinkConfig, TourlinkError, TourlinkResult,
};
