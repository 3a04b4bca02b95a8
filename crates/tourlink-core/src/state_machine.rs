//! Connection Lifecycle State Machine
//!
//! Per-session lifecycle of one peer link, from candidate gathering through the
//! offer/answer handshake to a connected (or terminal) state. Transitions are
//! validated against an adjacency table so no phase can be skipped, every
//! accepted transition is recorded in a bounded audit trail, and registered
//! callbacks observe it synchronously in registration order.
//!
//! The machine also gates outbound connectivity candidates: candidates handed
//! to [`ConnectionStateMachine::buffer_ice_candidate`] are held until both
//! session descriptions are applied.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::transport::IceCandidate;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Connection States
// ----------------------------------------------------------------------------

/// Lifecycle state of one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Gathering,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    IceExchange,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States directly reachable from this one
    pub fn successors(&self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            Idle => &[Gathering, Failed, Closed],
            Gathering => &[OfferSent, OfferReceived, Failed, Closed],
            OfferSent => &[AnswerReceived, Failed, Closed],
            OfferReceived => &[AnswerSent, Failed, Closed],
            AnswerSent | AnswerReceived => &[IceExchange, Failed, Closed],
            IceExchange => &[Connected, Reconnecting, Failed, Closed],
            Connected => &[Reconnecting, Failed, Closed],
            Reconnecting => &[Connected, Gathering, Failed, Closed],
            Failed | Closed => &[],
        }
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Gathering => "Gathering",
            ConnectionState::OfferSent => "OfferSent",
            ConnectionState::OfferReceived => "OfferReceived",
            ConnectionState::AnswerSent => "AnswerSent",
            ConnectionState::AnswerReceived => "AnswerReceived",
            ConnectionState::IceExchange => "IceExchange",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Failed => "Failed",
            ConnectionState::Closed => "Closed",
        }
    }

    /// Coarse state shown to users
    pub fn phase(&self) -> SessionPhase {
        match self {
            ConnectionState::Connected => SessionPhase::Connected,
            ConnectionState::Reconnecting => SessionPhase::Reconnecting,
            ConnectionState::Failed => SessionPhase::Failed,
            ConnectionState::Closed => SessionPhase::Closed,
            _ => SessionPhase::Connecting,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// User-visible session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

// ----------------------------------------------------------------------------
// State Transition Events
// ----------------------------------------------------------------------------

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Local candidate gathering started
    StartGathering,
    /// Local session description applied
    LocalDescriptionSet,
    /// Remote session description applied
    RemoteDescriptionSet,
    /// Both descriptions applied; candidates may flow
    BeginIceExchange,
    /// Transport reports an established link
    TransportConnected,
    /// Link lost; recovery is running
    ConnectionLost { reason: String },
    /// Recovery escalated to a fresh offer/answer handshake
    Resignal,
    /// Unrecoverable failure
    Fail { reason: String },
    /// Explicit teardown
    Close,
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::StartGathering => "StartGathering",
            ConnectionEvent::LocalDescriptionSet => "LocalDescriptionSet",
            ConnectionEvent::RemoteDescriptionSet => "RemoteDescriptionSet",
            ConnectionEvent::BeginIceExchange => "BeginIceExchange",
            ConnectionEvent::TransportConnected => "TransportConnected",
            ConnectionEvent::ConnectionLost { .. } => "ConnectionLost",
            ConnectionEvent::Resignal => "Resignal",
            ConnectionEvent::Fail { .. } => "Fail",
            ConnectionEvent::Close => "Close",
        }
    }
}

// ----------------------------------------------------------------------------
// Transition Records
// ----------------------------------------------------------------------------

/// Observed state change, handed to transition callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub event: ConnectionEvent,
    pub timestamp: Timestamp,
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
}

/// Handle returned by [`ConnectionStateMachine::on_transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type TransitionCallback = Box<dyn FnMut(&StateChange) + Send>;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    /// Invalid state transition attempted
    #[error("Invalid transition from {from_state} on event {event}: {reason}")]
    InvalidTransition {
        from_state: String,
        event: String,
        reason: String,
    },
    /// The same description was applied twice within one handshake
    #[error("{which} description already applied")]
    DuplicateDescription { which: &'static str },
}

impl StateTransitionError {
    fn invalid(from: ConnectionState, event: &ConnectionEvent, reason: impl Into<String>) -> Self {
        StateTransitionError::InvalidTransition {
            from_state: from.state_name().to_string(),
            event: event.name().to_string(),
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Buffered Candidates
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PendingCandidate {
    candidate: IceCandidate,
    priority: u32,
    arrival: u64,
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

/// Lifecycle state machine for one session
pub struct ConnectionStateMachine {
    state: ConnectionState,
    entered_at: Timestamp,
    local_description_set: bool,
    remote_description_set: bool,
    ice_gathering_complete: bool,
    pending: Vec<PendingCandidate>,
    next_arrival: u64,
    callbacks: Vec<(CallbackId, TransitionCallback)>,
    next_callback_id: u64,
    audit: VecDeque<AuditEntry>,
    audit_capacity: usize,
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("local_description_set", &self.local_description_set)
            .field("remote_description_set", &self.remote_description_set)
            .field("ice_gathering_complete", &self.ice_gathering_complete)
            .field("pending", &self.pending.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl ConnectionStateMachine {
    /// Create a machine in `Idle` keeping at most `audit_capacity` audit entries
    pub fn new(audit_capacity: usize, now: Timestamp) -> Self {
        Self {
            state: ConnectionState::Idle,
            entered_at: now,
            local_description_set: false,
            remote_description_set: false,
            ice_gathering_complete: false,
            pending: Vec::new(),
            next_arrival: 0,
            callbacks: Vec::new(),
            next_callback_id: 0,
            audit: VecDeque::with_capacity(audit_capacity.min(64)),
            audit_capacity: audit_capacity.max(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn time_in_state(&self, now: Timestamp) -> core::time::Duration {
        now.duration_since(self.entered_at)
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn ice_gathering_complete(&self) -> bool {
        self.ice_gathering_complete
    }

    /// True only once both descriptions are applied on a live link
    pub fn is_ready_for_ice_exchange(&self) -> bool {
        self.local_description_set && self.remote_description_set && !self.state.is_terminal()
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    /// Register a callback fired synchronously after every accepted transition
    pub fn on_transition<F>(&mut self, callback: F) -> CallbackId
    where
        F: FnMut(&StateChange) + Send + 'static,
    {
        let id = CallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    /// Remove a callback; returns false if it was not registered
    pub fn remove_callback(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        self.callbacks.len() != before
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Apply an event, validating it against the adjacency table
    pub fn transition(
        &mut self,
        event: ConnectionEvent,
        now: Timestamp,
    ) -> Result<ConnectionState, StateTransitionError> {
        use ConnectionState::*;

        let target = match (&event, self.state) {
            (ConnectionEvent::StartGathering, Idle) => Gathering,
            (ConnectionEvent::LocalDescriptionSet, Gathering) => OfferSent,
            (ConnectionEvent::LocalDescriptionSet, OfferReceived) => AnswerSent,
            (ConnectionEvent::RemoteDescriptionSet, Gathering) => OfferReceived,
            (ConnectionEvent::RemoteDescriptionSet, OfferSent) => AnswerReceived,
            (ConnectionEvent::BeginIceExchange, AnswerSent | AnswerReceived) => IceExchange,
            (ConnectionEvent::TransportConnected, IceExchange | Reconnecting) => Connected,
            (ConnectionEvent::ConnectionLost { .. }, IceExchange | Connected) => Reconnecting,
            (ConnectionEvent::Resignal, Reconnecting) => Gathering,
            (ConnectionEvent::Fail { .. }, state) if !state.is_terminal() => Failed,
            (ConnectionEvent::Close, state) if !state.is_terminal() => Closed,
            (_, state) if state.is_terminal() => {
                return Err(StateTransitionError::invalid(
                    state,
                    &event,
                    "state is terminal",
                ))
            }
            (_, state) => {
                return Err(StateTransitionError::invalid(
                    state,
                    &event,
                    "event not accepted in this state",
                ))
            }
        };

        if !self.state.can_transition_to(target) {
            return Err(StateTransitionError::invalid(
                self.state,
                &event,
                format!("{} is not adjacent", target),
            ));
        }

        if matches!(event, ConnectionEvent::Resignal) {
            self.local_description_set = false;
            self.remote_description_set = false;
            self.ice_gathering_complete = false;
        }
        if target.is_terminal() {
            self.pending.clear();
        }

        let change = StateChange {
            from: self.state,
            to: target,
            event,
            timestamp: now,
        };
        self.apply(change);
        Ok(target)
    }

    fn apply(&mut self, change: StateChange) {
        debug!(from = %change.from, to = %change.to, event = change.event.name(), "State transition");

        self.state = change.to;
        self.entered_at = change.timestamp;

        if self.audit.len() == self.audit_capacity {
            self.audit.pop_front();
        }
        self.audit.push_back(AuditEntry {
            timestamp: change.timestamp,
            from_state: change.from.state_name().to_string(),
            to_state: change.to.state_name().to_string(),
            event: change.event.name().to_string(),
        });

        for (_, callback) in self.callbacks.iter_mut() {
            callback(&change);
        }
    }

    /// Record that the local description is applied
    ///
    /// From `Idle` the machine passes through `Gathering` first. Once both
    /// descriptions are applied it moves on to `IceExchange`.
    pub fn set_local_description_complete(
        &mut self,
        now: Timestamp,
    ) -> Result<ConnectionState, StateTransitionError> {
        if self.local_description_set {
            return Err(StateTransitionError::DuplicateDescription { which: "local" });
        }
        if self.state == ConnectionState::Idle {
            self.transition(ConnectionEvent::StartGathering, now)?;
        }
        self.transition(ConnectionEvent::LocalDescriptionSet, now)?;
        self.local_description_set = true;
        self.advance_to_ice_exchange(now)
    }

    /// Record that the remote description is applied
    pub fn set_remote_description_complete(
        &mut self,
        now: Timestamp,
    ) -> Result<ConnectionState, StateTransitionError> {
        if self.remote_description_set {
            return Err(StateTransitionError::DuplicateDescription { which: "remote" });
        }
        if self.state == ConnectionState::Idle {
            self.transition(ConnectionEvent::StartGathering, now)?;
        }
        self.transition(ConnectionEvent::RemoteDescriptionSet, now)?;
        self.remote_description_set = true;
        self.advance_to_ice_exchange(now)
    }

    fn advance_to_ice_exchange(
        &mut self,
        now: Timestamp,
    ) -> Result<ConnectionState, StateTransitionError> {
        if self.local_description_set && self.remote_description_set {
            self.transition(ConnectionEvent::BeginIceExchange, now)
        } else {
            Ok(self.state)
        }
    }

    /// Record local candidate gathering completion; not a state change
    pub fn set_ice_gathering_complete(&mut self) {
        self.ice_gathering_complete = true;
    }

    // ------------------------------------------------------------------------
    // Candidate Gating
    // ------------------------------------------------------------------------

    /// Hold a local candidate until the link is ready for ICE exchange
    ///
    /// Candidates offered to a terminal machine are discarded and `false` is
    /// returned.
    pub fn buffer_ice_candidate(&mut self, candidate: IceCandidate, priority: u32) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        trace!(priority, pending = self.pending.len(), "Holding local candidate");
        self.pending.push(PendingCandidate {
            candidate,
            priority,
            arrival: self.next_arrival,
        });
        self.next_arrival += 1;
        true
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Release held candidates once ready: highest priority first, ties in
    /// arrival order. Returns nothing while the link is not ready.
    pub fn drain_ready_candidates(&mut self) -> Vec<IceCandidate> {
        if !self.is_ready_for_ice_exchange() {
            return Vec::new();
        }
        let mut pending = core::mem::take(&mut self.pending);
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.arrival.cmp(&b.arrival)));
        pending.into_iter().map(|p| p.candidate).collect()
    }

    // ------------------------------------------------------------------------
    // Audit Trail
    // ------------------------------------------------------------------------

    /// Recorded transitions, oldest first
    pub fn audit_trail(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit.iter()
    }

    pub fn audit_len(&self) -> usize {
        self.audit.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn create_test_candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"))
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::new(ms)
    }

    #[test]
    fn test_initial_state() {
        let machine = ConnectionStateMachine::new(16, ts(0));
        assert_eq!(machine.state(), ConnectionState::Idle);
        assert!(!machine.is_ready_for_ice_exchange());
        assert_eq!(machine.state().phase(), SessionPhase::Connecting);
    }

    #[test]
    fn test_guide_handshake_path() {
        let mut machine = ConnectionStateMachine::new(16, ts(0));

        assert_eq!(
            machine.set_local_description_complete(ts(1)).unwrap(),
            ConnectionState::OfferSent
        );
        assert!(!machine.is_ready_for_ice_exchange());
        assert_eq!(
            machine.set_remote_description_complete(ts(2)).unwrap(),
            ConnectionState::IceExchange
        );
        assert!(machine.is_ready_for_ice_exchange());

        let states: Vec<_> = machine.audit_trail().map(|e| e.to_state.clone()).collect();
        assert_eq!(
            states,
            vec!["Gathering", "OfferSent", "AnswerReceived", "IceExchange"]
        );
    }

    #[test]
    fn test_attendee_handshake_path() {
        let mut machine = ConnectionStateMachine::new(16, ts(0));
        machine.transition(ConnectionEvent::StartGathering, ts(0)).unwrap();

        assert_eq!(
            machine.set_remote_description_complete(ts(1)).unwrap(),
            ConnectionState::OfferReceived
        );
        assert_eq!(
            machine.set_local_description_complete(ts(2)).unwrap(),
            ConnectionState::IceExchange
        );
        let states: Vec<_> = machine.audit_trail().map(|e| e.to_state.clone()).collect();
        assert_eq!(
            states,
            vec!["Gathering", "OfferReceived", "AnswerSent", "IceExchange"]
        );
    }

    #[test]
    fn test_connected_requires_ice_exchange() {
        let mut machine = ConnectionStateMachine::new(16, ts(0));
        machine.set_local_description_complete(ts(1)).unwrap();

        let err = machine
            .transition(ConnectionEvent::TransportConnected, ts(2))
            .unwrap_err();
        assert!(matches!(err, StateTransitionError::InvalidTransition { .. }));
        assert_eq!(machine.state(), ConnectionState::OfferSent);
    }

    #[test]
    fn test_duplicate_description_rejected() {
        let mut machine = ConnectionStateMachine::new(16, ts(0));
        machine.set_local_description_complete(ts(1)).unwrap();
        assert_eq!(
            machine.set_local_description_complete(ts(2)).unwrap_err(),
            StateTransitionError::DuplicateDescription { which: "local" }
        );
    }

    #[test]
    fn test_reconnecting_round_trip_and_resignal() {
        let mut machine = ConnectionStateMachine::new(16, ts(0));
        machine.set_local_description_complete(ts(1)).unwrap();
        machine.set_remote_description_complete(ts(2)).unwrap();
        machine.transition(ConnectionEvent::TransportConnected, ts(3)).unwrap();
        machine
            .transition(ConnectionEvent::ConnectionLost { reason: "ice".into() }, ts(4))
            .unwrap();
        assert_eq!(machine.state().phase(), SessionPhase::Reconnecting);
        machine.transition(ConnectionEvent::TransportConnected, ts(5)).unwrap();
        machine
            .transition(ConnectionEvent::ConnectionLost { reason: "ice".into() }, ts(6))
            .unwrap();

        machine.transition(ConnectionEvent::Resignal, ts(7)).unwrap();
        assert_eq!(machine.state(), ConnectionState::Gathering);
        assert!(!machine.is_ready_for_ice_exchange());
        assert!(machine.set_local_description_complete(ts(8)).is_ok());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut machine = ConnectionStateMachine::new(16, ts(0));
        machine.transition(ConnectionEvent::Close, ts(1)).unwrap();
        assert!(machine.state().is_terminal());
        assert!(machine.transition(ConnectionEvent::StartGathering, ts(2)).is_err());
        assert!(machine.transition(ConnectionEvent::Close, ts(2)).is_err());
        assert!(!machine.buffer_ice_candidate(create_test_candidate(1), 1));
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let mut machine = ConnectionStateMachine::new(16, ts(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = log.clone();
        machine.on_transition(move |change| first.lock().unwrap().push(format!("a:{}", change.to)));
        let second = log.clone();
        let id = machine
            .on_transition(move |change| second.lock().unwrap().push(format!("b:{}", change.to)));

        machine.transition(ConnectionEvent::StartGathering, ts(1)).unwrap();
        assert!(machine.remove_callback(id));
        assert!(!machine.remove_callback(id));
        machine.transition(ConnectionEvent::Close, ts(2)).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:Gathering", "b:Gathering", "a:Closed"]
        );
    }

    #[test]
    fn test_candidates_held_until_ready() {
        let mut machine = ConnectionStateMachine::new(16, ts(0));
        machine.buffer_ice_candidate(create_test_candidate(1), 10);
        machine.buffer_ice_candidate(create_test_candidate(2), 50);
        machine.buffer_ice_candidate(create_test_candidate(3), 10);

        machine.set_local_description_complete(ts(1)).unwrap();
        assert!(machine.drain_ready_candidates().is_empty());
        assert_eq!(machine.pending_candidates(), 3);

        machine.set_remote_description_complete(ts(2)).unwrap();
        let released = machine.drain_ready_candidates();
        assert_eq!(
            released,
            vec![
                create_test_candidate(2),
                create_test_candidate(1),
                create_test_candidate(3)
            ]
        );
        assert_eq!(machine.pending_candidates(), 0);
    }

    #[test]
    fn test_audit_trail_is_bounded() {
        let mut machine = ConnectionStateMachine::new(3, ts(0));
        machine.set_local_description_complete(ts(1)).unwrap();
        machine.set_remote_description_complete(ts(2)).unwrap();
        machine.transition(ConnectionEvent::TransportConnected, ts(3)).unwrap();
        assert_eq!(machine.audit_len(), 3);
        assert_eq!(machine.audit_trail().next().unwrap().to_state, "AnswerReceived");
    }
}
