//! Session Lifecycle
//!
//! A [`Session`] owns one peer link of a tour channel and wires its
//! components together:
//! - the connection state machine and candidate gating
//! - the ICE candidate batcher and delivery tracking
//! - signaling through the [`SignalingCoordinator`]
//! - health sampling, quality degradation and the emergency fallback
//! - failure recovery through the [`RecoveryPlanner`]
//!
//! All synchronous component state lives in one [`SessionCore`] behind a
//! mutex that is never held across an await. Transitions observed by the
//! state machine are queued and published as [`SessionEvent::StateChanged`]
//! once the lock is released.

mod fallback;
mod health;
mod recovery;

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tourlink_core::recovery::RecoveryStats;
use tourlink_core::{
    AuditEntry, BatchAck, BatcherStats, CandidateBatch, ConnectionEvent, ConnectionPhase,
    ConnectionState, ConnectionStateMachine, CoordinationState, CoordinationStore,
    DegradationManager, DiagnosticReport, ErrorRecord, EventBus, Failure, FailureCause,
    FailureType, FinalOutcome, HealthMonitor, HealthReport, IceCandidate, IceCandidateBatcher,
    IceCandidateRecord, IceConnectionState, MessagePayload, MessageType, ParticipantId,
    QualityChange, QualityGrade, QualityLevel, RealtimeTransport, RecoveryDecision, RecoveryPlan,
    RecoveryPlanner, RecoverySession, Role, SdpKind, SequencedCandidate, SessionDescription,
    SessionKey, SessionPhase, SignalingMessage, StateChange, StateTransitionError,
    StrategySettings, TimeSource, Timestamp, TourlinkConfig, TourlinkError, TourlinkResult,
    TransportEvent, TransportFactory, TransportState,
};
use tracing::{debug, error, info, trace, warn};

use crate::coordinator::SignalingCoordinator;
use crate::events::SessionEvent;
use crate::recovery::run_recovery;
use crate::scheduler::{timers, SessionScheduler};

/// Errors kept for diagnostics
const ERROR_HISTORY: usize = 32;

/// Smallest delay a deadline timer is armed with
const MIN_TIMER_DELAY: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Status Snapshots
// ----------------------------------------------------------------------------

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub key: SessionKey,
    pub role: Role,
    pub phase: SessionPhase,
    pub state: ConnectionState,
    pub peer_id: Option<ParticipantId>,
    pub created_at: Timestamp,
    pub time_in_state_ms: u64,
    pub ready_for_ice_exchange: bool,
    pub pending_local_candidates: usize,
    pub ice_gathering_complete: bool,
    pub quality_level: QualityLevel,
    pub quality_settings: Option<StrategySettings>,
    pub quality_score: Option<u8>,
    pub quality_grade: Option<QualityGrade>,
    pub batching: BatcherStats,
    pub recovery: RecoveryStats,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnections: u32,
    pub health_report: Option<HealthReport>,
    pub peer_report: Option<HealthReport>,
    pub last_error: Option<ErrorRecord>,
    pub active_timers: Vec<String>,
}

/// Full diagnostic dump of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub status: SessionStatus,
    pub report: DiagnosticReport,
    pub recovery_history: Vec<RecoverySession>,
    pub audit_trail: Vec<AuditEntry>,
    pub errors: Vec<ErrorRecord>,
}

// ----------------------------------------------------------------------------
// Session Core
// ----------------------------------------------------------------------------

/// Peer candidates held until the remote description is applied
#[derive(Debug)]
enum DeferredCandidates {
    Batch(CandidateBatch),
    Single(SequencedCandidate),
}

/// Synchronous component state of one session
struct SessionCore {
    machine: ConnectionStateMachine,
    batcher: IceCandidateBatcher,
    health: HealthMonitor,
    degradation: DegradationManager,
    peer_id: Option<ParticipantId>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Remote candidates applied to the current handshake, replayed on rebuild
    applied_remote: Vec<IceCandidate>,
    /// Highest batch sequence applied per sender in the current handshake
    last_applied: HashMap<ParticipantId, u64>,
    /// Remote candidates that arrived before the remote description
    deferred: Vec<DeferredCandidates>,
    health_report: Option<HealthReport>,
    peer_report: Option<HealthReport>,
    reconnections: u32,
    errors: VecDeque<ErrorRecord>,
    emergency_active: bool,
}

impl SessionCore {
    fn clear_handshake(&mut self) {
        self.local_description = None;
        self.remote_description = None;
        self.applied_remote.clear();
        self.last_applied.clear();
        self.deferred.clear();
    }

    /// Move an active link to `Reconnecting`, then back to `Gathering`
    fn reset_for_handshake(&mut self, reason: &str, now: Timestamp) -> TourlinkResult<()> {
        if matches!(
            self.machine.state(),
            ConnectionState::IceExchange | ConnectionState::Connected
        ) {
            self.machine.transition(
                ConnectionEvent::ConnectionLost {
                    reason: reason.to_string(),
                },
                now,
            )?;
        }
        if self.machine.state() == ConnectionState::Reconnecting {
            self.machine.transition(ConnectionEvent::Resignal, now)?;
        }
        self.clear_handshake();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// One live peer link
pub struct Session {
    key: SessionKey,
    role: Role,
    config: Arc<TourlinkConfig>,
    clock: Arc<dyn TimeSource>,
    coordinator: SignalingCoordinator,
    factory: Arc<dyn TransportFactory>,
    transport: RwLock<Arc<dyn RealtimeTransport>>,
    scheduler: SessionScheduler,
    events: EventBus<SessionEvent>,
    core: Mutex<SessionCore>,
    recovery: Mutex<RecoveryPlanner>,
    transitions: Arc<Mutex<Vec<StateChange>>>,
    state_watch: Arc<watch::Sender<ConnectionState>>,
    pending_events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    created_at: Timestamp,
    closed: AtomicBool,
    weak_self: Weak<Session>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Build a session and its transport; nothing runs until [`start`](Self::start)
    pub(crate) fn new(
        key: SessionKey,
        role: Role,
        config: Arc<TourlinkConfig>,
        store: Arc<dyn CoordinationStore>,
        factory: Arc<dyn TransportFactory>,
        clock: Arc<dyn TimeSource>,
    ) -> TourlinkResult<Arc<Self>> {
        let (event_tx, event_rx) = mpsc::channel(config.channels.transport_event_buffer_size);
        let transport = factory.create(&key, event_tx)?;
        let now = clock.now();

        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let state_watch = Arc::new(state_tx);
        let transitions = Arc::new(Mutex::new(Vec::new()));

        let mut machine = ConnectionStateMachine::new(config.channels.audit_trail_size, now);
        {
            let state_watch = Arc::clone(&state_watch);
            let transitions = Arc::clone(&transitions);
            machine.on_transition(move |change| {
                state_watch.send_replace(change.to);
                lock(&transitions).push(change.clone());
            });
        }

        let core = SessionCore {
            machine,
            batcher: IceCandidateBatcher::new(key.participant_id.clone(), config.batching.clone()),
            health: HealthMonitor::new(config.health.clone(), now),
            degradation: DegradationManager::new(config.degradation.clone()),
            peer_id: None,
            local_description: None,
            remote_description: None,
            applied_remote: Vec::new(),
            last_applied: HashMap::new(),
            deferred: Vec::new(),
            health_report: None,
            peer_report: None,
            reconnections: 0,
            errors: VecDeque::with_capacity(ERROR_HISTORY),
            emergency_active: false,
        };

        let coordinator = SignalingCoordinator::new(
            store,
            key.channel(),
            role,
            key.participant_id.clone(),
            config.signaling.clone(),
            Arc::clone(&clock),
        );

        Ok(Arc::new_cyclic(|weak_self| Session {
            scheduler: SessionScheduler::new(key.to_string()),
            recovery: Mutex::new(RecoveryPlanner::new(config.recovery.clone())),
            key,
            role,
            config,
            clock,
            coordinator,
            factory,
            transport: RwLock::new(transport),
            events: EventBus::new(),
            core: Mutex::new(core),
            transitions,
            state_watch,
            pending_events: Mutex::new(Some(event_rx)),
            created_at: now,
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        }))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_watch.borrow()
    }

    pub fn events(&self) -> &EventBus<SessionEvent> {
        &self.events
    }

    pub fn coordinator(&self) -> &SignalingCoordinator {
        &self.coordinator
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peer_id(&self) -> Option<ParticipantId> {
        self.with_core(|core| core.peer_id.clone())
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn transport(&self) -> Arc<dyn RealtimeTransport> {
        Arc::clone(&self.transport.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn ensure_open(&self) -> TourlinkResult<()> {
        if self.is_closed() {
            return Err(TourlinkError::SessionClosed {
                key: self.key.to_string(),
            });
        }
        Ok(())
    }

    /// Run `f` on the core, then publish the transitions it caused
    fn with_core<R>(&self, f: impl FnOnce(&mut SessionCore) -> R) -> R {
        let result = {
            let mut core = lock(&self.core);
            f(&mut core)
        };
        self.publish_transitions();
        result
    }

    fn publish_transitions(&self) {
        let changes = std::mem::take(&mut *lock(&self.transitions));
        for change in changes {
            self.events.publish(SessionEvent::StateChanged(change));
        }
    }

    fn record_error(&self, err: &TourlinkError) {
        if err.is_transient() {
            debug!(session = %self.key, error = %err, "Transient session error");
        } else {
            warn!(session = %self.key, error = %err, "Session error");
        }
        let record = ErrorRecord::from(err);
        self.with_core(|core| {
            if core.errors.len() == ERROR_HISTORY {
                core.errors.pop_front();
            }
            core.errors.push_back(record.clone());
        });
        self.events.publish(SessionEvent::Error(record));
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    /// Register on the channel, signal readiness and arm the periodic timers
    pub(crate) async fn start(&self) -> TourlinkResult<()> {
        self.ensure_open()?;
        self.coordinator.initialize_coordination().await?;
        self.learn_peer().await;
        self.coordinator.signal_ready().await?;

        let events = lock(&self.pending_events).take().ok_or_else(|| {
            TourlinkError::channel_error(format!("session {} already started", self.key))
        })?;
        self.spawn_transport_pump(events)?;

        let signaling = &self.config.signaling;
        let health = &self.config.health;
        self.arm_interval(timers::INBOUND_POLL, signaling.inbound_poll_interval, |s| async move {
            s.poll_inbound().await
        })?;
        self.arm_interval(timers::HEARTBEAT, signaling.heartbeat_interval, |s| async move {
            s.send_heartbeat().await
        })?;
        self.arm_interval(timers::HEALTH_SAMPLE, health.sample_interval, |s| async move {
            s.sample_health().await
        })?;
        self.arm_interval(timers::HEALTH_REPORT, health.report_interval, |s| async move {
            s.publish_report()
        })?;

        info!(session = %self.key, role = %self.role, "Session started");
        Ok(())
    }

    /// Arm a periodic timer that stops once the session is dropped
    fn arm_interval<F, Fut>(&self, name: &str, period: Duration, tick: F) -> TourlinkResult<()>
    where
        F: Fn(Arc<Session>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = self.weak_self.clone();
        self.scheduler.schedule_interval(name, period, move || {
            let tick = weak.upgrade().map(&tick);
            async move {
                match tick {
                    Some(tick) => {
                        tick.await;
                        true
                    }
                    None => false,
                }
            }
        })
    }

    /// Forward transport callbacks into the session until the channel closes
    fn spawn_transport_pump(&self, mut events: mpsc::Receiver<TransportEvent>) -> TourlinkResult<()> {
        let weak = self.weak_self.clone();
        self.scheduler.spawn(timers::TRANSPORT_EVENTS, async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.handle_transport_event(event).await;
            }
        })
    }

    /// Pick up the counterpart from the coordination state if not known yet
    async fn learn_peer(&self) -> Option<ParticipantId> {
        if let Some(peer) = self.peer_id() {
            return Some(peer);
        }
        let state = match self.coordinator.get_coordination_state().await {
            Ok(state) => state?,
            Err(err) => {
                debug!(session = %self.key, error = %err, "Peer lookup failed");
                return None;
            }
        };
        let peer = state.peer_of(self.role)?;
        debug!(session = %self.key, peer = %peer, "Peer discovered");
        Some(self.with_core(|core| core.peer_id.get_or_insert(peer).clone()))
    }

    // ------------------------------------------------------------------------
    // Descriptions
    // ------------------------------------------------------------------------

    /// Create and apply an offer; guide only
    pub async fn negotiate(&self) -> TourlinkResult<()> {
        if self.role != Role::Guide {
            return Err(TourlinkError::RoleMismatch {
                expected: Role::Guide,
            });
        }
        self.ensure_open()?;
        self.learn_peer().await;
        let offer = self.transport().create_offer().await?;
        self.set_local_description(offer).await
    }

    /// Wait for the attendee to be ready, then offer; false if it never was
    pub async fn start_negotiation(&self, peer_timeout: Duration) -> TourlinkResult<bool> {
        if self.role != Role::Guide {
            return Err(TourlinkError::RoleMismatch {
                expected: Role::Guide,
            });
        }
        if !self.coordinator.wait_for_peer_ready(peer_timeout).await {
            info!(session = %self.key, "Attendee not ready; negotiation deferred");
            return Ok(false);
        }
        self.negotiate().await?;
        Ok(true)
    }

    /// Apply a local description and send it to the peer
    pub async fn set_local_description(&self, description: SessionDescription) -> TourlinkResult<()> {
        self.ensure_open()?;
        description.validate()?;
        if self.with_core(|core| core.machine.local_description_set()) {
            return Err(StateTransitionError::DuplicateDescription { which: "local" }.into());
        }

        self.transport().set_local_description(&description).await?;
        let now = self.now();
        self.with_core(|core| -> TourlinkResult<()> {
            core.machine.set_local_description_complete(now)?;
            core.local_description = Some(description.clone());
            Ok(())
        })?;

        let (message_type, phase) = match description.kind {
            SdpKind::Offer => (MessageType::Offer, ConnectionPhase::OfferSent),
            SdpKind::Answer => (MessageType::Answer, ConnectionPhase::AnswerSent),
        };
        let peer = self.peer_id();
        self.coordinator
            .send_message(message_type, MessagePayload::Description(description), peer.as_ref())
            .await?;
        self.coordinator.set_phase(phase).await?;
        debug!(session = %self.key, ?message_type, "Local description sent");

        self.on_descriptions_applied().await;
        Ok(())
    }

    /// Apply the peer's description
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> TourlinkResult<()> {
        self.ensure_open()?;
        description.validate()?;
        if self.with_core(|core| core.machine.remote_description_set()) {
            return Err(StateTransitionError::DuplicateDescription { which: "remote" }.into());
        }

        self.transport().set_remote_description(&description).await?;
        let now = self.now();
        self.with_core(|core| -> TourlinkResult<()> {
            core.machine.set_remote_description_complete(now)?;
            core.remote_description = Some(description);
            Ok(())
        })?;
        debug!(session = %self.key, "Remote description applied");

        self.on_descriptions_applied().await;
        Ok(())
    }

    async fn on_descriptions_applied(&self) {
        if !self.with_core(|core| core.machine.is_ready_for_ice_exchange()) {
            return;
        }
        if let Err(err) = self.coordinator.set_phase(ConnectionPhase::IceExchange).await {
            self.record_error(&err);
        }
        self.release_candidates().await;

        let deferred = self.with_core(|core| std::mem::take(&mut core.deferred));
        for held in deferred {
            match held {
                DeferredCandidates::Batch(batch) => self.apply_batch(batch).await,
                DeferredCandidates::Single(sequenced) => {
                    if let Err(err) = self.apply_single_candidate(sequenced).await {
                        self.record_error(&err);
                    }
                }
            }
        }
    }

    /// Reset the handshake so a fresh offer/answer can run
    fn prepare_for_renegotiation(&self, reason: &str) {
        let now = self.now();
        if let Err(err) = self.with_core(|core| core.reset_for_handshake(reason, now)) {
            debug!(session = %self.key, error = %err, "Handshake reset incomplete");
        }
    }

    // ------------------------------------------------------------------------
    // Local Candidates
    // ------------------------------------------------------------------------

    async fn on_local_candidate(&self, candidate: IceCandidate) {
        let priority = candidate.priority().unwrap_or(0);
        let (held, ready) = self.with_core(|core| {
            let held = core.machine.buffer_ice_candidate(candidate, priority);
            (held, core.machine.is_ready_for_ice_exchange())
        });
        if !held {
            trace!(session = %self.key, "Local candidate discarded on a closed link");
            return;
        }
        if ready {
            self.release_candidates().await;
        }
    }

    /// Move held candidates into the batcher once the link is ready
    async fn release_candidates(&self) {
        let now = self.now();
        let (released, full, deadline) = self.with_core(|core| {
            let released = core.machine.drain_ready_candidates();
            let count = released.len();
            let mut full = Vec::new();
            for candidate in released {
                match core.batcher.add_candidate(candidate, now) {
                    Ok(Some(batch)) => full.push(batch),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(session = %self.key, error = %err, "Rejected malformed local candidate")
                    }
                }
            }
            (count, full, core.batcher.deadline())
        });
        if released == 0 {
            return;
        }

        self.events
            .publish(SessionEvent::CandidatesReleased { count: released });
        for batch in full {
            self.send_batch(batch).await;
        }
        self.arm_flush(deadline);
    }

    fn arm_flush(&self, deadline: Option<Timestamp>) {
        let Some(deadline) = deadline else {
            return;
        };
        let delay = deadline.duration_since(self.now()).max(MIN_TIMER_DELAY);
        let weak = self.weak_self.clone();
        let armed = self
            .scheduler
            .schedule_once(timers::BATCH_FLUSH, delay, async move {
                if let Some(session) = weak.upgrade() {
                    session.flush_due_batch().await;
                }
            });
        if let Err(err) = armed {
            debug!(session = %self.key, error = %err, "Batch flush not armed");
        }
    }

    async fn flush_due_batch(&self) {
        let now = self.now();
        let (batch, deadline) =
            self.with_core(|core| (core.batcher.poll_deadline(now), core.batcher.deadline()));
        match batch {
            Some(batch) => self.send_batch(batch).await,
            None => self.arm_flush(deadline),
        }
    }

    /// Flush whatever is buffered right now
    async fn force_flush(&self) {
        self.scheduler.cancel(timers::BATCH_FLUSH);
        let now = self.now();
        if let Some(batch) = self.with_core(|core| core.batcher.force_flush(now)) {
            self.send_batch(batch).await;
        }
    }

    async fn send_batch(&self, batch: CandidateBatch) {
        let peer = self.peer_id();
        let (batch_id, size) = (batch.batch_id, batch.len());
        match self.coordinator.send_candidate_batch(&batch, peer.as_ref()).await {
            Ok(()) => {
                self.events
                    .publish(SessionEvent::BatchSent { batch_id, size });
            }
            Err(err) => self.record_error(&err),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound Signaling
    // ------------------------------------------------------------------------

    async fn poll_inbound(&self) {
        let now = self.now();
        let undelivered = self.with_core(|core| core.batcher.expire_unacked(now));
        for err in undelivered {
            if let TourlinkError::IceDeliveryFailure { batch_id, .. } = &err {
                self.events
                    .publish(SessionEvent::BatchUndelivered { batch_id: *batch_id });
            }
            self.record_error(&err);
        }

        match self.coordinator.fetch_messages().await {
            Ok(messages) => {
                for message in messages {
                    self.handle_message(message).await;
                }
            }
            Err(err) => self.record_error(&err),
        }
    }

    async fn handle_message(&self, message: SignalingMessage) {
        let from = message.sender.participant_id.clone();
        self.with_core(|core| {
            if core.peer_id.is_none() {
                core.peer_id = Some(from.clone());
            }
        });
        trace!(session = %self.key, message_id = %message.message_id, "Handling message");

        let result = match message.payload {
            MessagePayload::Description(description) => {
                self.on_remote_description(description, from).await
            }
            MessagePayload::Batch(batch) => {
                self.on_remote_batch(batch).await;
                Ok(())
            }
            MessagePayload::BatchAck(ack) => {
                self.on_batch_ack(ack);
                Ok(())
            }
            MessagePayload::Heartbeat { report } => {
                if let Some(report) = report {
                    self.with_core(|core| core.peer_report = Some(report.clone()));
                    self.events.publish(SessionEvent::PeerReport(report));
                }
                Ok(())
            }
            MessagePayload::StateSync(state) => self.on_state_sync(state).await,
            MessagePayload::Candidate(sequenced) => self.on_remote_candidate(sequenced).await,
        };
        if let Err(err) = result {
            self.record_error(&err);
        }
    }

    async fn on_remote_description(
        &self,
        description: SessionDescription,
        from: ParticipantId,
    ) -> TourlinkResult<()> {
        match (self.role, description.kind) {
            (Role::Attendee, SdpKind::Offer) => {
                self.with_core(|core| core.peer_id = Some(from));
                self.prepare_for_renegotiation("new offer from guide");
                self.set_remote_description(description).await?;
                let answer = self.transport().create_answer().await?;
                self.set_local_description(answer).await
            }
            (Role::Guide, SdpKind::Answer) => {
                if self.with_core(|core| core.remote_description.is_some()) {
                    debug!(session = %self.key, "Ignoring repeated answer");
                    return Ok(());
                }
                self.set_remote_description(description).await
            }
            (role, kind) => {
                debug!(session = %self.key, %role, ?kind, "Ignoring description for the other role");
                Ok(())
            }
        }
    }

    async fn on_remote_batch(&self, batch: CandidateBatch) {
        let batch = self.with_core(|core| {
            if core.remote_description.is_some() {
                Some(batch)
            } else {
                core.deferred.push(DeferredCandidates::Batch(batch));
                None
            }
        });
        match batch {
            Some(batch) => self.apply_batch(batch).await,
            None => debug!(session = %self.key, "Deferring candidate batch until the remote description is applied"),
        }
    }

    /// Apply a peer batch in sequence order, then acknowledge it
    async fn apply_batch(&self, batch: CandidateBatch) {
        let sender = batch.from_id.clone();
        let last = self.with_core(|core| core.last_applied.get(&sender).copied());
        let transport = self.transport();

        let (mut processed, mut errors) = (0u32, 0u32);
        let mut newest = last;
        for SequencedCandidate {
            sequence_number,
            candidate,
        } in &batch.candidates
        {
            if last.is_some_and(|last| *sequence_number <= last) {
                trace!(session = %self.key, sequence_number, "Skipping already applied candidate");
                continue;
            }
            newest = Some(newest.map_or(*sequence_number, |n| n.max(*sequence_number)));

            match transport.add_ice_candidate(candidate).await {
                Ok(()) => {
                    processed += 1;
                    self.with_core(|core| core.applied_remote.push(candidate.clone()));
                    let id = IceCandidateRecord::id_for(&sender, *sequence_number);
                    if let Err(err) = self.coordinator.mark_ice_candidate_processed(&id).await {
                        debug!(session = %self.key, error = %err, "Candidate record not marked");
                    }
                }
                Err(err) => {
                    errors += 1;
                    warn!(session = %self.key, sequence_number, error = %err, "Remote candidate rejected");
                }
            }
        }
        if let Some(newest) = newest {
            self.with_core(|core| core.last_applied.insert(sender.clone(), newest));
        }

        self.events.publish(SessionEvent::RemoteCandidatesApplied {
            batch_id: batch.batch_id,
            processed,
            errors,
        });
        let ack = BatchAck {
            batch_id: batch.batch_id,
            processed_count: processed,
            error_count: errors,
            timestamp: self.now(),
        };
        if let Err(err) = self.coordinator.acknowledge_batch(ack, Some(&sender)).await {
            self.record_error(&err);
        }
    }

    fn on_batch_ack(&self, ack: BatchAck) {
        if self.with_core(|core| core.batcher.record_ack(&ack)) {
            self.events.publish(SessionEvent::BatchAcknowledged(ack));
        }
    }

    async fn on_remote_candidate(&self, sequenced: SequencedCandidate) -> TourlinkResult<()> {
        let sequenced = self.with_core(|core| {
            if core.remote_description.is_some() {
                Some(sequenced)
            } else {
                core.deferred.push(DeferredCandidates::Single(sequenced));
                None
            }
        });
        match sequenced {
            Some(sequenced) => self.apply_single_candidate(sequenced).await,
            None => {
                debug!(session = %self.key, "Deferring candidate until the remote description is applied");
                Ok(())
            }
        }
    }

    async fn apply_single_candidate(&self, sequenced: SequencedCandidate) -> TourlinkResult<()> {
        self.transport()
            .add_ice_candidate(&sequenced.candidate)
            .await?;
        self.with_core(|core| core.applied_remote.push(sequenced.candidate));
        Ok(())
    }

    /// An attendee asking for a fresh handshake
    async fn on_state_sync(&self, state: CoordinationState) -> TourlinkResult<()> {
        if self.role != Role::Guide || state.connection_phase != ConnectionPhase::Initial {
            return Ok(());
        }
        info!(session = %self.key, "Attendee requested a fresh handshake");
        self.prepare_for_renegotiation("attendee requested resignal");
        self.negotiate().await
    }

    async fn send_heartbeat(&self) {
        let (report, peer) =
            self.with_core(|core| (core.health_report.clone(), core.peer_id.clone()));
        if let Err(err) = self.coordinator.heartbeat(report, peer.as_ref()).await {
            self.record_error(&err);
        }
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate).await,
            TransportEvent::IceGatheringComplete => {
                self.with_core(|core| core.machine.set_ice_gathering_complete());
                if let Err(err) = self.coordinator.signal_ice_gathering_complete().await {
                    self.record_error(&err);
                }
            }
            TransportEvent::ConnectionStateChanged(state) => self.on_connection_state(state).await,
            TransportEvent::IceStateChanged(state) => self.on_ice_state(state).await,
            TransportEvent::TrackAdded { track_id } => {
                info!(session = %self.key, track_id = %track_id, "Remote audio track");
                self.events.publish(SessionEvent::RemoteTrack { track_id });
            }
        }
    }

    async fn on_connection_state(&self, state: TransportState) {
        match state {
            TransportState::Connected => self.on_connected().await,
            TransportState::Disconnected => self.force_flush().await,
            TransportState::Failed => {
                self.on_failure(Failure::new(
                    FailureType::PeerConnectionFailed,
                    FailureCause::TransportFailed,
                    "transport failed",
                ))
                .await
            }
            TransportState::Closed => {
                if self.is_closed() {
                    return;
                }
                self.on_failure(Failure::new(
                    FailureType::PeerConnectionFailed,
                    FailureCause::ExplicitClose,
                    "transport closed by the remote side",
                ))
                .await
            }
            TransportState::New | TransportState::Connecting => {}
        }
    }

    async fn on_ice_state(&self, state: IceConnectionState) {
        match state {
            IceConnectionState::Disconnected => {
                self.force_flush().await;
                self.on_failure(Failure::new(
                    FailureType::IceFailed,
                    FailureCause::IceDisconnected,
                    "ice disconnected",
                ))
                .await
            }
            IceConnectionState::Failed => {
                self.on_failure(Failure::new(
                    FailureType::IceFailed,
                    FailureCause::IceFailed,
                    "ice failed",
                ))
                .await
            }
            _ => {}
        }
    }

    async fn on_connected(&self) {
        let now = self.now();
        let connected = self.with_core(|core| match core.machine.state() {
            ConnectionState::IceExchange | ConnectionState::Reconnecting => core
                .machine
                .transition(ConnectionEvent::TransportConnected, now)
                .is_ok(),
            _ => false,
        });
        if !connected {
            return;
        }
        info!(session = %self.key, "Link established");
        if let Err(err) = self.coordinator.set_phase(ConnectionPhase::Connected).await {
            self.record_error(&err);
        }
    }

    // ------------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------------

    /// Route a failure to the recovery planner
    async fn on_failure(&self, failure: Failure) {
        if self.is_closed() {
            return;
        }
        let now = self.now();
        let decision = lock(&self.recovery).notify(failure.clone(), now);
        match decision {
            RecoveryDecision::Start(plan) => {
                self.with_core(|core| {
                    if !matches!(
                        core.machine.state(),
                        ConnectionState::IceExchange | ConnectionState::Connected
                    ) {
                        return;
                    }
                    let lost = ConnectionEvent::ConnectionLost {
                        reason: failure.detail.clone(),
                    };
                    if let Err(err) = core.machine.transition(lost, now) {
                        debug!(session = %self.key, error = %err, "Connection loss not recorded");
                    }
                });
                self.record_error(&TourlinkError::connection_failure(
                    failure.failure_type,
                    failure.detail.clone(),
                ));
                self.schedule_recovery(plan);
            }
            RecoveryDecision::Suppressed(reason) => {
                debug!(session = %self.key, ?reason, cause = ?failure.cause, "Failure folded into running recovery");
            }
            RecoveryDecision::Terminal(session) => {
                self.events
                    .publish(SessionEvent::RecoveryComplete(session));
                self.fail(&failure.detail).await;
            }
        }
    }

    fn schedule_recovery(&self, plan: RecoveryPlan) {
        let weak = self.weak_self.clone();
        let scheduled = self
            .scheduler
            .schedule_once(timers::RECOVERY, Duration::ZERO, async move {
                if let Some(session) = weak.upgrade() {
                    session.run_recovery_session(plan).await;
                }
            });
        if let Err(err) = scheduled {
            debug!(session = %self.key, error = %err, "Recovery not scheduled");
        }
    }

    async fn run_recovery_session(&self, plan: RecoveryPlan) {
        let finished = run_recovery(
            self,
            &self.recovery,
            self.clock.as_ref(),
            self.config.recovery.attempt_timeout,
            plan,
        )
        .await;
        let Some(session) = finished else {
            return;
        };

        match session.final_outcome {
            Some(FinalOutcome::Recovered) => {
                let reconnections = self.with_core(|core| {
                    core.reconnections += 1;
                    core.reconnections
                });
                info!(session = %self.key, reconnections, "Link recovered");
            }
            Some(FinalOutcome::Exhausted) => {
                self.events
                    .publish(SessionEvent::RecoveryComplete(session));
                self.fail("recovery attempts exhausted").await;
                return;
            }
            _ => {}
        }
        self.events
            .publish(SessionEvent::RecoveryComplete(session));
    }

    /// Enter `Failed` and stop periodic work
    async fn fail(&self, reason: &str) {
        let now = self.now();
        let failed = self.with_core(|core| {
            core.machine
                .transition(
                    ConnectionEvent::Fail {
                        reason: reason.to_string(),
                    },
                    now,
                )
                .is_ok()
        });
        if !failed {
            return;
        }
        error!(session = %self.key, reason, "Session failed");
        if let Err(err) = self.coordinator.set_phase(ConnectionPhase::Failed).await {
            self.record_error(&err);
        }
        // May cancel the calling timer; nothing below awaits
        for name in timers::PERIODIC {
            self.scheduler.cancel(name);
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Ordered teardown; idempotent
    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.scheduler.cancel_all();
        debug!(session = %self.key, cancelled, "Session timers cancelled");

        let now = self.now();
        let aborted = lock(&self.recovery).abort_all(now);
        for session in aborted {
            self.events
                .publish(SessionEvent::RecoveryComplete(session));
        }

        let teardown = self.config.signaling.teardown_write_timeout;
        if let Some(batch) = self.with_core(|core| core.batcher.close(now)) {
            let peer = self.peer_id();
            match timeout(
                teardown,
                self.coordinator.send_candidate_batch(&batch, peer.as_ref()),
            )
            .await
            {
                Ok(Ok(())) => debug!(session = %self.key, batch_id = batch.batch_id, "Final batch sent"),
                Ok(Err(err)) => warn!(session = %self.key, error = %err, "Final batch not sent"),
                Err(_) => warn!(session = %self.key, "Final batch timed out"),
            }
        }

        let left = self.coordinator.leave().await;

        self.with_core(|core| {
            if core.machine.state().is_terminal() {
                return;
            }
            if let Err(err) = core.machine.transition(ConnectionEvent::Close, now) {
                debug!(session = %self.key, error = %err, "Close transition rejected");
            }
        });

        if timeout(teardown, self.transport().close()).await.is_err() {
            warn!(session = %self.key, "Transport close timed out");
        }
        info!(session = %self.key, left, "Session closed");
        self.events.clear();
    }

    // ------------------------------------------------------------------------
    // Quality Control
    // ------------------------------------------------------------------------

    /// Operator override of the quality level
    pub fn set_quality_level(&self, level: QualityLevel) -> Vec<QualityChange> {
        let now = self.now();
        let changes = self.with_core(|core| core.degradation.set_level(level, now));
        for change in &changes {
            info!(session = %self.key, from = ?change.from, to = ?change.to, "Quality level set");
            self.events
                .publish(SessionEvent::QualityChanged(change.clone()));
        }
        changes
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub fn status(&self) -> SessionStatus {
        let now = self.now();
        let recovery = lock(&self.recovery).stats();
        let active_timers = self.scheduler.active_timers();
        let core = lock(&self.core);
        let latest = core.health.latest();
        SessionStatus {
            key: self.key.clone(),
            role: self.role,
            phase: core.machine.state().phase(),
            state: core.machine.state(),
            peer_id: core.peer_id.clone(),
            created_at: self.created_at,
            time_in_state_ms: core.machine.time_in_state(now).as_millis() as u64,
            ready_for_ice_exchange: core.machine.is_ready_for_ice_exchange(),
            pending_local_candidates: core.machine.pending_candidates(),
            ice_gathering_complete: core.machine.ice_gathering_complete(),
            quality_level: core.degradation.current_level(),
            quality_settings: core
                .degradation
                .current_strategy()
                .map(|strategy| strategy.settings.clone()),
            quality_score: latest.map(|sample| sample.quality_score),
            quality_grade: latest.map(|sample| sample.quality_grade),
            batching: core.batcher.stats(),
            recovery,
            messages_sent: self.coordinator.messages_sent(),
            messages_received: self.coordinator.messages_received(),
            reconnections: core.reconnections,
            health_report: core.health_report.clone(),
            peer_report: core.peer_report.clone(),
            last_error: core.errors.back().cloned(),
            active_timers,
        }
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        let now = self.now();
        let status = self.status();
        let recovery_history = lock(&self.recovery).history().cloned().collect();
        let core = lock(&self.core);
        SessionDiagnostics {
            status,
            report: core.health.generate_report(now),
            recovery_history,
            audit_trail: core.machine.audit_trail().cloned().collect(),
            errors: core.errors.iter().cloned().collect(),
        }
    }
}
