//! End-to-end session tests
//!
//! A guide and an attendee session share one orchestrator, an in-memory
//! coordination store and simulated transports. Time is paused, so every
//! poll interval, batch deadline and recovery cooldown runs deterministically.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};
use tourlink_core::{
    ConnectionState, FinalOutcome, IceCandidate, InMemoryStore, MessagePayload, MessageType,
    ParticipantId, QualityLevel, RecoveryStrategy, Role, SdpKind, SequencedCandidate,
    SessionDescription, SessionKey, SessionPhase, TourlinkConfig, TourlinkError,
};
use tourlink_runtime::{
    LinkConditions, SessionEvent, SessionOrchestrator, SignalingCoordinator, SimulatedTransport,
    SimulatedTransportFactory, TokioTimeSource,
};

const WAIT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

struct Tour {
    orchestrator: SessionOrchestrator,
    store: Arc<InMemoryStore>,
    factory: Arc<SimulatedTransportFactory>,
    guide: SessionKey,
    attendee: SessionKey,
}

impl Tour {
    fn new() -> Self {
        let factory = Arc::new(SimulatedTransportFactory::new());
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = SessionOrchestrator::builder(store.clone(), factory.clone())
            .with_config(TourlinkConfig::testing())
            .build()
            .unwrap();
        Self {
            orchestrator,
            store,
            factory,
            guide: key("guide-1"),
            attendee: key("att-1"),
        }
    }

    /// Both sessions created; the attendee first so the guide sees it on start
    async fn started() -> Self {
        let tour = Self::new();
        tour.orchestrator
            .create_session(tour.attendee.clone(), Role::Attendee)
            .await
            .unwrap();
        tour.orchestrator
            .create_session(tour.guide.clone(), Role::Guide)
            .await
            .unwrap();
        tour
    }

    async fn connected() -> Self {
        let tour = Self::started().await;
        assert!(tour
            .orchestrator
            .start_negotiation(&tour.guide, Duration::from_secs(1))
            .await
            .unwrap());
        tour.wait_for_state(&tour.guide, ConnectionState::Connected).await;
        tour.wait_for_state(&tour.attendee, ConnectionState::Connected)
            .await;
        tour
    }

    fn state(&self, key: &SessionKey) -> ConnectionState {
        self.orchestrator.get_status(key).unwrap().state
    }

    fn transport(&self, key: &SessionKey) -> Arc<SimulatedTransport> {
        self.factory.transport(key).unwrap()
    }

    async fn wait_for_state(&self, key: &SessionKey, state: ConnectionState) {
        eventually(&format!("{key} to reach {state}"), || self.state(key) == state).await;
    }

    /// Coordinator speaking for a participant without a session of its own
    fn bare_coordinator(&self, key: &SessionKey, role: Role) -> SignalingCoordinator {
        SignalingCoordinator::new(
            self.store.clone(),
            key.channel(),
            role,
            key.participant_id.clone(),
            self.orchestrator.config().signaling.clone(),
            Arc::new(TokioTimeSource::new()),
        )
    }

    fn reconnections(&self, key: &SessionKey) -> u32 {
        self.orchestrator.get_status(key).unwrap().reconnections
    }

    /// Drop the link so that the restart and the rebuild both fail,
    /// leaving a full re-signal as the only way back
    fn force_full_resignal(&self, key: &SessionKey) {
        let transport = self.transport(key);
        transport.fail_next_restarts(1);
        self.factory.fail_creations(1);
        transport.inject_ice_disconnect();
    }
}

fn key(participant: &str) -> SessionKey {
    SessionKey::new("tour-42", "en", ParticipantId::new(participant).unwrap()).unwrap()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let polled = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Receive events until one matches
async fn next_matching(
    events: &mut UnboundedReceiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive")
}

// ----------------------------------------------------------------------------
// Establishment
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_guide_and_attendee_connect() {
    let tour = Tour::connected().await;

    let guide = tour.orchestrator.get_status(&tour.guide).unwrap();
    assert_eq!(guide.phase, SessionPhase::Connected);
    assert_eq!(guide.peer_id, Some(tour.attendee.participant_id.clone()));

    let attendee = tour.orchestrator.get_status(&tour.attendee).unwrap();
    assert_eq!(attendee.phase, SessionPhase::Connected);
    assert_eq!(attendee.peer_id, Some(tour.guide.participant_id.clone()));
    assert!(tour.transport(&tour.attendee).remote_candidate_count() > 0);

    // Both sides get their batches acknowledged by the other
    eventually("guide batch acks", || {
        tour.orchestrator
            .get_status(&tour.guide)
            .unwrap()
            .batching
            .acks_received
            > 0
    })
    .await;
    eventually("attendee batch acks", || {
        tour.orchestrator
            .get_status(&tour.attendee)
            .unwrap()
            .batching
            .acks_received
            > 0
    })
    .await;

    tour.orchestrator.shutdown().await;
    assert_eq!(tour.orchestrator.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_candidates_held_until_both_descriptions() {
    let tour = Tour::started().await;
    let (_, mut events) = tour.orchestrator.subscribe(&tour.guide).unwrap();

    tour.orchestrator
        .start_negotiation(&tour.guide, Duration::from_secs(1))
        .await
        .unwrap();

    let mut reached_ice_exchange = false;
    loop {
        let event = next_matching(&mut events, |_| true).await;
        match event {
            SessionEvent::StateChanged(change) if change.to == ConnectionState::IceExchange => {
                reached_ice_exchange = true;
            }
            SessionEvent::CandidatesReleased { count } => {
                assert!(reached_ice_exchange, "candidates released before the answer");
                assert!(count > 0);
            }
            SessionEvent::BatchSent { .. } => {
                assert!(reached_ice_exchange, "batch sent before the answer");
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_deferred_without_attendee() {
    let tour = Tour::new();
    tour.orchestrator
        .create_session(tour.guide.clone(), Role::Guide)
        .await
        .unwrap();

    let started = tour
        .orchestrator
        .start_negotiation(&tour.guide, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(!started);
    assert_eq!(tour.state(&tour.guide), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_attendee_cannot_negotiate() {
    let tour = Tour::started().await;

    let err = tour
        .orchestrator
        .start_negotiation(&tour.attendee, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, TourlinkError::RoleMismatch { expected: Role::Guide }));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_session_rejected() {
    let tour = Tour::started().await;

    let err = assert_err!(
        tour.orchestrator
            .create_session(tour.guide.clone(), Role::Guide)
            .await
    );
    assert!(matches!(err, TourlinkError::SessionExists { .. }));
    assert_eq!(tour.orchestrator.session_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transport_creation_failure_leaves_no_session() {
    let tour = Tour::new();
    tour.factory.fail_creations(1);

    let err = tour
        .orchestrator
        .create_session(tour.guide.clone(), Role::Guide)
        .await
        .unwrap_err();
    assert!(matches!(err, TourlinkError::Transport(_)));
    assert_eq!(tour.orchestrator.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_early_single_candidate_applied_with_answer() {
    let tour = Tour::new();
    tour.orchestrator
        .create_session(tour.guide.clone(), Role::Guide)
        .await
        .unwrap();
    let attendee = tour.bare_coordinator(&tour.attendee, Role::Attendee);
    attendee.initialize_coordination().await.unwrap();
    attendee.signal_ready().await.unwrap();
    assert!(tour
        .orchestrator
        .start_negotiation(&tour.guide, Duration::from_secs(1))
        .await
        .unwrap());

    let guide = tour.guide.participant_id.clone();
    let early = SequencedCandidate {
        sequence_number: 0,
        candidate: IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.7 50007 typ host"),
    };
    attendee
        .send_message(
            MessageType::IceCandidate,
            MessagePayload::Candidate(early),
            Some(&guide),
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    let transport = tour.transport(&tour.guide);
    assert!(!transport.has_remote_description());
    assert_eq!(transport.remote_candidate_count(), 0);

    let answer = SessionDescription::new(SdpKind::Answer, "v=0\r\ns=-\r\nm=audio 9 RTP/AVP 111\r\n");
    attendee
        .send_message(
            MessageType::Answer,
            MessagePayload::Description(answer),
            Some(&guide),
        )
        .await
        .unwrap();

    eventually("deferred candidate applied", || {
        transport.remote_candidate_count() == 1
    })
    .await;
    tour.wait_for_state(&tour.guide, ConnectionState::Connected)
        .await;
}

// ----------------------------------------------------------------------------
// Recovery
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_ice_disconnect_recovered_by_restart() {
    let tour = Tour::connected().await;
    let transport = tour.transport(&tour.attendee);

    transport.inject_ice_disconnect();

    eventually("attendee reconnection", || {
        tour.orchestrator
            .get_status(&tour.attendee)
            .unwrap()
            .reconnections
            == 1
    })
    .await;
    let status = tour.orchestrator.get_status(&tour.attendee).unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.recovery.recovered, 1);
    assert_eq!(transport.restarts(), 1);
    // The guide's link never dropped
    assert_eq!(tour.state(&tour.guide), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_restart_escalates_to_rebuild() {
    let tour = Tour::connected().await;
    let original = tour.transport(&tour.attendee);
    original.fail_next_restarts(1);

    original.inject_ice_disconnect();

    eventually("attendee reconnection", || {
        tour.orchestrator
            .get_status(&tour.attendee)
            .unwrap()
            .reconnections
            == 1
    })
    .await;
    assert!(original.is_closed());
    assert_eq!(tour.factory.created_count(), 3);

    let rebuilt = tour.transport(&tour.attendee);
    assert!(!rebuilt.is_closed());
    assert!(rebuilt.has_remote_description());

    let diagnostics = tour
        .orchestrator
        .generate_diagnostic_report(&tour.attendee)
        .unwrap();
    let session = diagnostics.recovery_history.last().unwrap();
    assert_eq!(session.attempts.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_guide_full_resignal_reconnects() {
    let tour = Tour::connected().await;

    tour.force_full_resignal(&tour.guide);

    eventually("guide reconnection", || tour.reconnections(&tour.guide) == 1).await;
    tour.wait_for_state(&tour.attendee, ConnectionState::Connected)
        .await;

    let diagnostics = tour
        .orchestrator
        .generate_diagnostic_report(&tour.guide)
        .unwrap();
    let session = diagnostics.recovery_history.last().unwrap();
    let strategies: Vec<RecoveryStrategy> =
        session.attempts.iter().map(|attempt| attempt.strategy).collect();
    assert_eq!(
        strategies,
        vec![
            RecoveryStrategy::IceRestart,
            RecoveryStrategy::RebuildTransport,
            RecoveryStrategy::FullResignal,
        ]
    );
    assert_eq!(session.final_outcome, Some(FinalOutcome::Recovered));
    assert_eq!(diagnostics.status.state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_rejoined_attendee_candidates_reach_guide() {
    let tour = Tour::connected().await;

    // The attendee leaves and comes back; its candidate numbering starts over
    tour.orchestrator.destroy(&tour.attendee).await.unwrap();
    tour.orchestrator
        .create_session(tour.attendee.clone(), Role::Attendee)
        .await
        .unwrap();

    tour.force_full_resignal(&tour.guide);

    eventually("guide reconnection", || tour.reconnections(&tour.guide) == 1).await;
    tour.wait_for_state(&tour.attendee, ConnectionState::Connected)
        .await;

    let flushed = || {
        tour.orchestrator
            .get_status(&tour.attendee)
            .unwrap()
            .batching
            .candidates_flushed
    };
    eventually("every rejoined candidate applied by the guide", || {
        let guide_transport = tour.transport(&tour.guide);
        flushed() > 0 && guide_transport.remote_candidate_count() as u64 == flushed()
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_fails_session() {
    let tour = Tour::connected().await;
    let (_, mut events) = tour.orchestrator.subscribe(&tour.attendee).unwrap();

    tour.transport(&tour.attendee).inject_remote_close();

    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::RecoveryComplete(_))
    })
    .await;
    tour.wait_for_state(&tour.attendee, ConnectionState::Failed)
        .await;

    let diagnostics = tour
        .orchestrator
        .generate_diagnostic_report(&tour.attendee)
        .unwrap();
    assert_eq!(diagnostics.status.phase, SessionPhase::Failed);
    assert_eq!(diagnostics.status.recovery.terminal, 1);
    assert_eq!(diagnostics.audit_trail.last().unwrap().to_state, "Failed");
    // Periodic timers stop with the failure
    let timers = &diagnostics.status.active_timers;
    assert!(!timers.iter().any(|name| name == "heartbeat" || name == "inbound-poll"));
}

// ----------------------------------------------------------------------------
// Quality
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_emergency_fallback_restores_at_low() {
    let tour = Tour::connected().await;
    let (_, mut events) = tour.orchestrator.subscribe(&tour.attendee).unwrap();

    let restored = tour
        .orchestrator
        .execute_emergency_fallback(&tour.attendee)
        .await
        .unwrap();

    assert!(restored);
    let event = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::EmergencyFallbackComplete { .. })
    })
    .await;
    match event {
        SessionEvent::EmergencyFallbackComplete { success, level } => {
            assert!(success);
            assert_eq!(level, QualityLevel::Low);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_critical_link_falls_back_to_floor() {
    let tour = Tour::connected().await;
    let (_, mut events) = tour.orchestrator.subscribe(&tour.attendee).unwrap();

    tour.transport(&tour.attendee)
        .set_conditions(LinkConditions::critical());

    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::HealthAlert(_))
    })
    .await;
    let event = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::EmergencyFallbackComplete { .. })
    })
    .await;
    match event {
        SessionEvent::EmergencyFallbackComplete { success, level } => {
            assert!(!success);
            assert_eq!(level, QualityLevel::Minimum);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let status = tour.orchestrator.get_status(&tour.attendee).unwrap();
    assert!(matches!(
        status.last_error.map(|record| record.kind),
        Some(tourlink_core::ErrorKind::QualityCritical)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_manual_quality_override() {
    let tour = Tour::connected().await;

    let changes = tour
        .orchestrator
        .set_quality_level(&tour.guide, QualityLevel::Minimum)
        .unwrap();

    assert!(!changes.is_empty());
    assert_eq!(changes.last().unwrap().to, QualityLevel::Minimum);
    let status = tour.orchestrator.get_status(&tour.guide).unwrap();
    assert_eq!(status.quality_level, QualityLevel::Minimum);
    assert!(status.quality_settings.is_some());
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_destroy_leaves_channel_and_closes_transport() {
    let tour = Tour::connected().await;
    let transport = tour.transport(&tour.attendee);

    assert_ok!(tour.orchestrator.destroy(&tour.attendee).await);

    assert!(transport.is_closed());
    assert!(matches!(
        tour.orchestrator.get_status(&tour.attendee),
        Err(TourlinkError::SessionNotFound { .. })
    ));
    assert!(matches!(
        tour.orchestrator.destroy(&tour.attendee).await,
        Err(TourlinkError::SessionNotFound { .. })
    ));

    let guide = tour.orchestrator.session(&tour.guide).unwrap();
    let state = guide
        .coordinator()
        .get_coordination_state()
        .await
        .unwrap()
        .unwrap();
    assert!(!state.attendee_ready);
    assert_eq!(tour.orchestrator.session_keys(), vec![tour.guide.clone()]);
}
