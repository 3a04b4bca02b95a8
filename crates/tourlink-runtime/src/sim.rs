//! Simulated Transport
//!
//! An in-process [`RealtimeTransport`] with scriptable link conditions and
//! failure injection. It produces offers and answers, gathers a few local
//! candidates after the local description is applied, and reports a
//! connected link once both descriptions and at least one remote candidate
//! are in place. Used by the integration tests and the `tourlink` binary.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tourlink_core::{
    IceCandidate, IceConnectionState, RealtimeTransport, SdpKind, SessionDescription, SessionKey,
    TransportError, TransportEvent, TransportFactory, TransportState, TransportStats,
};
use tracing::{debug, trace};

/// Candidate types gathered in order, best first
const CANDIDATE_TYPES: [(&str, u32); 3] = [
    ("host", 2_122_260_223),
    ("srflx", 1_686_052_607),
    ("relay", 41_885_439),
];

/// Packets accounted per statistics snapshot
const PACKETS_PER_SNAPSHOT: u64 = 250;

// ----------------------------------------------------------------------------
// Link Conditions
// ----------------------------------------------------------------------------

/// Network and audio conditions reported in statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkConditions {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Fraction of packets lost in [0, 1)
    pub loss_rate: f64,
    pub audio_level: f64,
    pub bitrate_kbps: u32,
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self {
            rtt_ms: 40.0,
            jitter_ms: 5.0,
            loss_rate: 0.0,
            audio_level: 0.3,
            bitrate_kbps: 64,
        }
    }
}

impl LinkConditions {
    /// Conditions bad enough to score as critical
    pub fn critical() -> Self {
        Self {
            rtt_ms: 800.0,
            jitter_ms: 120.0,
            loss_rate: 0.12,
            audio_level: 0.0,
            bitrate_kbps: 8,
        }
    }
}

// ----------------------------------------------------------------------------
// Simulated Transport
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SimState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    connection: TransportState,
    ice: IceConnectionState,
    track_announced: bool,
    failing_restarts: u32,
    restarts: u32,
    offers_created: u32,
    packets_received: u64,
    packets_lost: u64,
    bytes_received: u64,
    conditions: LinkConditions,
    closed: bool,
}

/// Scriptable in-process transport
#[derive(Debug)]
pub struct SimulatedTransport {
    label: String,
    language: String,
    candidate_count: usize,
    gather_interval: Duration,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedTransport {
    pub fn new(key: &SessionKey, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            label: key.to_string(),
            language: key.language.clone(),
            candidate_count: CANDIDATE_TYPES.len(),
            gather_interval: Duration::from_millis(10),
            events,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn with_conditions(self, conditions: LinkConditions) -> Self {
        lock(&self.state).conditions = conditions;
        self
    }

    fn emit(&self, event: TransportEvent) {
        if let Err(err) = self.events.try_send(event) {
            trace!(transport = %self.label, error = %err, "Transport event not delivered");
        }
    }

    /// Lock the state of a transport that has not been closed
    fn open_state(&self) -> Result<MutexGuard<'_, SimState>, TransportError> {
        let state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(state)
    }

    /// Report a connected link once both descriptions and a remote candidate are in
    fn maybe_connect(&self) {
        let announce_track = {
            let mut state = lock(&self.state);
            let ready = state.local.is_some()
                && state.remote.is_some()
                && !state.remote_candidates.is_empty();
            if state.closed || !ready || state.connection == TransportState::Connected {
                return;
            }
            state.connection = TransportState::Connected;
            state.ice = IceConnectionState::Connected;
            !std::mem::replace(&mut state.track_announced, true)
        };

        debug!(transport = %self.label, "Simulated link connected");
        self.emit(TransportEvent::IceStateChanged(IceConnectionState::Connected));
        self.emit(TransportEvent::ConnectionStateChanged(TransportState::Connected));
        if announce_track {
            self.emit(TransportEvent::TrackAdded {
                track_id: format!("audio-{}", self.language),
            });
        }
    }

    fn spawn_gathering(&self) {
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let count = self.candidate_count;
        let interval = self.gather_interval;
        tokio::spawn(async move {
            for (n, (kind, priority)) in CANDIDATE_TYPES.iter().cycle().take(count).enumerate() {
                sleep(interval).await;
                if lock(&state).closed {
                    return;
                }
                let line = format!(
                    "candidate:{n} 1 udp {} 192.0.2.{} {} typ {kind}",
                    priority - n as u32,
                    10 + n,
                    50_000 + n
                );
                if events
                    .send(TransportEvent::LocalCandidate(IceCandidate::new(line)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = events.send(TransportEvent::IceGatheringComplete).await;
        });
    }

    /// A replaced description invalidates the established link
    fn reset_link(state: &mut SimState) {
        state.remote_candidates.clear();
        if state.connection == TransportState::Connected {
            state.connection = TransportState::Connecting;
            state.ice = IceConnectionState::Checking;
        }
    }

    // ------------------------------------------------------------------------
    // Failure Injection
    // ------------------------------------------------------------------------

    /// Drop ICE connectivity; a successful restart brings it back
    pub fn inject_ice_disconnect(&self) {
        {
            let mut state = lock(&self.state);
            state.ice = IceConnectionState::Disconnected;
            state.connection = TransportState::Disconnected;
        }
        self.emit(TransportEvent::ConnectionStateChanged(TransportState::Disconnected));
        self.emit(TransportEvent::IceStateChanged(IceConnectionState::Disconnected));
    }

    pub fn inject_ice_failure(&self) {
        lock(&self.state).ice = IceConnectionState::Failed;
        self.emit(TransportEvent::IceStateChanged(IceConnectionState::Failed));
    }

    pub fn inject_transport_failure(&self) {
        lock(&self.state).connection = TransportState::Failed;
        self.emit(TransportEvent::ConnectionStateChanged(TransportState::Failed));
    }

    /// The remote side hung up
    pub fn inject_remote_close(&self) {
        {
            let mut state = lock(&self.state);
            state.connection = TransportState::Closed;
            state.ice = IceConnectionState::Closed;
        }
        self.emit(TransportEvent::ConnectionStateChanged(TransportState::Closed));
    }

    /// The next `count` ICE restarts never reconnect
    pub fn fail_next_restarts(&self, count: u32) {
        lock(&self.state).failing_restarts = count;
    }

    pub fn set_conditions(&self, conditions: LinkConditions) {
        lock(&self.state).conditions = conditions;
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn connection_state(&self) -> TransportState {
        lock(&self.state).connection
    }

    pub fn restarts(&self) -> u32 {
        lock(&self.state).restarts
    }

    pub fn remote_candidate_count(&self) -> usize {
        lock(&self.state).remote_candidates.len()
    }

    pub fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }
}

#[async_trait]
impl RealtimeTransport for SimulatedTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.open_state()?;
        state.offers_created += 1;
        Ok(SessionDescription::new(
            SdpKind::Offer,
            format!(
                "v=0\r\no=tourlink {} {} IN IP4 0.0.0.0\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=sendonly\r\n",
                state.offers_created, state.restarts
            ),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.open_state()?;
        match &state.remote {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(SessionDescription::new(
                SdpKind::Answer,
                "v=0\r\no=tourlink 1 1 IN IP4 0.0.0.0\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=recvonly\r\n",
            )),
            _ => Err(TransportError::OperationFailed {
                operation: "create_answer".into(),
                reason: "no remote offer applied".into(),
            }),
        }
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        {
            let mut state = self.open_state()?;
            if state.local.replace(desc.clone()).is_some() {
                Self::reset_link(&mut state);
            }
        }
        self.spawn_gathering();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.open_state()?;
            if state.remote.replace(desc.clone()).is_some() {
                Self::reset_link(&mut state);
            }
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        {
            let mut state = self.open_state()?;
            if state.remote.is_none() {
                return Err(TransportError::OperationFailed {
                    operation: "add_ice_candidate".into(),
                    reason: "no remote description".into(),
                });
            }
            candidate
                .validate()
                .map_err(|e| TransportError::CandidateRejected {
                    reason: e.to_string(),
                })?;
            state.remote_candidates.push(candidate.clone());
        }
        self.maybe_connect();
        Ok(())
    }

    async fn get_stats(&self) -> Result<TransportStats, TransportError> {
        let mut state = self.open_state()?;
        let conditions = state.conditions;
        let loss = conditions.loss_rate.clamp(0.0, 0.99);
        let lost = (PACKETS_PER_SNAPSHOT as f64 * loss / (1.0 - loss)).round() as u64;
        state.packets_received += PACKETS_PER_SNAPSHOT;
        state.packets_lost += lost;
        // Five seconds of audio at the configured bitrate
        state.bytes_received += conditions.bitrate_kbps as u64 * 125 * 5;

        Ok(TransportStats {
            rtt_ms: conditions.rtt_ms,
            jitter_ms: conditions.jitter_ms,
            packets_lost: state.packets_lost,
            packets_received: state.packets_received,
            bytes_received: state.bytes_received,
            audio_level: conditions.audio_level,
            connection_state: state.connection,
            ice_state: state.ice,
            selected_candidate_type: Some("host".to_string()),
        })
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        let reconnect = {
            let mut state = self.open_state()?;
            state.restarts += 1;
            state.ice = IceConnectionState::Checking;
            if state.failing_restarts > 0 {
                state.failing_restarts -= 1;
                false
            } else {
                state.ice = IceConnectionState::Connected;
                state.connection = TransportState::Connected;
                true
            }
        };

        debug!(transport = %self.label, reconnect, "ICE restart");
        if reconnect {
            self.emit(TransportEvent::IceStateChanged(IceConnectionState::Connected));
            self.emit(TransportEvent::ConnectionStateChanged(TransportState::Connected));
        } else {
            self.emit(TransportEvent::IceStateChanged(IceConnectionState::Checking));
        }
        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.connection = TransportState::Closed;
            state.ice = IceConnectionState::Closed;
        }
        self.emit(TransportEvent::ConnectionStateChanged(TransportState::Closed));
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

/// Builds [`SimulatedTransport`]s and keeps the latest one per session
#[derive(Debug, Default)]
pub struct SimulatedTransportFactory {
    transports: DashMap<SessionKey, Arc<SimulatedTransport>>,
    conditions: Mutex<LinkConditions>,
    created: AtomicUsize,
    failing_creations: AtomicU32,
}

impl SimulatedTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conditions applied to transports created from now on
    pub fn with_conditions(self, conditions: LinkConditions) -> Self {
        *self
            .conditions
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = conditions;
        self
    }

    /// Most recent transport created for `key`
    pub fn transport(&self, key: &SessionKey) -> Option<Arc<SimulatedTransport>> {
        self.transports.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Fail the next `count` creations
    pub fn fail_creations(&self, count: u32) {
        self.failing_creations.store(count, Ordering::SeqCst);
    }
}

impl TransportFactory for SimulatedTransportFactory {
    fn create(
        &self,
        key: &SessionKey,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn RealtimeTransport>, TransportError> {
        let failing = self
            .failing_creations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::OperationFailed {
                operation: "create".into(),
                reason: "injected creation failure".into(),
            });
        }

        let conditions = *self
            .conditions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let transport = Arc::new(SimulatedTransport::new(key, events).with_conditions(conditions));
        self.transports.insert(key.clone(), Arc::clone(&transport));
        self.created.fetch_add(1, Ordering::SeqCst);
        trace!(session = %key, "Simulated transport created");
        Ok(transport)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tourlink_core::ParticipantId;

    fn key() -> SessionKey {
        SessionKey::new("tour-1", "en", ParticipantId::new("g").unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathers_then_connects() {
        let (tx, mut rx) = mpsc::channel(32);
        let transport = SimulatedTransport::new(&key(), tx);

        let offer = transport.create_offer().await.unwrap();
        transport.set_local_description(&offer).await.unwrap();
        let mut candidates = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::LocalCandidate(c) => candidates.push(c),
                TransportEvent::IceGatheringComplete => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].priority() > candidates[2].priority());

        let answer = SessionDescription::new(SdpKind::Answer, "v=0");
        transport.set_remote_description(&answer).await.unwrap();
        assert_eq!(transport.connection_state(), TransportState::New);

        transport.add_ice_candidate(&candidates[0]).await.unwrap();
        assert_eq!(transport.connection_state(), TransportState::Connected);
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::IceStateChanged(IceConnectionState::Connected))
        );
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = SimulatedTransport::new(&key(), tx);
        assert!(transport.create_answer().await.is_err());

        let offer = SessionDescription::new(SdpKind::Offer, "v=0");
        transport.set_remote_description(&offer).await.unwrap();
        let answer = transport.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
    }

    #[tokio::test]
    async fn test_stats_follow_conditions() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = SimulatedTransport::new(&key(), tx).with_conditions(LinkConditions {
            loss_rate: 0.2,
            ..LinkConditions::default()
        });

        let first = transport.get_stats().await.unwrap();
        let second = transport.get_stats().await.unwrap();
        assert_eq!(second.packets_received, 2 * first.packets_received);
        let loss = first.packets_lost as f64 / (first.packets_lost + first.packets_received) as f64;
        assert!((loss - 0.2).abs() < 0.01);

        transport.close().await;
        assert!(matches!(transport.get_stats().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_operations() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = SimulatedTransport::new(&key(), tx);
        let offer = SessionDescription::new(SdpKind::Offer, "v=0");

        transport.close().await;

        assert!(matches!(transport.create_offer().await, Err(TransportError::Closed)));
        assert!(matches!(
            transport.set_remote_description(&offer).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(transport.restart_ice().await, Err(TransportError::Closed)));
        assert_eq!(transport.restarts(), 0);
    }

    #[tokio::test]
    async fn test_failing_restart_stays_down() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = SimulatedTransport::new(&key(), tx);
        transport.fail_next_restarts(1);

        transport.inject_ice_disconnect();
        transport.restart_ice().await.unwrap();
        assert_eq!(transport.connection_state(), TransportState::Disconnected);
        transport.restart_ice().await.unwrap();
        assert_eq!(transport.connection_state(), TransportState::Connected);
        assert_eq!(transport.restarts(), 2);
    }

    #[test]
    fn test_factory_injected_failure() {
        let factory = SimulatedTransportFactory::new();
        factory.fail_creations(1);
        let (tx, _rx) = mpsc::channel(8);
        assert!(factory.create(&key(), tx.clone()).is_err());
        assert!(factory.create(&key(), tx).is_ok());
        assert_eq!(factory.created_count(), 1);
        assert!(factory.transport(&key()).is_some());
    }
}
