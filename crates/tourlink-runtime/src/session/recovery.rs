//! Recovery strategies as applied to a live session

use async_trait::async_trait;
use std::sync::{Arc, PoisonError};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tourlink_core::{
    ConnectionPhase, ConnectionState, MessagePayload, MessageType, RealtimeTransport, RecoveryPlan,
    RecoveryStrategy, Role, TourlinkResult,
};
use tracing::{debug, info, warn};

use super::Session;
use crate::events::SessionEvent;
use crate::recovery::RecoveryExecutor;

impl Session {
    /// Swap in a fresh transport and pump; returns the old one, still open
    fn replace_transport(&self) -> TourlinkResult<Arc<dyn RealtimeTransport>> {
        let (event_tx, event_rx) = mpsc::channel(self.config.channels.transport_event_buffer_size);
        let fresh = self.factory.create(&self.key, event_tx)?;
        let old = std::mem::replace(
            &mut *self
                .transport
                .write()
                .unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        // Re-arming the pump aborts the old one, so the old transport's
        // closing events are never seen
        self.spawn_transport_pump(event_rx)?;
        Ok(old)
    }

    async fn close_replaced(&self, old: Arc<dyn RealtimeTransport>) {
        if timeout(self.config.signaling.teardown_write_timeout, old.close())
            .await
            .is_err()
        {
            warn!(session = %self.key, "Replaced transport did not close in time");
        }
    }

    /// New transport carrying the current descriptions and remote candidates
    async fn rebuild_transport(&self) -> TourlinkResult<()> {
        let old = self.replace_transport()?;
        self.close_replaced(old).await;

        let (remote, local, applied) = self.with_core(|core| {
            (
                core.remote_description.clone(),
                core.local_description.clone(),
                core.applied_remote.clone(),
            )
        });
        let transport = self.transport();
        if let Some(remote) = &remote {
            transport.set_remote_description(remote).await?;
        }
        if let Some(local) = &local {
            transport.set_local_description(local).await?;
        }
        for candidate in &applied {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                debug!(session = %self.key, error = %err, "Candidate not replayed");
            }
        }
        info!(session = %self.key, replayed = applied.len(), "Transport rebuilt");
        Ok(())
    }

    /// New transport and a fresh offer/answer handshake
    ///
    /// The guide offers again; the attendee asks the guide to do so with a
    /// state sync.
    async fn full_resignal(&self) -> TourlinkResult<()> {
        let now = self.now();
        self.with_core(|core| core.reset_for_handshake("full resignal", now))?;
        let old = self.replace_transport()?;
        self.close_replaced(old).await;
        let state = self.coordinator.set_phase(ConnectionPhase::Initial).await?;

        match self.role {
            Role::Guide => self.negotiate().await,
            Role::Attendee => {
                let peer = self.peer_id();
                self.coordinator
                    .send_message(
                        MessageType::StateSync,
                        MessagePayload::StateSync(state),
                        peer.as_ref(),
                    )
                    .await?;
                info!(session = %self.key, "Requested a fresh offer from the guide");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RecoveryExecutor for Session {
    async fn execute(&self, strategy: RecoveryStrategy) -> TourlinkResult<()> {
        match strategy {
            RecoveryStrategy::IceRestart => {
                self.transport().restart_ice().await?;
                Ok(())
            }
            RecoveryStrategy::RebuildTransport => self.rebuild_transport().await,
            RecoveryStrategy::FullResignal => self.full_resignal().await,
        }
    }

    async fn wait_for_link(&self) {
        let mut watch = self.state_watch.subscribe();
        let connected = watch
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .is_ok();
        if !connected {
            futures::future::pending::<()>().await;
        }
    }

    fn is_link_up(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn attempt_started(&self, plan: &RecoveryPlan) {
        self.events
            .publish(SessionEvent::RecoveryAttemptStarted(*plan));
    }

    fn is_available(&self) -> bool {
        !self.is_closed() && !self.state().is_terminal()
    }
}
