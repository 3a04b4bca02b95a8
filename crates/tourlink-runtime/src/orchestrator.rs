//! Session Orchestrator
//!
//! Owns the registry of live sessions, keyed by (tour, language,
//! participant), and is the only entry point consumers use:
//! - session creation and ordered teardown
//! - description handoff and negotiation start
//! - quality overrides and the emergency fallback
//! - status, diagnostics and event subscriptions

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tourlink_core::{
    CoordinationStore, QualityChange, QualityLevel, Role, SessionDescription, SessionKey,
    SubscriptionId, TimeSource, TourlinkConfig, TourlinkError, TourlinkResult, TransportFactory,
};
use tracing::{info, warn};

use crate::clock::TokioTimeSource;
use crate::events::SessionEvent;
use crate::session::{Session, SessionDiagnostics, SessionStatus};

// ----------------------------------------------------------------------------
// Orchestrator Builder
// ----------------------------------------------------------------------------

/// Builder for a [`SessionOrchestrator`]
pub struct OrchestratorBuilder {
    store: Arc<dyn CoordinationStore>,
    factory: Arc<dyn TransportFactory>,
    config: TourlinkConfig,
    clock: Option<Arc<dyn TimeSource>>,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<dyn CoordinationStore>, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            store,
            factory,
            config: TourlinkConfig::default(),
            clock: None,
        }
    }

    pub fn with_config(mut self, config: TourlinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the clock; defaults to one following `tokio::time`
    pub fn with_time_source(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and build the orchestrator
    pub fn build(self) -> TourlinkResult<SessionOrchestrator> {
        self.config.validate()?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(TokioTimeSource::new()));
        Ok(SessionOrchestrator {
            store: self.store,
            factory: self.factory,
            config: Arc::new(self.config),
            clock,
            sessions: DashMap::new(),
        })
    }
}

// ----------------------------------------------------------------------------
// Session Orchestrator
// ----------------------------------------------------------------------------

/// Registry and façade over every live session
pub struct SessionOrchestrator {
    store: Arc<dyn CoordinationStore>,
    factory: Arc<dyn TransportFactory>,
    config: Arc<TourlinkConfig>,
    clock: Arc<dyn TimeSource>,
    sessions: DashMap<SessionKey, Arc<Session>>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl SessionOrchestrator {
    pub fn builder(
        store: Arc<dyn CoordinationStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, factory)
    }

    pub fn config(&self) -> &TourlinkConfig {
        &self.config
    }

    /// Handle to a registered session
    pub fn session(&self, key: &SessionKey) -> TourlinkResult<Arc<Session>> {
        self.sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TourlinkError::SessionNotFound {
                key: key.to_string(),
            })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create, register and start a session
    pub async fn create_session(&self, key: SessionKey, role: Role) -> TourlinkResult<SessionStatus> {
        let session = match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(TourlinkError::SessionExists {
                    key: key.to_string(),
                })
            }
            Entry::Vacant(vacant) => {
                let session = Session::new(
                    key.clone(),
                    role,
                    Arc::clone(&self.config),
                    Arc::clone(&self.store),
                    Arc::clone(&self.factory),
                    Arc::clone(&self.clock),
                )?;
                vacant.insert(Arc::clone(&session));
                session
            }
        };

        if let Err(err) = session.start().await {
            warn!(session = %key, error = %err, "Session failed to start");
            self.sessions.remove(&key);
            session.shutdown().await;
            return Err(err);
        }
        info!(session = %key, %role, "Session created");
        Ok(session.status())
    }

    /// Guide only: wait for the attendee, then send the offer
    ///
    /// Returns false when the attendee did not become ready in time.
    pub async fn start_negotiation(
        &self,
        key: &SessionKey,
        peer_timeout: Duration,
    ) -> TourlinkResult<bool> {
        self.session(key)?.start_negotiation(peer_timeout).await
    }

    pub async fn set_local_description(
        &self,
        key: &SessionKey,
        description: SessionDescription,
    ) -> TourlinkResult<()> {
        self.session(key)?.set_local_description(description).await
    }

    pub async fn set_remote_description(
        &self,
        key: &SessionKey,
        description: SessionDescription,
    ) -> TourlinkResult<()> {
        self.session(key)?.set_remote_description(description).await
    }

    /// Remove and tear down a session
    pub async fn destroy(&self, key: &SessionKey) -> TourlinkResult<()> {
        let (_, session) = self
            .sessions
            .remove(key)
            .ok_or_else(|| TourlinkError::SessionNotFound {
                key: key.to_string(),
            })?;
        session.shutdown().await;
        info!(session = %key, "Session destroyed");
        Ok(())
    }

    /// Tear down every session
    pub async fn shutdown(&self) {
        let keys = self.session_keys();
        let sessions: Vec<Arc<Session>> = keys
            .iter()
            .filter_map(|key| self.sessions.remove(key).map(|(_, session)| session))
            .collect();
        info!(count = sessions.len(), "Shutting down sessions");
        futures::future::join_all(sessions.iter().map(|session| session.shutdown())).await;
    }

    // ------------------------------------------------------------------------
    // Quality
    // ------------------------------------------------------------------------

    pub fn set_quality_level(
        &self,
        key: &SessionKey,
        level: QualityLevel,
    ) -> TourlinkResult<Vec<QualityChange>> {
        Ok(self.session(key)?.set_quality_level(level))
    }

    pub async fn execute_emergency_fallback(&self, key: &SessionKey) -> TourlinkResult<bool> {
        Ok(self.session(key)?.execute_emergency_fallback().await)
    }

    // ------------------------------------------------------------------------
    // Status and Events
    // ------------------------------------------------------------------------

    pub fn get_status(&self, key: &SessionKey) -> TourlinkResult<SessionStatus> {
        Ok(self.session(key)?.status())
    }

    /// Full diagnostics; available in every state, `Failed` included
    pub fn generate_diagnostic_report(&self, key: &SessionKey) -> TourlinkResult<SessionDiagnostics> {
        Ok(self.session(key)?.diagnostics())
    }

    /// Channel receiving every event of the session until it is destroyed
    pub fn subscribe(
        &self,
        key: &SessionKey,
    ) -> TourlinkResult<(SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>)> {
        Ok(self.session(key)?.events().subscribe_channel())
    }

    /// Synchronous handler called for every event of the session
    pub fn subscribe_with<F>(&self, key: &SessionKey, handler: F) -> TourlinkResult<SubscriptionId>
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        Ok(self.session(key)?.events().subscribe(handler))
    }

    pub fn unsubscribe(&self, key: &SessionKey, id: SubscriptionId) -> TourlinkResult<bool> {
        Ok(self.session(key)?.events().unsubscribe(id))
    }

    pub fn session_keys(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
