//! Simulated tour runner
//!
//! Builds an orchestrator over the in-memory store and simulated transports,
//! connects one guide and one attendee per language channel, keeps the links
//! up for a while and collects status and diagnostics for every session.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tourlink_core::{InMemoryStore, ParticipantId, Role, SessionKey, TourlinkConfig};
use tourlink_runtime::{SessionEvent, SessionOrchestrator, SimulatedTransportFactory};
use tracing::{debug, info, warn};

use crate::error::{CliError, Result};

/// Options of one simulated run
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub tour: String,
    pub languages: Vec<String>,
    pub duration: Duration,
    pub peer_timeout: Duration,
}

/// Guide and attendee keys of one language channel
struct Channel {
    language: String,
    guide: SessionKey,
    attendee: SessionKey,
}

impl Channel {
    fn new(tour: &str, language: &str) -> Result<Self> {
        let participant = |role: Role| {
            ParticipantId::new(format!("{}-{language}", role.as_str()))
                .map_err(|e| CliError::InvalidArgument(e.to_string()))
        };
        let key = |role: Role| -> Result<SessionKey> {
            SessionKey::new(tour, language, participant(role)?)
                .map_err(|e| CliError::InvalidArgument(e.to_string()))
        };
        Ok(Self {
            language: language.to_string(),
            guide: key(Role::Guide)?,
            attendee: key(Role::Attendee)?,
        })
    }
}

fn log_event(key: &SessionKey, event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(change) => {
            info!(session = %key, from = %change.from, to = %change.to, "State changed")
        }
        SessionEvent::QualityChanged(change) => {
            info!(session = %key, from = ?change.from, to = ?change.to, "Quality changed")
        }
        SessionEvent::RecoveryComplete(session) => {
            info!(session = %key, outcome = ?session.final_outcome, "Recovery finished")
        }
        SessionEvent::Error(record) => {
            warn!(session = %key, kind = ?record.kind, message = %record.message, "Session error")
        }
        other => debug!(session = %key, event = other.name(), "Session event"),
    }
}

/// Run the simulation and return a JSON summary
pub async fn run(config: TourlinkConfig, plan: SimulationPlan) -> Result<Value> {
    if plan.languages.is_empty() {
        return Err(CliError::InvalidArgument("at least one language is required".into()));
    }
    let channels = plan
        .languages
        .iter()
        .map(|language| Channel::new(&plan.tour, language.trim()))
        .collect::<Result<Vec<_>>>()?;

    let factory = Arc::new(SimulatedTransportFactory::new());
    let orchestrator = SessionOrchestrator::builder(Arc::new(InMemoryStore::new()), factory)
        .with_config(config)
        .build()?;

    for channel in &channels {
        for (key, role) in [
            (&channel.attendee, Role::Attendee),
            (&channel.guide, Role::Guide),
        ] {
            orchestrator.create_session(key.clone(), role).await?;
            let logged = key.clone();
            orchestrator.subscribe_with(key, move |event| log_event(&logged, event))?;
        }
    }

    for channel in &channels {
        let started = orchestrator
            .start_negotiation(&channel.guide, plan.peer_timeout)
            .await?;
        if !started {
            orchestrator.shutdown().await;
            return Err(CliError::AttendeeNotReady {
                language: channel.language.clone(),
            });
        }
        info!(tour = %plan.tour, language = %channel.language, "Negotiation started");
    }

    tokio::time::sleep(plan.duration).await;

    let mut sessions = Vec::new();
    for key in channels
        .iter()
        .flat_map(|channel| [&channel.guide, &channel.attendee])
    {
        let diagnostics = orchestrator.generate_diagnostic_report(key)?;
        sessions.push(json!({
            "session": key.to_string(),
            "status": diagnostics.status,
            "report": diagnostics.report,
            "recovery_history": diagnostics.recovery_history,
            "errors": diagnostics.errors,
        }));
    }

    orchestrator.shutdown().await;
    Ok(json!({
        "tour": plan.tour,
        "languages": plan.languages,
        "sessions": sessions,
    }))
}
