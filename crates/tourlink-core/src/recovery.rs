//! Failure Recovery Planning
//!
//! Classifies connection failures as recoverable or terminal and plans the
//! escalating strategy ladder for recoverable ones: in-place connectivity
//! restart, transport rebuild, then a full re-signaling handshake. The planner
//! bounds concurrency, spacing and attempt count; the runtime executes the
//! strategies and reports outcomes back.

use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Failure Taxonomy
// ----------------------------------------------------------------------------

/// Kind of connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    IceFailed,
    PeerConnectionFailed,
    SignalingFailed,
    Timeout,
    MediaLost,
}

/// What caused a failure; decides whether it may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    IceDisconnected,
    IceFailed,
    TransportFailed,
    SignalingError,
    Timeout,
    MediaLost,
    ExplicitClose,
    AuthorizationFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Recoverable,
    Terminal,
}

/// A detected failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub failure_type: FailureType,
    pub cause: FailureCause,
    pub detail: String,
}

impl Failure {
    pub fn new(failure_type: FailureType, cause: FailureCause, detail: impl Into<String>) -> Self {
        Self {
            failure_type,
            cause,
            detail: detail.into(),
        }
    }

    pub fn classify(&self) -> Classification {
        match self.cause {
            FailureCause::ExplicitClose | FailureCause::AuthorizationFailure => {
                Classification::Terminal
            }
            _ => Classification::Recoverable,
        }
    }
}

// ----------------------------------------------------------------------------
// Strategies and Sessions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Restart connectivity checks on the existing transport
    IceRestart,
    /// Replace the transport, keeping the session identity
    RebuildTransport,
    /// Rebuild and run a fresh offer/answer handshake
    FullResignal,
}

impl RecoveryStrategy {
    /// Strategy for a 1-based attempt number
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => RecoveryStrategy::IceRestart,
            2 => RecoveryStrategy::RebuildTransport,
            _ => RecoveryStrategy::FullResignal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub attempt: u32,
    pub strategy: RecoveryStrategy,
    pub timestamp: Timestamp,
    pub outcome: Option<AttemptOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    Recovered,
    Exhausted,
    Terminal,
    Aborted,
}

/// Record of one recovery effort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySession {
    pub id: Uuid,
    pub failure: Failure,
    pub started_at: Timestamp,
    pub attempts: Vec<RecoveryAttempt>,
    pub final_outcome: Option<FinalOutcome>,
    pub completed_at: Option<Timestamp>,
}

impl RecoverySession {
    fn new(failure: Failure, now: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            failure,
            started_at: now,
            attempts: Vec::new(),
            final_outcome: None,
            completed_at: None,
        }
    }

    fn attempt_running(&self) -> bool {
        self.attempts.last().is_some_and(|a| a.outcome.is_none())
    }

    fn finish(&mut self, outcome: FinalOutcome, now: Timestamp) {
        self.final_outcome = Some(outcome);
        self.completed_at = Some(now);
    }
}

// ----------------------------------------------------------------------------
// Planner Decisions
// ----------------------------------------------------------------------------

/// Attempt to execute now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub session_id: Uuid,
    pub attempt: u32,
    pub strategy: RecoveryStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// A recovery attempt is executing
    InProgress,
    /// A recovery is waiting out the cooldown before its next attempt
    Cooldown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Start(RecoveryPlan),
    Suppressed(SuppressReason),
    /// Terminal failure; never retried
    Terminal(RecoverySession),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// Wait `after`, then call [`RecoveryPlanner::begin_next_attempt`]
    Retry { session_id: Uuid, after: Duration },
    /// The session is closed
    Complete(RecoverySession),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub sessions_started: u64,
    pub recovered: u64,
    pub exhausted: u64,
    pub terminal: u64,
    pub suppressed: u64,
    pub active: usize,
}

// ----------------------------------------------------------------------------
// Recovery Planner
// ----------------------------------------------------------------------------

/// Bounded recovery bookkeeping for one session
#[derive(Debug)]
pub struct RecoveryPlanner {
    config: RecoveryConfig,
    active: Vec<RecoverySession>,
    last_attempt_at: Option<Timestamp>,
    history: VecDeque<RecoverySession>,
    stats: RecoveryStats,
}

impl RecoveryPlanner {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            active: Vec::new(),
            last_attempt_at: None,
            history: VecDeque::new(),
            stats: RecoveryStats::default(),
        }
    }

    /// Decide what a newly detected failure triggers
    pub fn notify(&mut self, failure: Failure, now: Timestamp) -> RecoveryDecision {
        if failure.classify() == Classification::Terminal {
            let mut session = RecoverySession::new(failure, now);
            session.finish(FinalOutcome::Terminal, now);
            self.stats.terminal += 1;
            warn!(cause = ?session.failure.cause, "Terminal failure, not recovering");
            self.archive(session.clone());
            return RecoveryDecision::Terminal(session);
        }

        if self.active.len() >= self.config.max_concurrent_recoveries {
            self.stats.suppressed += 1;
            let reason = if self.active.iter().any(RecoverySession::attempt_running) {
                SuppressReason::InProgress
            } else {
                SuppressReason::Cooldown
            };
            debug!(failure_type = ?failure.failure_type, ?reason, "Recovery suppressed");
            return RecoveryDecision::Suppressed(reason);
        }

        let session = RecoverySession::new(failure, now);
        let session_id = session.id;
        info!(%session_id, failure_type = ?session.failure.failure_type, "Recovery session started");
        self.active.push(session);
        self.stats.sessions_started += 1;

        match self.begin_next_attempt(session_id, now) {
            Some(plan) => RecoveryDecision::Start(plan),
            None => RecoveryDecision::Suppressed(SuppressReason::Cooldown),
        }
    }

    /// Start the next attempt of an active session
    ///
    /// Returns `None` if the session is unknown, already running an attempt,
    /// or the cooldown since the previous attempt has not elapsed.
    pub fn begin_next_attempt(&mut self, session_id: Uuid, now: Timestamp) -> Option<RecoveryPlan> {
        if let Some(last) = self.last_attempt_at {
            let since_last = now.duration_since(last);
            // The very first attempt of a fresh session is not gated
            let has_attempts = self
                .active
                .iter()
                .find(|s| s.id == session_id)
                .is_some_and(|s| !s.attempts.is_empty());
            if has_attempts && since_last < self.config.cooldown {
                return None;
            }
        }

        let session = self.active.iter_mut().find(|s| s.id == session_id)?;
        if session.attempt_running() {
            return None;
        }
        let attempt = session.attempts.len() as u32 + 1;
        let strategy = RecoveryStrategy::for_attempt(attempt);
        session.attempts.push(RecoveryAttempt {
            attempt,
            strategy,
            timestamp: now,
            outcome: None,
        });
        self.last_attempt_at = Some(now);
        debug!(%session_id, attempt, ?strategy, "Recovery attempt started");
        Some(RecoveryPlan {
            session_id,
            attempt,
            strategy,
        })
    }

    /// Record the outcome of the running attempt
    pub fn complete_attempt(
        &mut self,
        session_id: Uuid,
        outcome: AttemptOutcome,
        now: Timestamp,
    ) -> Option<AttemptResult> {
        let index = self.active.iter().position(|s| s.id == session_id)?;
        let session = &mut self.active[index];
        let attempt = session.attempts.last_mut()?;
        if attempt.outcome.is_some() {
            return None;
        }
        attempt.outcome = Some(outcome.clone());

        let final_outcome = match outcome {
            AttemptOutcome::Succeeded => Some(FinalOutcome::Recovered),
            _ if session.attempts.len() as u32 >= self.config.max_attempts => {
                Some(FinalOutcome::Exhausted)
            }
            _ => None,
        };

        match final_outcome {
            Some(final_outcome) => {
                let mut session = self.active.remove(index);
                session.finish(final_outcome, now);
                match final_outcome {
                    FinalOutcome::Recovered => self.stats.recovered += 1,
                    _ => self.stats.exhausted += 1,
                }
                info!(
                    %session_id,
                    attempts = session.attempts.len(),
                    outcome = ?final_outcome,
                    "Recovery session complete"
                );
                self.archive(session.clone());
                Some(AttemptResult::Complete(session))
            }
            None => Some(AttemptResult::Retry {
                session_id,
                after: self.config.cooldown,
            }),
        }
    }

    /// Close a session between attempts because the link came back on its own
    ///
    /// Returns `None` if the session is unknown or an attempt is running.
    pub fn resolve_recovered(&mut self, session_id: Uuid, now: Timestamp) -> Option<RecoverySession> {
        let index = self
            .active
            .iter()
            .position(|s| s.id == session_id && !s.attempt_running())?;
        let mut session = self.active.remove(index);
        session.finish(FinalOutcome::Recovered, now);
        self.stats.recovered += 1;
        info!(
            %session_id,
            attempts = session.attempts.len(),
            "Link restored between recovery attempts"
        );
        self.archive(session.clone());
        Some(session)
    }

    /// Close every active session as aborted (teardown)
    pub fn abort_all(&mut self, now: Timestamp) -> Vec<RecoverySession> {
        let mut aborted = Vec::new();
        for mut session in core::mem::take(&mut self.active) {
            session.finish(FinalOutcome::Aborted, now);
            self.archive(session.clone());
            aborted.push(session);
        }
        aborted
    }

    fn archive(&mut self, session: RecoverySession) {
        if self.history.len() >= self.config.history_size.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(session);
    }

    pub fn is_recovering(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_sessions(&self) -> &[RecoverySession] {
        &self.active
    }

    pub fn history(&self) -> impl Iterator<Item = &RecoverySession> {
        self.history.iter()
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            active: self.active.len(),
            ..self.stats.clone()
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
