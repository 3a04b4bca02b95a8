//! Recovery execution
//!
//! Drives a [`RecoveryPlanner`] session to completion: each attempt runs its
//! strategy and then waits for the link to come back, bounded by the attempt
//! timeout. Failed attempts wait out the cooldown before the planner hands
//! out the next, escalated strategy. A link that comes back during the
//! cooldown closes the recovery as recovered without another attempt.

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tourlink_core::{
    AttemptOutcome, AttemptResult, RecoveryPlan, RecoveryPlanner, RecoverySession,
    RecoveryStrategy, TimeSource, TourlinkError, TourlinkResult,
};
use tracing::{debug, info, warn};

/// Poll period while the planner is still holding back the next attempt
const NEXT_ATTEMPT_POLL: Duration = Duration::from_millis(10);

/// Carries out recovery strategies for one session
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    /// Run one strategy; returning means it was applied, not that the link is back
    async fn execute(&self, strategy: RecoveryStrategy) -> TourlinkResult<()>;

    /// Resolve once the link is connected again
    async fn wait_for_link(&self);

    /// Whether the link is connected right now
    fn is_link_up(&self) -> bool {
        false
    }

    fn attempt_started(&self, _plan: &RecoveryPlan) {}

    /// False once the owner is gone and recovery should stop
    fn is_available(&self) -> bool {
        true
    }
}

fn lock(planner: &Mutex<RecoveryPlanner>) -> MutexGuard<'_, RecoveryPlanner> {
    planner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run attempts until the planner closes the recovery session
///
/// Returns `None` if the session was aborted underneath (teardown) or the
/// executor became unavailable.
pub async fn run_recovery<E>(
    executor: &E,
    planner: &Mutex<RecoveryPlanner>,
    clock: &dyn TimeSource,
    attempt_timeout: Duration,
    first: RecoveryPlan,
) -> Option<RecoverySession>
where
    E: RecoveryExecutor + ?Sized,
{
    let mut plan = first;
    loop {
        executor.attempt_started(&plan);
        info!(
            session_id = %plan.session_id,
            attempt = plan.attempt,
            strategy = ?plan.strategy,
            "Executing recovery attempt"
        );

        let attempt = async {
            executor.execute(plan.strategy).await?;
            executor.wait_for_link().await;
            Ok::<(), TourlinkError>(())
        };
        let outcome = match timeout(attempt_timeout, attempt).await {
            Ok(Ok(())) => AttemptOutcome::Succeeded,
            Ok(Err(err)) => {
                warn!(attempt = plan.attempt, error = %err, "Recovery attempt failed");
                AttemptOutcome::Failed {
                    reason: err.to_string(),
                }
            }
            Err(_) => {
                debug!(attempt = plan.attempt, "Recovery attempt timed out");
                AttemptOutcome::TimedOut
            }
        };

        let result = lock(planner).complete_attempt(plan.session_id, outcome, clock.now())?;
        let (session_id, after) = match result {
            AttemptResult::Complete(session) => return Some(session),
            AttemptResult::Retry { session_id, after } => (session_id, after),
        };

        sleep(after).await;
        plan = loop {
            if !executor.is_available() {
                return None;
            }
            if executor.is_link_up() {
                if let Some(session) = lock(planner).resolve_recovered(session_id, clock.now()) {
                    return Some(session);
                }
            }
            let next = lock(planner).begin_next_attempt(session_id, clock.now());
            if let Some(next) = next {
                break next;
            }
            let active = lock(planner)
                .active_sessions()
                .iter()
                .any(|session| session.id == session_id);
            if !active {
                return None;
            }
            sleep(NEXT_ATTEMPT_POLL).await;
        };
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioTimeSource;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tourlink_core::{
        Failure, FailureCause, FailureType, FinalOutcome, RecoveryConfig, RecoveryDecision,
    };

    /// Executor whose link comes back only after `succeed_on` attempts
    struct ScriptedExecutor {
        succeed_on: Option<u32>,
        attempts: AtomicU32,
        strategies: Mutex<Vec<RecoveryStrategy>>,
    }

    impl ScriptedExecutor {
        fn new(succeed_on: Option<u32>) -> Self {
            Self {
                succeed_on,
                attempts: AtomicU32::new(0),
                strategies: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecoveryExecutor for ScriptedExecutor {
        async fn execute(&self, strategy: RecoveryStrategy) -> TourlinkResult<()> {
            self.strategies.lock().unwrap().push(strategy);
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if strategy == RecoveryStrategy::RebuildTransport && self.succeed_on.is_none() {
                return Err(TourlinkError::channel_error("rebuild refused"));
            }
            Ok(())
        }

        async fn wait_for_link(&self) {
            let attempts = self.attempts.load(Ordering::SeqCst);
            if self.succeed_on.is_some_and(|n| attempts >= n) {
                return;
            }
            futures::future::pending::<()>().await
        }
    }

    /// Executor whose link comes back on its own once the first attempt gave up
    struct LateLinkExecutor {
        link_up: AtomicBool,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl RecoveryExecutor for LateLinkExecutor {
        async fn execute(&self, _strategy: RecoveryStrategy) -> TourlinkResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_for_link(&self) {
            futures::future::pending::<()>().await
        }

        fn is_link_up(&self) -> bool {
            self.link_up.load(Ordering::SeqCst)
        }
    }

    fn start(planner: &Mutex<RecoveryPlanner>, clock: &TokioTimeSource) -> RecoveryPlan {
        let failure = Failure::new(FailureType::IceFailed, FailureCause::IceDisconnected, "ice down");
        match planner.lock().unwrap().notify(failure, clock.now()) {
            RecoveryDecision::Start(plan) => plan,
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_escalating_strategies() {
        let clock = TokioTimeSource::new();
        let planner = Mutex::new(RecoveryPlanner::new(RecoveryConfig::testing()));
        let executor = ScriptedExecutor::new(None);
        let plan = start(&planner, &clock);

        let session = run_recovery(&executor, &planner, &clock, Duration::from_millis(200), plan)
            .await
            .unwrap();

        assert_eq!(session.final_outcome, Some(FinalOutcome::Exhausted));
        assert_eq!(session.attempts.len(), 5);
        assert_eq!(
            *executor.strategies.lock().unwrap(),
            vec![
                RecoveryStrategy::IceRestart,
                RecoveryStrategy::RebuildTransport,
                RecoveryStrategy::FullResignal,
                RecoveryStrategy::FullResignal,
                RecoveryStrategy::FullResignal,
            ]
        );
        assert!(matches!(
            session.attempts[0].outcome,
            Some(AttemptOutcome::TimedOut)
        ));
        assert!(matches!(
            session.attempts[1].outcome,
            Some(AttemptOutcome::Failed { .. })
        ));
        assert!(!planner.lock().unwrap().is_recovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_second_attempt() {
        let clock = TokioTimeSource::new();
        let planner = Mutex::new(RecoveryPlanner::new(RecoveryConfig::testing()));
        let executor = ScriptedExecutor::new(Some(2));
        let plan = start(&planner, &clock);

        let session = run_recovery(&executor, &planner, &clock, Duration::from_millis(200), plan)
            .await
            .unwrap();

        assert_eq!(session.final_outcome, Some(FinalOutcome::Recovered));
        assert_eq!(session.attempts.len(), 2);
        assert_eq!(planner.lock().unwrap().stats().recovered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_back_during_cooldown_ends_recovery() {
        let clock = TokioTimeSource::new();
        let planner = Mutex::new(RecoveryPlanner::new(RecoveryConfig::testing()));
        let executor = LateLinkExecutor {
            link_up: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        };
        let plan = start(&planner, &clock);

        let run = run_recovery(&executor, &planner, &clock, Duration::from_millis(100), plan);
        let reconnect = async {
            // After the first attempt timed out, inside the cooldown
            sleep(Duration::from_millis(110)).await;
            executor.link_up.store(true, Ordering::SeqCst);
        };
        let (finished, ()) = tokio::join!(run, reconnect);

        let session = finished.unwrap();
        assert_eq!(session.final_outcome, Some(FinalOutcome::Recovered));
        assert_eq!(session.attempts.len(), 1);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(planner.lock().unwrap().stats().recovered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_the_loop() {
        let clock = TokioTimeSource::new();
        let planner = Mutex::new(RecoveryPlanner::new(RecoveryConfig::testing()));
        let executor = ScriptedExecutor::new(None);
        let plan = start(&planner, &clock);

        let run = run_recovery(&executor, &planner, &clock, Duration::from_millis(200), plan);
        let abort = async {
            sleep(Duration::from_millis(100)).await;
            planner.lock().unwrap().abort_all(clock.now());
        };
        let (finished, ()) = tokio::join!(run, abort);
        assert!(finished.is_none());
    }
}
