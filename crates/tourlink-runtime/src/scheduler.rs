//! Per-session scheduler
//!
//! Owns every timer and background task of one session under a name:
//! heartbeat, inbound polling, health sampling, report generation, the batch
//! flush deadline, the transport event pump, recovery and the emergency
//! fallback.
//!
//! - Re-arming a pending name replaces the previous timer
//! - A one-shot timer that has fired keeps running even if its name is re-armed
//! - [`SessionScheduler::cancel_all`] aborts everything synchronously and
//!   refuses new work afterwards

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tourlink_core::{TourlinkError, TourlinkResult};
use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Timer Names
// ----------------------------------------------------------------------------

/// Names of the timers a session arms
pub mod timers {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const INBOUND_POLL: &str = "inbound-poll";
    pub const HEALTH_SAMPLE: &str = "health-sample";
    pub const HEALTH_REPORT: &str = "health-report";
    pub const BATCH_FLUSH: &str = "ice-batch-flush";
    pub const TRANSPORT_EVENTS: &str = "transport-events";
    pub const RECOVERY: &str = "recovery";
    pub const EMERGENCY_FALLBACK: &str = "emergency-fallback";

    /// Periodic timers stopped when a session fails
    pub const PERIODIC: [&str; 5] = [
        HEARTBEAT,
        INBOUND_POLL,
        HEALTH_SAMPLE,
        HEALTH_REPORT,
        BATCH_FLUSH,
    ];
}

// ----------------------------------------------------------------------------
// Scheduler State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Once,
    Interval,
    Task,
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    kind: TimerKind,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Pending one-shots, intervals and long-running tasks by name
    armed: HashMap<String, Armed>,
    /// One-shots that fired and are executing, by generation
    running: HashMap<u64, (String, JoinHandle<()>)>,
    next_generation: u64,
    closed: bool,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move a fired one-shot from the armed set to the running set
fn promote(inner: &Mutex<Inner>, name: &str, generation: u64) -> bool {
    let mut inner = lock(inner);
    match inner.armed.get(name) {
        Some(armed) if armed.generation == generation => {
            if let Some(armed) = inner.armed.remove(name) {
                inner
                    .running
                    .insert(generation, (name.to_string(), armed.handle));
            }
            true
        }
        _ => false,
    }
}

fn retire(inner: &Mutex<Inner>, generation: u64) {
    lock(inner).running.remove(&generation);
}

// ----------------------------------------------------------------------------
// Session Scheduler
// ----------------------------------------------------------------------------

/// Named, cancellable timers and tasks of one session
#[derive(Debug)]
pub struct SessionScheduler {
    label: String,
    inner: Arc<Mutex<Inner>>,
}

impl SessionScheduler {
    /// Create a scheduler; `label` names the owning session in logs and errors
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Run `task` once after `delay`
    pub fn schedule_once<F>(&self, name: &str, delay: Duration, task: F) -> TourlinkResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let owned = name.to_string();
        self.arm(name, TimerKind::Once, move |generation| async move {
            sleep(delay).await;
            if !promote(&inner, &owned, generation) {
                return;
            }
            task.await;
            retire(&inner, generation);
        })
    }

    /// Call `tick` every `period`, first after one period; stops when it returns false
    pub fn schedule_interval<F, Fut>(
        &self,
        name: &str,
        period: Duration,
        mut tick: F,
    ) -> TourlinkResult<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        self.arm(name, TimerKind::Interval, move |_| async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick().await {
                    break;
                }
            }
        })
    }

    /// Run a long-lived task under `name`
    pub fn spawn<F>(&self, name: &str, task: F) -> TourlinkResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.arm(name, TimerKind::Task, move |_| task)
    }

    fn arm<B, F>(&self, name: &str, kind: TimerKind, build: B) -> TourlinkResult<()>
    where
        B: FnOnce(u64) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(TourlinkError::SessionClosed {
                key: self.label.clone(),
            });
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;

        // Spawned while the lock is held so a zero-delay one-shot cannot
        // fire before it is registered
        let handle = tokio::spawn(build(generation));
        if let Some(previous) = inner.armed.insert(
            name.to_string(),
            Armed {
                generation,
                kind,
                handle,
            },
        ) {
            previous.handle.abort();
            trace!(session = %self.label, timer = name, "Timer re-armed");
        }
        Ok(())
    }

    /// Cancel a pending timer or task; one-shots already executing are left alone
    pub fn cancel(&self, name: &str) -> bool {
        match lock(&self.inner).armed.remove(name) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every timer and task and refuse new ones; returns how many were live
    pub fn cancel_all(&self) -> usize {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        let mut cancelled = 0;
        for (_, armed) in inner.armed.drain() {
            if !armed.handle.is_finished() {
                cancelled += 1;
            }
            armed.handle.abort();
        }
        for (_, (_, handle)) in inner.running.drain() {
            if !handle.is_finished() {
                cancelled += 1;
            }
            handle.abort();
        }
        debug!(session = %self.label, cancelled, "All timers cancelled");
        cancelled
    }

    /// True while `name` is pending, or is an interval or task still running
    pub fn is_scheduled(&self, name: &str) -> bool {
        lock(&self.inner)
            .armed
            .get(name)
            .is_some_and(|armed| !armed.handle.is_finished())
    }

    /// True while `name` is pending or a fired one-shot of that name is executing
    pub fn is_active(&self, name: &str) -> bool {
        let inner = lock(&self.inner);
        let armed = inner
            .armed
            .get(name)
            .is_some_and(|armed| !armed.handle.is_finished());
        armed
            || inner
                .running
                .values()
                .any(|(running, handle)| running == name && !handle.is_finished())
    }

    /// Names of live timers, sorted
    pub fn active_timers(&self) -> Vec<String> {
        let inner = lock(&self.inner);
        let mut names: Vec<String> = inner
            .armed
            .iter()
            .filter(|(_, armed)| !armed.handle.is_finished())
            .map(|(name, _)| name.clone())
            .chain(
                inner
                    .running
                    .values()
                    .filter(|(_, handle)| !handle.is_finished())
                    .map(|(name, _)| name.clone()),
            )
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Number of interval timers currently armed
    pub fn interval_count(&self) -> usize {
        lock(&self.inner)
            .armed
            .values()
            .filter(|armed| armed.kind == TimerKind::Interval && !armed.handle.is_finished())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }
}

impl Drop for SessionScheduler {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        for (_, armed) in inner.armed.drain() {
            armed.handle.abort();
        }
        for (_, (_, handle)) in inner.running.drain() {
            handle.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
