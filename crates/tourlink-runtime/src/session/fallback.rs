//! Emergency quality fallback
//!
//! On a critical alert the session jumps to the emergency level, then keeps
//! stepping down one level per wait until a fresh sample grades at least
//! fair or the floor is reached.

use std::time::Duration;
use tokio::time::sleep;
use tourlink_core::QualityGrade;
use tracing::{debug, info, warn};

use super::Session;
use crate::events::SessionEvent;
use crate::scheduler::timers;

impl Session {
    /// Start the fallback in the background unless one is already running
    pub(super) fn spawn_emergency_fallback(&self) {
        if self.scheduler.is_active(timers::EMERGENCY_FALLBACK) {
            debug!(session = %self.key, "Emergency fallback already running");
            return;
        }
        let weak = self.weak_self.clone();
        let spawned = self
            .scheduler
            .schedule_once(timers::EMERGENCY_FALLBACK, Duration::ZERO, async move {
                if let Some(session) = weak.upgrade() {
                    session.execute_emergency_fallback().await;
                }
            });
        if let Err(err) = spawned {
            debug!(session = %self.key, error = %err, "Emergency fallback not started");
        }
    }

    /// Run the emergency fallback to completion; true if the link recovered
    pub async fn execute_emergency_fallback(&self) -> bool {
        let now = self.now();
        let jump = self.with_core(|core| {
            core.emergency_active = true;
            core.degradation.emergency(now)
        });
        if let Some(change) = jump {
            warn!(session = %self.key, from = ?change.from, to = ?change.to, "Emergency quality fallback");
            self.events.publish(SessionEvent::QualityChanged(change));
        }

        let step_wait = self.config.degradation.emergency_step_wait;
        let success = loop {
            sleep(step_wait).await;
            if self.is_closed() {
                break false;
            }
            if self.link_is_healthy().await {
                break true;
            }
            let now = self.now();
            match self.with_core(|core| core.degradation.step_down_emergency(now)) {
                Some(change) => {
                    debug!(session = %self.key, to = ?change.to, "Emergency step down");
                    self.events.publish(SessionEvent::QualityChanged(change));
                }
                None => break false,
            }
        };

        let level = self.with_core(|core| {
            core.emergency_active = false;
            core.degradation.current_level()
        });
        if success {
            info!(session = %self.key, ?level, "Emergency fallback restored the link");
        } else {
            warn!(session = %self.key, ?level, "Emergency fallback reached the floor");
        }
        self.events
            .publish(SessionEvent::EmergencyFallbackComplete { success, level });
        success
    }

    /// Fresh sample grading at least fair
    async fn link_is_healthy(&self) -> bool {
        let stats = match self.transport().get_stats().await {
            Ok(stats) => stats,
            Err(err) => {
                debug!(session = %self.key, error = %err, "No statistics for fallback check");
                return false;
            }
        };
        let now = self.now();
        let sample = self.with_core(|core| core.health.record(&stats, now).sample);
        sample.quality_grade >= QualityGrade::Fair
    }
}
