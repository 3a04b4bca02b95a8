//! Health sampling and reporting

use tourlink_core::{
    Alert, AlertReason, ConnectionState, Failure, FailureCause, FailureType, HealthReport,
    QualityMetrics, TourlinkError,
};
use tracing::{debug, info, warn};

use super::Session;
use crate::events::SessionEvent;

impl Session {
    /// Score one statistics snapshot and react to it
    ///
    /// Degradation is only evaluated on samples without an alert and while
    /// no emergency fallback is running.
    pub(super) async fn sample_health(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let stats = match self.transport().get_stats().await {
            Ok(stats) => stats,
            Err(err) => {
                self.record_error(&TourlinkError::from(err));
                return;
            }
        };

        let now = self.now();
        let (outcome, change) = self.with_core(|core| {
            let outcome = core.health.record(&stats, now);
            let change = if outcome.alert.is_none() && !core.emergency_active {
                core.degradation
                    .evaluate(&QualityMetrics::from(&outcome.sample), now)
            } else {
                None
            };
            (outcome, change)
        });

        self.events.publish(SessionEvent::HealthSampled {
            score: outcome.sample.quality_score,
            grade: outcome.sample.quality_grade,
        });
        for warning in outcome.warnings {
            debug!(session = %self.key, kind = ?warning.kind, value = warning.value, "Health warning");
            self.events.publish(SessionEvent::HealthWarning(warning));
        }
        if let Some(change) = change {
            info!(session = %self.key, from = ?change.from, to = ?change.to, "Quality level changed");
            self.events.publish(SessionEvent::QualityChanged(change));
        }
        if let Some(alert) = outcome.alert {
            warn!(session = %self.key, reason = ?alert.reason, score = alert.score, "Health alert");
            self.events.publish(SessionEvent::HealthAlert(alert.clone()));
            self.on_alert(alert).await;
        }
    }

    async fn on_alert(&self, alert: Alert) {
        match alert.reason {
            AlertReason::QualityCritical => {
                self.record_error(&TourlinkError::QualityCritical { score: alert.score });
                self.force_flush().await;
                self.spawn_emergency_fallback();
            }
            AlertReason::TransportFailed => {
                self.on_failure(Failure::new(
                    FailureType::PeerConnectionFailed,
                    FailureCause::TransportFailed,
                    "health sample reports a failed transport",
                ))
                .await
            }
        }
    }

    /// Publish the periodic diagnostic report and refresh the heartbeat summary
    pub(super) fn publish_report(&self) {
        let now = self.now();
        let messages_received = self.coordinator.messages_received();
        let messages_sent = self.coordinator.messages_sent();
        let report = self.with_core(|core| {
            core.health_report = Some(HealthReport {
                quality: core
                    .health
                    .latest()
                    .map_or(0, |sample| sample.quality_score),
                avg_latency_ms: core.health.average_latency_ms(),
                uptime_secs: core.health.uptime(now).as_secs(),
                messages_received,
                messages_sent,
                reconnections: core.reconnections,
            });
            core.health.generate_report(now)
        });
        debug!(session = %self.key, status = ?report.status, samples = report.sample_count, "Diagnostic report");
        self.events
            .publish(SessionEvent::DiagnosticReport(Box::new(report)));
    }
}
