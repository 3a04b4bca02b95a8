//! Connection Health Monitoring
//!
//! Quality scoring of transport statistics, a bounded rolling sample history,
//! typed warnings and alerts, and periodic diagnostic reports. The monitor is
//! synchronous; the runtime samples the transport on a timer and feeds each
//! snapshot to [`HealthMonitor::record`].

use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::transport::{IceConnectionState, TransportState, TransportStats};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Scoring Thresholds
// ----------------------------------------------------------------------------

/// Escalating thresholds and the deductions applied when each is crossed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreThresholds {
    pub rtt_ms: [f64; 3],
    pub rtt_penalties: [u8; 3],
    /// Loss rate as a fraction of lost / (lost + received)
    pub packet_loss: [f64; 3],
    pub packet_loss_penalties: [u8; 3],
    /// Audio level floors, deducted when the level falls below each
    pub audio_level: [f64; 3],
    pub audio_level_penalties: [u8; 3],
    pub jitter_ms: [f64; 2],
    pub jitter_penalties: [u8; 2],
    pub transport_not_connected_penalty: u8,
    pub ice_disconnected_penalty: u8,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            rtt_ms: [150.0, 300.0, 500.0],
            rtt_penalties: [15, 15, 20],
            packet_loss: [0.01, 0.03, 0.05],
            packet_loss_penalties: [20, 20, 30],
            audio_level: [0.1, 0.05, 0.01],
            audio_level_penalties: [10, 10, 15],
            jitter_ms: [30.0, 50.0],
            jitter_penalties: [10, 15],
            transport_not_connected_penalty: 50,
            ice_disconnected_penalty: 30,
        }
    }
}

/// Per-sample warning thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningThresholds {
    pub high_rtt_ms: f64,
    pub packet_loss: f64,
    pub low_audio_level: f64,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            high_rtt_ms: 300.0,
            packet_loss: 0.03,
            low_audio_level: 0.05,
        }
    }
}

// ----------------------------------------------------------------------------
// Quality Score
// ----------------------------------------------------------------------------

/// Inputs to the quality score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreInputs {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_rate: f64,
    pub audio_level: f64,
    pub connection_state: TransportState,
    pub ice_state: IceConnectionState,
}

/// Cascading-deduction quality score in [0, 100]
pub fn quality_score(inputs: &ScoreInputs, thresholds: &ScoreThresholds) -> u8 {
    let mut score: i32 = 100;

    for (limit, penalty) in thresholds.rtt_ms.iter().zip(thresholds.rtt_penalties) {
        if inputs.rtt_ms > *limit {
            score -= penalty as i32;
        }
    }
    for (limit, penalty) in thresholds
        .packet_loss
        .iter()
        .zip(thresholds.packet_loss_penalties)
    {
        if inputs.loss_rate > *limit {
            score -= penalty as i32;
        }
    }
    for (floor, penalty) in thresholds
        .audio_level
        .iter()
        .zip(thresholds.audio_level_penalties)
    {
        if inputs.audio_level < *floor {
            score -= penalty as i32;
        }
    }
    for (limit, penalty) in thresholds.jitter_ms.iter().zip(thresholds.jitter_penalties) {
        if inputs.jitter_ms > *limit {
            score -= penalty as i32;
        }
    }
    if inputs.connection_state != TransportState::Connected {
        score -= thresholds.transport_not_connected_penalty as i32;
    }
    if inputs.ice_state == IceConnectionState::Disconnected {
        score -= thresholds.ice_disconnected_penalty as i32;
    }

    score.clamp(0, 100) as u8
}

/// Coarse quality grade derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGrade {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityGrade {
    pub fn from_score(score: u8) -> Self {
        match score {
            85..=u8::MAX => QualityGrade::Excellent,
            70..=84 => QualityGrade::Good,
            50..=69 => QualityGrade::Fair,
            25..=49 => QualityGrade::Poor,
            _ => QualityGrade::Critical,
        }
    }
}

// ----------------------------------------------------------------------------
// Samples, Warnings and Alerts
// ----------------------------------------------------------------------------

/// One health sample; packet and byte counts cover the interval since the
/// previous sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: Timestamp,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub packets_lost: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub audio_level: f64,
    pub connection_state: TransportState,
    pub ice_state: IceConnectionState,
    pub candidate_type: Option<String>,
    pub quality_score: u8,
    pub quality_grade: QualityGrade,
}

impl MetricSample {
    pub fn loss_rate(&self) -> f64 {
        loss_rate(self.packets_lost, self.packets_received)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == TransportState::Connected
    }
}

fn loss_rate(lost: u64, received: u64) -> f64 {
    let total = lost + received;
    if total == 0 {
        0.0
    } else {
        lost as f64 / total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    HighRtt,
    PacketLoss,
    LowAudio,
    ConnectionDegraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertReason {
    QualityCritical,
    TransportFailed,
}

/// Raised when quality is critical or the transport has failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub reason: AlertReason,
    pub score: u8,
    pub timestamp: Timestamp,
}

/// Result of recording one statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOutcome {
    pub sample: MetricSample,
    pub warnings: Vec<Warning>,
    pub alert: Option<Alert>,
}

// ----------------------------------------------------------------------------
// Diagnostic Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Latency,
    PacketLoss,
    Jitter,
    Audio,
    Connectivity,
    Stability,
    Bandwidth,
    Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub category: IssueCategory,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MinAvgMax {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl MinAvgMax {
    fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            min,
            avg: mean(values),
            max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowSummary {
    pub rtt_ms: MinAvgMax,
    pub jitter_ms: MinAvgMax,
    pub loss_rate: MinAvgMax,
    pub audio_level: MinAvgMax,
    pub quality_score: MinAvgMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Variable,
    Unstable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAnalysis {
    pub stability: Stability,
    pub rtt_std_dev_ms: f64,
    pub throughput_kbps: f64,
    pub bandwidth_adequate: bool,
    /// Share of samples with a connected transport
    pub reliability_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioQuality {
    Good,
    Fair,
    Poor,
    Silent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAnalysis {
    pub quality: AudioQuality,
    pub consistent: bool,
    pub level_variance: f64,
    pub issues: Vec<String>,
}

/// Periodic diagnostic report over the recent window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub generated_at: Timestamp,
    pub sample_count: usize,
    pub status: HealthStatus,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<String>,
    pub window: WindowSummary,
    pub trend: Trend,
    pub network: NetworkAnalysis,
    pub audio: AudioAnalysis,
}

// ----------------------------------------------------------------------------
// Health Monitor
// ----------------------------------------------------------------------------

/// Rolling health state for one session
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    history: VecDeque<MetricSample>,
    previous_counters: Option<(u64, u64, u64)>,
    started_at: Timestamp,
    total_samples: u64,
    alerts_raised: u64,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, started_at: Timestamp) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_size.min(1024)),
            config,
            previous_counters: None,
            started_at,
            total_samples: 0,
            alerts_raised: 0,
        }
    }

    /// Score a statistics snapshot and append it to the history
    pub fn record(&mut self, stats: &TransportStats, now: Timestamp) -> SampleOutcome {
        let counters = (stats.packets_lost, stats.packets_received, stats.bytes_received);
        // Counters restart when the transport is rebuilt
        let (lost, received, bytes) = match self.previous_counters {
            Some((p_lost, p_received, p_bytes))
                if counters.0 >= p_lost && counters.1 >= p_received && counters.2 >= p_bytes =>
            {
                (counters.0 - p_lost, counters.1 - p_received, counters.2 - p_bytes)
            }
            _ => counters,
        };
        self.previous_counters = Some(counters);

        let inputs = ScoreInputs {
            rtt_ms: stats.rtt_ms,
            jitter_ms: stats.jitter_ms,
            loss_rate: loss_rate(lost, received),
            audio_level: stats.audio_level,
            connection_state: stats.connection_state,
            ice_state: stats.ice_state,
        };
        let score = quality_score(&inputs, &self.config.scoring);
        let grade = QualityGrade::from_score(score);

        let sample = MetricSample {
            timestamp: now,
            rtt_ms: stats.rtt_ms,
            jitter_ms: stats.jitter_ms,
            packets_lost: lost,
            packets_received: received,
            bytes_received: bytes,
            audio_level: stats.audio_level,
            connection_state: stats.connection_state,
            ice_state: stats.ice_state,
            candidate_type: stats.selected_candidate_type.clone(),
            quality_score: score,
            quality_grade: grade,
        };

        let warnings = self.warnings_for(&sample, inputs.loss_rate);
        let alert = self.alert_for(&sample);

        if self.history.len() >= self.config.history_size {
            self.history.pop_front();
        }
        self.history.push_back(sample.clone());
        self.total_samples += 1;

        debug!(score, ?grade, rtt_ms = sample.rtt_ms, "Health sample recorded");
        SampleOutcome {
            sample,
            warnings,
            alert,
        }
    }

    fn warnings_for(&self, sample: &MetricSample, loss: f64) -> Vec<Warning> {
        let limits = &self.config.warnings;
        let mut warnings = Vec::new();
        let mut push = |kind, value, threshold| {
            warnings.push(Warning {
                kind,
                value,
                threshold,
                timestamp: sample.timestamp,
            })
        };

        if sample.rtt_ms > limits.high_rtt_ms {
            push(WarningKind::HighRtt, sample.rtt_ms, limits.high_rtt_ms);
        }
        if loss > limits.packet_loss {
            push(WarningKind::PacketLoss, loss, limits.packet_loss);
        }
        if sample.is_connected() && sample.audio_level < limits.low_audio_level {
            push(WarningKind::LowAudio, sample.audio_level, limits.low_audio_level);
        }
        if sample.connection_state == TransportState::Disconnected
            || sample.ice_state == IceConnectionState::Disconnected
        {
            push(WarningKind::ConnectionDegraded, sample.quality_score as f64, 0.0);
        }
        warnings
    }

    fn alert_for(&mut self, sample: &MetricSample) -> Option<Alert> {
        let reason = if sample.connection_state == TransportState::Failed
            || sample.ice_state == IceConnectionState::Failed
        {
            AlertReason::TransportFailed
        } else if sample.quality_grade == QualityGrade::Critical {
            AlertReason::QualityCritical
        } else {
            return None;
        };
        self.alerts_raised += 1;
        warn!(?reason, score = sample.quality_score, "Health alert");
        Some(Alert {
            reason,
            score: sample.quality_score,
            timestamp: sample.timestamp,
        })
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &MetricSample> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn alerts_raised(&self) -> u64 {
        self.alerts_raised
    }

    pub fn uptime(&self, now: Timestamp) -> Duration {
        now.duration_since(self.started_at)
    }

    /// Mean RTT over the report window
    pub fn average_latency_ms(&self) -> f64 {
        let rtts: Vec<f64> = self.window().iter().map(|s| s.rtt_ms).collect();
        mean(&rtts)
    }

    /// Samples covered by one report interval
    fn window(&self) -> Vec<&MetricSample> {
        let sample_ms = self.config.sample_interval.as_millis().max(1);
        let per_report = (self.config.report_interval.as_millis() / sample_ms).max(2) as usize;
        let skip = self.history.len().saturating_sub(per_report);
        self.history.iter().skip(skip).collect()
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    pub fn generate_report(&self, now: Timestamp) -> DiagnosticReport {
        let window = self.window();

        if window.is_empty() {
            return DiagnosticReport {
                generated_at: now,
                sample_count: 0,
                status: HealthStatus::NoData,
                issues: Vec::new(),
                recommendations: vec!["Wait for the first health samples".to_string()],
                window: WindowSummary::default(),
                trend: Trend::InsufficientData,
                network: NetworkAnalysis {
                    stability: Stability::Stable,
                    rtt_std_dev_ms: 0.0,
                    throughput_kbps: 0.0,
                    bandwidth_adequate: false,
                    reliability_percent: 0.0,
                },
                audio: AudioAnalysis {
                    quality: AudioQuality::Silent,
                    consistent: true,
                    level_variance: 0.0,
                    issues: Vec::new(),
                },
            };
        }

        let rtts: Vec<f64> = window.iter().map(|s| s.rtt_ms).collect();
        let jitters: Vec<f64> = window.iter().map(|s| s.jitter_ms).collect();
        let losses: Vec<f64> = window.iter().map(|s| s.loss_rate()).collect();
        let audio: Vec<f64> = window.iter().map(|s| s.audio_level).collect();
        let scores: Vec<f64> = window.iter().map(|s| s.quality_score as f64).collect();

        let summary = WindowSummary {
            rtt_ms: MinAvgMax::from_values(&rtts),
            jitter_ms: MinAvgMax::from_values(&jitters),
            loss_rate: MinAvgMax::from_values(&losses),
            audio_level: MinAvgMax::from_values(&audio),
            quality_score: MinAvgMax::from_values(&scores),
        };
        let trend = trend_of(&scores);
        let network = self.analyze_network(&window, &rtts);
        let audio_analysis = analyze_audio(&audio);

        let mut issues = self.collect_issues(&summary, trend, &network, &audio_analysis);
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        let recommendations = recommendations_for(&issues);
        let status = classify(summary.quality_score.avg, &issues);

        DiagnosticReport {
            generated_at: now,
            sample_count: window.len(),
            status,
            issues,
            recommendations,
            window: summary,
            trend,
            network,
            audio: audio_analysis,
        }
    }

    fn analyze_network(&self, window: &[&MetricSample], rtts: &[f64]) -> NetworkAnalysis {
        let rtt_std_dev_ms = variance(rtts).sqrt();
        let stability = if rtt_std_dev_ms < 20.0 {
            Stability::Stable
        } else if rtt_std_dev_ms < 50.0 {
            Stability::Variable
        } else {
            Stability::Unstable
        };

        // Interval byte counts of every sample after the first span the window
        let throughput_kbps = match (window.first(), window.last()) {
            (Some(first), Some(last)) if last.timestamp > first.timestamp => {
                let bytes: u64 = window.iter().skip(1).map(|s| s.bytes_received).sum();
                let secs = (last.timestamp - first.timestamp).as_secs_f64();
                bytes as f64 * 8.0 / 1000.0 / secs
            }
            _ => 0.0,
        };

        let connected = window.iter().filter(|s| s.is_connected()).count();
        NetworkAnalysis {
            stability,
            rtt_std_dev_ms,
            throughput_kbps,
            bandwidth_adequate: throughput_kbps >= self.config.required_bitrate_kbps,
            reliability_percent: connected as f64 * 100.0 / window.len() as f64,
        }
    }

    fn collect_issues(
        &self,
        summary: &WindowSummary,
        trend: Trend,
        network: &NetworkAnalysis,
        audio: &AudioAnalysis,
    ) -> Vec<Issue> {
        let limits = &self.config.warnings;
        let mut issues = Vec::new();
        let mut push = |severity, category, description: String| {
            issues.push(Issue {
                severity,
                category,
                description,
            })
        };

        if network.reliability_percent < 50.0 {
            push(
                Severity::Critical,
                IssueCategory::Connectivity,
                format!("Connected only {:.0}% of the time", network.reliability_percent),
            );
        } else if network.reliability_percent < 90.0 {
            push(
                Severity::High,
                IssueCategory::Connectivity,
                format!("Connected {:.0}% of the time", network.reliability_percent),
            );
        }
        if summary.rtt_ms.avg > limits.high_rtt_ms {
            push(
                Severity::High,
                IssueCategory::Latency,
                format!("Average round trip {:.0}ms", summary.rtt_ms.avg),
            );
        }
        if summary.loss_rate.avg > limits.packet_loss {
            push(
                Severity::High,
                IssueCategory::PacketLoss,
                format!("Average packet loss {:.1}%", summary.loss_rate.avg * 100.0),
            );
        }
        if let Some(limit) = self.config.scoring.jitter_ms.last() {
            if summary.jitter_ms.avg > *limit {
                push(
                    Severity::Medium,
                    IssueCategory::Jitter,
                    format!("Average jitter {:.0}ms", summary.jitter_ms.avg),
                );
            }
        }
        if matches!(audio.quality, AudioQuality::Poor | AudioQuality::Silent) {
            push(
                Severity::Medium,
                IssueCategory::Audio,
                format!("Average audio level {:.3}", summary.audio_level.avg),
            );
        }
        if network.stability == Stability::Unstable {
            push(
                Severity::Medium,
                IssueCategory::Stability,
                format!("Round trip deviation {:.0}ms", network.rtt_std_dev_ms),
            );
        }
        if !network.bandwidth_adequate {
            push(
                Severity::Medium,
                IssueCategory::Bandwidth,
                format!(
                    "Throughput {:.0}kbps below {:.0}kbps",
                    network.throughput_kbps, self.config.required_bitrate_kbps
                ),
            );
        }
        if trend == Trend::Degrading {
            push(
                Severity::Low,
                IssueCategory::Trend,
                "Quality is trending down".to_string(),
            );
        }
        issues
    }
}

// ----------------------------------------------------------------------------
// Analysis Helpers
// ----------------------------------------------------------------------------

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let avg = mean(values);
    values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64
}

/// Compare the mean score of the first and second half with a 5 point band
fn trend_of(scores: &[f64]) -> Trend {
    if scores.len() < 2 {
        return Trend::InsufficientData;
    }
    let (first, second) = scores.split_at(scores.len() / 2);
    let delta = mean(second) - mean(first);
    if delta > 5.0 {
        Trend::Improving
    } else if delta < -5.0 {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

fn analyze_audio(levels: &[f64]) -> AudioAnalysis {
    let avg = mean(levels);
    let level_variance = variance(levels);
    let quality = if avg >= 0.1 {
        AudioQuality::Good
    } else if avg >= 0.05 {
        AudioQuality::Fair
    } else if avg >= 0.01 {
        AudioQuality::Poor
    } else {
        AudioQuality::Silent
    };
    let consistent = level_variance.sqrt() < 0.05;

    let mut issues = Vec::new();
    match quality {
        AudioQuality::Silent => issues.push("No audio detected".to_string()),
        AudioQuality::Poor => issues.push("Audio level is low".to_string()),
        _ => {}
    }
    if !consistent {
        issues.push("Audio level fluctuates".to_string());
    }

    AudioAnalysis {
        quality,
        consistent,
        level_variance,
        issues,
    }
}

fn recommendations_for(issues: &[Issue]) -> Vec<String> {
    let mut recommendations: Vec<String> = Vec::new();
    for issue in issues {
        let text = match issue.category {
            IssueCategory::Connectivity => "Check network connectivity or move closer to the access point",
            IssueCategory::Latency => "Prefer a direct or closer relay path to reduce latency",
            IssueCategory::PacketLoss => "Lower the bitrate to reduce packet loss",
            IssueCategory::Jitter => "Increase the jitter buffer size",
            IssueCategory::Audio => "Check the guide's microphone level",
            IssueCategory::Stability => "Avoid switching networks during the tour",
            IssueCategory::Bandwidth => "Reduce audio quality to fit available bandwidth",
            IssueCategory::Trend => "Monitor the session; quality is declining",
        };
        if !recommendations.iter().any(|r| r == text) {
            recommendations.push(text.to_string());
        }
    }
    recommendations
}

fn classify(avg_score: f64, issues: &[Issue]) -> HealthStatus {
    let grade = QualityGrade::from_score(avg_score.round().clamp(0.0, 100.0) as u8);
    let worst = issues.iter().map(|i| i.severity).max();
    match (grade, worst) {
        (QualityGrade::Critical, _) | (_, Some(Severity::Critical)) => HealthStatus::Critical,
        (QualityGrade::Poor, _) => HealthStatus::Unhealthy,
        (QualityGrade::Fair, _) | (_, Some(Severity::High)) => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_inputs() -> ScoreInputs {
        ScoreInputs {
            rtt_ms: 40.0,
            jitter_ms: 5.0,
            loss_rate: 0.0,
            audio_level: 0.3,
            connection_state: TransportState::Connected,
            ice_state: IceConnectionState::Connected,
        }
    }

    fn stats(rtt_ms: f64, lost: u64, received: u64, bytes: u64, audio: f64) -> TransportStats {
        TransportStats {
            rtt_ms,
            jitter_ms: 5.0,
            packets_lost: lost,
            packets_received: received,
            bytes_received: bytes,
            audio_level: audio,
            connection_state: TransportState::Connected,
            ice_state: IceConnectionState::Connected,
            selected_candidate_type: Some("host".into()),
        }
    }

    #[test]
    fn test_perfect_score() {
        assert_eq!(quality_score(&healthy_inputs(), &ScoreThresholds::default()), 100);
    }

    #[test]
    fn test_cascading_deductions() {
        let thresholds = ScoreThresholds::default();
        let mut inputs = healthy_inputs();

        inputs.rtt_ms = 200.0;
        assert_eq!(quality_score(&inputs, &thresholds), 85);
        inputs.rtt_ms = 350.0;
        assert_eq!(quality_score(&inputs, &thresholds), 70);
        inputs.rtt_ms = 600.0;
        assert_eq!(quality_score(&inputs, &thresholds), 50);

        inputs = healthy_inputs();
        inputs.jitter_ms = 40.0;
        assert_eq!(quality_score(&inputs, &thresholds), 90);
        inputs.jitter_ms = 60.0;
        assert_eq!(quality_score(&inputs, &thresholds), 75);

        inputs = healthy_inputs();
        inputs.loss_rate = 0.04;
        assert_eq!(quality_score(&inputs, &thresholds), 60);
    }

    #[test]
    fn test_score_clamped_at_zero() {
        let inputs = ScoreInputs {
            rtt_ms: 900.0,
            jitter_ms: 90.0,
            loss_rate: 0.5,
            audio_level: 0.0,
            connection_state: TransportState::Disconnected,
            ice_state: IceConnectionState::Disconnected,
        };
        assert_eq!(quality_score(&inputs, &ScoreThresholds::default()), 0);
    }

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(QualityGrade::from_score(85), QualityGrade::Excellent);
        assert_eq!(QualityGrade::from_score(84), QualityGrade::Good);
        assert_eq!(QualityGrade::from_score(70), QualityGrade::Good);
        assert_eq!(QualityGrade::from_score(50), QualityGrade::Fair);
        assert_eq!(QualityGrade::from_score(25), QualityGrade::Poor);
        assert_eq!(QualityGrade::from_score(24), QualityGrade::Critical);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = HealthConfig {
            history_size: 3,
            ..HealthConfig::default()
        };
        let mut monitor = HealthMonitor::new(config, Timestamp::new(0));
        for i in 0..5 {
            monitor.record(&stats(50.0, 0, 100 * (i + 1), 0, 0.3), Timestamp::new(i * 5_000));
        }
        assert_eq!(monitor.history_len(), 3);
        assert_eq!(monitor.total_samples(), 5);
        assert_eq!(monitor.latest().unwrap().timestamp, Timestamp::new(20_000));
    }

    #[test]
    fn test_loss_rate_uses_interval_deltas() {
        let mut monitor = HealthMonitor::new(HealthConfig::default(), Timestamp::new(0));
        monitor.record(&stats(50.0, 50, 950, 0, 0.3), Timestamp::new(0));
        let outcome = monitor.record(&stats(50.0, 50, 1950, 0, 0.3), Timestamp::new(5_000));
        assert_eq!(outcome.sample.packets_lost, 0);
        assert_eq!(outcome.sample.packets_received, 1000);
        assert_eq!(outcome.sample.loss_rate(), 0.0);
    }

    #[test]
    fn test_warnings_and_alerts() {
        let mut monitor = HealthMonitor::new(HealthConfig::default(), Timestamp::new(0));
        let outcome = monitor.record(&stats(400.0, 10, 90, 0, 0.01), Timestamp::new(0));
        let kinds: Vec<_> = outcome.warnings.iter().map(|w| w.kind).collect();
        assert!(kinds.contains(&WarningKind::HighRtt));
        assert!(kinds.contains(&WarningKind::PacketLoss));
        assert!(kinds.contains(&WarningKind::LowAudio));
        assert_eq!(outcome.alert.unwrap().reason, AlertReason::QualityCritical);

        let mut failed = stats(50.0, 0, 0, 0, 0.3);
        failed.connection_state = TransportState::Failed;
        let outcome = monitor.record(&failed, Timestamp::new(5_000));
        assert_eq!(outcome.alert.unwrap().reason, AlertReason::TransportFailed);
        assert_eq!(monitor.alerts_raised(), 2);
    }

    #[test]
    fn test_report_trend_and_throughput() {
        let mut monitor = HealthMonitor::new(HealthConfig::default(), Timestamp::new(0));
        let mut received = 0;
        let mut bytes = 0;
        for i in 0..12u64 {
            received += 250;
            bytes += 40_000;
            let rtt = if i < 6 { 450.0 } else { 50.0 };
            monitor.record(&stats(rtt, 0, received, bytes, 0.3), Timestamp::new(i * 5_000));
        }
        let report = monitor.generate_report(Timestamp::new(60_000));
        assert_eq!(report.sample_count, 12);
        assert_eq!(report.trend, Trend::Improving);
        assert_eq!(report.window.rtt_ms.max, 450.0);
        assert_eq!(report.window.rtt_ms.min, 50.0);
        assert_eq!(report.network.reliability_percent, 100.0);
        assert!((report.network.throughput_kbps - 64.0).abs() < 0.01);
        assert!(report.network.bandwidth_adequate);
        assert_eq!(report.network.stability, Stability::Unstable);
        assert_eq!(report.audio.quality, AudioQuality::Good);
    }

    #[test]
    fn test_report_without_samples() {
        let monitor = HealthMonitor::new(HealthConfig::default(), Timestamp::new(0));
        let report = monitor.generate_report(Timestamp::new(1));
        assert_eq!(report.status, HealthStatus::NoData);
        assert_eq!(report.trend, Trend::InsufficientData);
    }

    #[test]
    fn test_issues_ranked_by_severity() {
        let mut monitor = HealthMonitor::new(HealthConfig::default(), Timestamp::new(0));
        for i in 0..4u64 {
            let mut s = stats(400.0, 0, 100 * (i + 1), 0, 0.0);
            if i % 2 == 0 {
                s.connection_state = TransportState::Disconnected;
            }
            monitor.record(&s, Timestamp::new(i * 5_000));
        }
        let report = monitor.generate_report(Timestamp::new(20_000));
        let severities: Vec<_> = report.issues.iter().map(|i| i.severity).collect();
        let mut sorted = severities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(severities, sorted);
        assert_eq!(report.issues[0].category, IssueCategory::Connectivity);
        assert!(!report.recommendations.is_empty());
    }
}
