//! Graceful Degradation
//!
//! A five-level quality ladder. Each level carries a [`FallbackStrategy`]:
//! the trigger thresholds that push the session one level down and the
//! transport settings applied while at that level. Normal adaptation moves
//! one adjacent level per cooldown window; the emergency path jumps straight
//! to the configured emergency level and may then step down to the floor.

use core::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{duration_ms, DegradationConfig};
use crate::health::MetricSample;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Quality Ladder
// ----------------------------------------------------------------------------

/// Ladder position, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Maximum,
    High,
    Medium,
    Low,
    Minimum,
}

impl QualityLevel {
    pub const ALL: [QualityLevel; 5] = [
        QualityLevel::Maximum,
        QualityLevel::High,
        QualityLevel::Medium,
        QualityLevel::Low,
        QualityLevel::Minimum,
    ];

    /// Next level down, if any
    pub fn lower(&self) -> Option<QualityLevel> {
        match self {
            QualityLevel::Maximum => Some(QualityLevel::High),
            QualityLevel::High => Some(QualityLevel::Medium),
            QualityLevel::Medium => Some(QualityLevel::Low),
            QualityLevel::Low => Some(QualityLevel::Minimum),
            QualityLevel::Minimum => None,
        }
    }

    /// Next level up, if any
    pub fn higher(&self) -> Option<QualityLevel> {
        match self {
            QualityLevel::Maximum => None,
            QualityLevel::High => Some(QualityLevel::Maximum),
            QualityLevel::Medium => Some(QualityLevel::High),
            QualityLevel::Low => Some(QualityLevel::Medium),
            QualityLevel::Minimum => Some(QualityLevel::Low),
        }
    }

    pub fn is_adjacent(&self, other: QualityLevel) -> bool {
        self.lower() == Some(other) || self.higher() == Some(other)
    }
}

/// Thresholds that trigger a downgrade from a level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triggers {
    pub max_rtt_ms: f64,
    pub max_packet_loss: f64,
    pub max_jitter_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_audio_level: Option<f64>,
    #[serde(rename = "adaptation_cooldown_ms", with = "duration_ms")]
    pub adaptation_cooldown: Duration,
}

/// Transport settings applied at a level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySettings {
    pub codec: String,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub buffer_size: u32,
    #[serde(rename = "connection_timeout_ms", with = "duration_ms")]
    pub connection_timeout: Duration,
    #[serde(rename = "ice_timeout_ms", with = "duration_ms")]
    pub ice_timeout: Duration,
}

/// One ladder position's triggers and settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackStrategy {
    pub level: QualityLevel,
    pub triggers: Triggers,
    pub settings: StrategySettings,
}

fn strategy(
    level: QualityLevel,
    limits: (f64, f64, f64, Option<f64>),
    cooldown_secs: u64,
    bitrate_kbps: u32,
    sample_rate: u32,
    buffer_size: u32,
) -> FallbackStrategy {
    let (max_rtt_ms, max_packet_loss, max_jitter_ms, min_audio_level) = limits;
    FallbackStrategy {
        level,
        triggers: Triggers {
            max_rtt_ms,
            max_packet_loss,
            max_jitter_ms,
            min_audio_level,
            adaptation_cooldown: Duration::from_secs(cooldown_secs),
        },
        settings: StrategySettings {
            codec: "opus".to_string(),
            bitrate_kbps,
            sample_rate,
            buffer_size,
            connection_timeout: Duration::from_secs(10 + 5 * level as u64),
            ice_timeout: Duration::from_secs(5 + 5 * level as u64),
        },
    }
}

/// Default five-level ladder
pub fn default_ladder() -> Vec<FallbackStrategy> {
    vec![
        strategy(QualityLevel::Maximum, (150.0, 0.005, 30.0, Some(0.03)), 10, 128, 48_000, 256),
        strategy(QualityLevel::High, (200.0, 0.01, 40.0, Some(0.05)), 10, 96, 48_000, 512),
        strategy(QualityLevel::Medium, (300.0, 0.03, 60.0, Some(0.05)), 15, 64, 48_000, 1024),
        strategy(QualityLevel::Low, (500.0, 0.05, 100.0, Some(0.05)), 20, 32, 24_000, 2048),
        strategy(QualityLevel::Minimum, (1000.0, 0.10, 200.0, None), 30, 16, 16_000, 4096),
    ]
}

// ----------------------------------------------------------------------------
// Device Context
// ----------------------------------------------------------------------------

/// Device and network context used to pick the starting level
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub is_mobile: bool,
    pub constrained_bandwidth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_bandwidth_kbps: Option<f64>,
}

impl DeviceProfile {
    pub fn starting_level(&self) -> QualityLevel {
        let constrained = self.constrained_bandwidth
            || self.estimated_bandwidth_kbps.is_some_and(|kbps| kbps < 128.0);
        if constrained {
            QualityLevel::Low
        } else if self.is_mobile {
            QualityLevel::Medium
        } else {
            QualityLevel::High
        }
    }
}

// ----------------------------------------------------------------------------
// Quality Changes
// ----------------------------------------------------------------------------

/// Metrics the ladder is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub rtt_ms: f64,
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub audio_level: f64,
}

impl From<&MetricSample> for QualityMetrics {
    fn from(sample: &MetricSample) -> Self {
        Self {
            rtt_ms: sample.rtt_ms,
            packet_loss: sample.loss_rate(),
            jitter_ms: sample.jitter_ms,
            audio_level: sample.audio_level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeReason {
    /// A current-level trigger was breached
    Degraded { breaches: Vec<String> },
    /// All metrics stayed well inside the current thresholds
    Upgraded,
    /// Critical alert jump
    Emergency,
    /// One step of the emergency fallback
    EmergencyStep,
    /// Operator override
    Manual,
}

/// A level transition and the settings now in effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityChange {
    pub from: QualityLevel,
    pub to: QualityLevel,
    pub reason: ChangeReason,
    pub settings: StrategySettings,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Degradation Manager
// ----------------------------------------------------------------------------

/// Ladder state machine for one session
#[derive(Debug)]
pub struct DegradationManager {
    config: DegradationConfig,
    level: QualityLevel,
    last_transition: Option<Timestamp>,
    transitions: u64,
}

impl DegradationManager {
    pub fn new(config: DegradationConfig) -> Self {
        let level = config.device.starting_level();
        debug!(?level, "Starting quality level");
        Self {
            config,
            level,
            last_transition: None,
            transitions: 0,
        }
    }

    pub fn current_level(&self) -> QualityLevel {
        self.level
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn current_strategy(&self) -> Option<&FallbackStrategy> {
        self.config.strategy(self.level)
    }

    pub fn is_at_floor(&self) -> bool {
        self.level >= self.config.floor_level
    }

    /// True while the current level's cooldown has not elapsed
    pub fn in_cooldown(&self, now: Timestamp) -> bool {
        match (self.last_transition, self.current_strategy()) {
            (Some(last), Some(strategy)) => {
                now.duration_since(last) < strategy.triggers.adaptation_cooldown
            }
            _ => false,
        }
    }

    /// Evaluate one health sample against the current level
    ///
    /// Degrades one level on any breach and upgrades one level when every
    /// metric is comfortably inside the thresholds. At most one transition per
    /// cooldown window.
    pub fn evaluate(&mut self, metrics: &QualityMetrics, now: Timestamp) -> Option<QualityChange> {
        if self.in_cooldown(now) {
            return None;
        }
        let triggers = self.current_strategy()?.triggers.clone();

        let breaches = breached_triggers(&triggers, metrics);
        if !breaches.is_empty() {
            let target = self.level.lower()?;
            return self.move_to(target, ChangeReason::Degraded { breaches }, now);
        }

        if self.comfortably_within(&triggers, metrics) {
            let target = self.level.higher()?;
            return self.move_to(target, ChangeReason::Upgraded, now);
        }
        None
    }

    fn comfortably_within(&self, triggers: &Triggers, metrics: &QualityMetrics) -> bool {
        let factor = self.config.upgrade_hysteresis;
        let audio_ok = match triggers.min_audio_level {
            Some(floor) => metrics.audio_level >= floor / factor,
            None => true,
        };
        metrics.rtt_ms < triggers.max_rtt_ms * factor
            && metrics.packet_loss < triggers.max_packet_loss * factor
            && metrics.jitter_ms < triggers.max_jitter_ms * factor
            && audio_ok
    }

    /// Critical-alert path: jump to the emergency level ignoring cooldown
    ///
    /// Already at or below the emergency level, this takes one further step
    /// toward the floor instead.
    pub fn emergency(&mut self, now: Timestamp) -> Option<QualityChange> {
        let emergency_level = self.config.emergency_level;
        if self.level < emergency_level {
            warn!(from = ?self.level, to = ?emergency_level, "Emergency quality fallback");
            return self.move_to(emergency_level, ChangeReason::Emergency, now);
        }
        self.step_down_emergency(now)
    }

    /// One emergency step toward the floor; `None` once at the floor
    pub fn step_down_emergency(&mut self, now: Timestamp) -> Option<QualityChange> {
        if self.is_at_floor() {
            return None;
        }
        let target = self.level.lower()?;
        self.move_to(target, ChangeReason::EmergencyStep, now)
    }

    /// Walk to `target` one adjacent level at a time
    pub fn set_level(&mut self, target: QualityLevel, now: Timestamp) -> Vec<QualityChange> {
        let mut changes = Vec::new();
        while self.level != target {
            let next = if target > self.level {
                self.level.lower()
            } else {
                self.level.higher()
            };
            let Some(next) = next else { break };
            match self.move_to(next, ChangeReason::Manual, now) {
                Some(change) => changes.push(change),
                None => break,
            }
        }
        changes
    }

    fn move_to(
        &mut self,
        target: QualityLevel,
        reason: ChangeReason,
        now: Timestamp,
    ) -> Option<QualityChange> {
        let settings = self.config.strategy(target)?.settings.clone();
        let change = QualityChange {
            from: self.level,
            to: target,
            reason,
            settings,
            timestamp: now,
        };
        info!(from = ?change.from, to = ?change.to, reason = ?change.reason, "Quality level changed");
        self.level = target;
        self.last_transition = Some(now);
        self.transitions += 1;
        Some(change)
    }
}

fn breached_triggers(triggers: &Triggers, metrics: &QualityMetrics) -> Vec<String> {
    let mut breaches = Vec::new();
    if metrics.rtt_ms > triggers.max_rtt_ms {
        breaches.push(format!("rtt {:.0}ms > {:.0}ms", metrics.rtt_ms, triggers.max_rtt_ms));
    }
    if metrics.packet_loss > triggers.max_packet_loss {
        breaches.push(format!(
            "packet loss {:.2}% > {:.2}%",
            metrics.packet_loss * 100.0,
            triggers.max_packet_loss * 100.0
        ));
    }
    if metrics.jitter_ms > triggers.max_jitter_ms {
        breaches.push(format!(
            "jitter {:.0}ms > {:.0}ms",
            metrics.jitter_ms, triggers.max_jitter_ms
        ));
    }
    if let Some(floor) = triggers.min_audio_level {
        if metrics.audio_level < floor {
            breaches.push(format!("audio level {:.3} < {:.3}", metrics.audio_level, floor));
        }
    }
    breaches
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(rtt_ms: f64, packet_loss: f64, jitter_ms: f64, audio_level: f64) -> QualityMetrics {
        QualityMetrics {
            rtt_ms,
            packet_loss,
            jitter_ms,
            audio_level,
        }
    }

    fn ts(secs: u64) -> Timestamp {
        Timestamp::new(secs * 1_000)
    }

    #[test]
    fn test_default_start_level() {
        let manager = DegradationManager::new(DegradationConfig::default());
        assert_eq!(manager.current_level(), QualityLevel::High);
    }

    #[test]
    fn test_device_profile_start_levels() {
        let mobile = DeviceProfile {
            is_mobile: true,
            ..DeviceProfile::default()
        };
        assert_eq!(mobile.starting_level(), QualityLevel::Medium);

        let slow = DeviceProfile {
            estimated_bandwidth_kbps: Some(64.0),
            ..DeviceProfile::default()
        };
        assert_eq!(slow.starting_level(), QualityLevel::Low);
    }

    #[test]
    fn test_breach_degrades_one_level() {
        let mut manager = DegradationManager::new(DegradationConfig::default());
        let change = manager
            .evaluate(&metrics(250.0, 0.005, 20.0, 0.08), ts(100))
            .unwrap();
        assert_eq!(change.from, QualityLevel::High);
        assert_eq!(change.to, QualityLevel::Medium);
        assert_eq!(change.settings.bitrate_kbps, 64);
        assert!(matches!(change.reason, ChangeReason::Degraded { ref breaches } if breaches.len() == 1));
    }

    #[test]
    fn test_cooldown_blocks_second_transition() {
        let mut manager = DegradationManager::new(DegradationConfig::default());
        let bad = metrics(2_000.0, 0.2, 300.0, 0.0);

        assert!(manager.evaluate(&bad, ts(100)).is_some());
        // Medium cooldown is 15 s
        assert!(manager.evaluate(&bad, ts(110)).is_none());
        assert!(manager.in_cooldown(ts(114)));
        let change = manager.evaluate(&bad, ts(115)).unwrap();
        assert_eq!(change.to, QualityLevel::Low);
    }

    #[test]
    fn test_upgrade_requires_hysteresis_margin() {
        let mut manager = DegradationManager::new(DegradationConfig::default());
        // High: rtt 200, loss 1%, jitter 40, audio 0.05; margin 0.6
        assert!(manager
            .evaluate(&metrics(150.0, 0.001, 10.0, 0.2), ts(100))
            .is_none());
        let change = manager
            .evaluate(&metrics(100.0, 0.001, 10.0, 0.2), ts(100))
            .unwrap();
        assert_eq!(change.to, QualityLevel::Maximum);
        assert_eq!(change.reason, ChangeReason::Upgraded);
    }

    #[test]
    fn test_emergency_bypasses_cooldown_then_steps_to_floor() {
        let mut manager = DegradationManager::new(DegradationConfig::default());
        manager
            .evaluate(&metrics(250.0, 0.0, 0.0, 0.2), ts(100))
            .unwrap();
        assert!(manager.in_cooldown(ts(101)));

        let jump = manager.emergency(ts(101)).unwrap();
        assert_eq!(jump.from, QualityLevel::Medium);
        assert_eq!(jump.to, QualityLevel::Low);
        assert_eq!(jump.reason, ChangeReason::Emergency);

        let step = manager.step_down_emergency(ts(101)).unwrap();
        assert_eq!(step.to, QualityLevel::Minimum);
        assert!(manager.is_at_floor());
        assert!(manager.step_down_emergency(ts(102)).is_none());
    }

    #[test]
    fn test_manual_level_walks_adjacent_levels() {
        let mut manager = DegradationManager::new(DegradationConfig::default());
        let changes = manager.set_level(QualityLevel::Minimum, ts(1));
        let path: Vec<_> = changes.iter().map(|c| c.to).collect();
        assert_eq!(
            path,
            vec![QualityLevel::Medium, QualityLevel::Low, QualityLevel::Minimum]
        );
        assert!(changes.iter().all(|c| c.from.is_adjacent(c.to)));
        assert!(changes.iter().all(|c| c.reason == ChangeReason::Manual));

        let back = manager.set_level(QualityLevel::Maximum, ts(2));
        assert_eq!(back.len(), 4);
        assert_eq!(manager.current_level(), QualityLevel::Maximum);
    }

    #[test]
    fn test_floor_does_not_degrade_further() {
        let mut manager = DegradationManager::new(DegradationConfig::default());
        manager.set_level(QualityLevel::Minimum, ts(0));
        assert!(manager
            .evaluate(&metrics(5_000.0, 0.5, 500.0, 0.0), ts(1_000))
            .is_none());
    }
}
