//! Centralized Configuration Management
//!
//! Every tunable of the session subsystem lives here, grouped per component and
//! consolidated in [`TourlinkConfig`]. Durations are written as milliseconds in
//! TOML (`*_ms` keys).

use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::degradation::{default_ladder, DeviceProfile, FallbackStrategy, QualityLevel};
use crate::errors::{TourlinkError, TourlinkResult};
use crate::health::{ScoreThresholds, WarningThresholds};

/// Serde adapter writing a [`Duration`] as integer milliseconds
pub mod duration_ms {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// ----------------------------------------------------------------------------
// ICE Candidate Batching
// ----------------------------------------------------------------------------

/// Configuration for the ICE candidate batcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Buffered candidates that trigger an immediate flush
    pub max_batch_size: usize,
    /// Deadline measured from the first unflushed candidate
    #[serde(rename = "flush_timeout_ms", with = "duration_ms")]
    pub flush_timeout: Duration,
    /// Batches unacknowledged for longer than this count as undelivered
    #[serde(rename = "ack_timeout_ms", with = "duration_ms")]
    pub ack_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            flush_timeout: Duration::from_millis(200),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

// ----------------------------------------------------------------------------
// Signaling Configuration
// ----------------------------------------------------------------------------

/// Configuration for the signaling coordinator and its store usage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Liveness not refreshed within this window reads as disconnected
    #[serde(rename = "participant_ttl_ms", with = "duration_ms")]
    pub participant_ttl: Duration,
    #[serde(rename = "coordination_ttl_ms", with = "duration_ms")]
    pub coordination_ttl: Duration,
    #[serde(rename = "ice_candidate_ttl_ms", with = "duration_ms")]
    pub ice_candidate_ttl: Duration,
    #[serde(rename = "message_ttl_ms", with = "duration_ms")]
    pub message_ttl: Duration,
    /// Attempts for one optimistic read-modify-write before giving up
    pub max_transaction_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
    /// Poll period of `wait_for_peer_ready`
    #[serde(rename = "ready_poll_interval_ms", with = "duration_ms")]
    pub ready_poll_interval: Duration,
    /// Poll period for inbound messages and remote candidates
    #[serde(rename = "inbound_poll_interval_ms", with = "duration_ms")]
    pub inbound_poll_interval: Duration,
    /// Upper bound for any single best-effort write during teardown
    #[serde(rename = "teardown_write_timeout_ms", with = "duration_ms")]
    pub teardown_write_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            participant_ttl: Duration::from_secs(300),
            coordination_ttl: Duration::from_secs(300),
            ice_candidate_ttl: Duration::from_secs(120),
            message_ttl: Duration::from_secs(300),
            max_transaction_attempts: 5,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            ready_poll_interval: Duration::from_millis(500),
            inbound_poll_interval: Duration::from_millis(250),
            teardown_write_timeout: Duration::from_millis(500),
        }
    }
}

impl SignalingConfig {
    /// Backoff before retry number `attempt` (1-based), capped at `max_backoff`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor as f64) as u64;
        Duration::from_millis(millis).min(self.max_backoff)
    }

    /// Create configuration optimized for testing (fast polling, tiny backoff)
    pub fn testing() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            ready_poll_interval: Duration::from_millis(10),
            inbound_poll_interval: Duration::from_millis(10),
            teardown_write_timeout: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Health Monitoring Configuration
// ----------------------------------------------------------------------------

/// Configuration for metric sampling, scoring and reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "sample_interval_ms", with = "duration_ms")]
    pub sample_interval: Duration,
    /// Rolling history capacity (120 samples at 5 s is ten minutes)
    pub history_size: usize,
    #[serde(rename = "report_interval_ms", with = "duration_ms")]
    pub report_interval: Duration,
    pub scoring: ScoreThresholds,
    pub warnings: WarningThresholds,
    /// Throughput below this is reported as inadequate bandwidth
    pub required_bitrate_kbps: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            history_size: 120,
            report_interval: Duration::from_secs(60),
            scoring: ScoreThresholds::default(),
            warnings: WarningThresholds::default(),
            required_bitrate_kbps: 32.0,
        }
    }
}

impl HealthConfig {
    pub fn testing() -> Self {
        Self {
            sample_interval: Duration::from_millis(50),
            history_size: 20,
            report_interval: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Recovery Configuration
// ----------------------------------------------------------------------------

/// Configuration for failure recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    /// Minimum spacing between two attempts
    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    pub cooldown: Duration,
    pub max_concurrent_recoveries: usize,
    /// A strategy that has not resolved within this window counts as failed
    #[serde(rename = "attempt_timeout_ms", with = "duration_ms")]
    pub attempt_timeout: Duration,
    /// Recovery sessions retained for diagnostics
    pub history_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            cooldown: Duration::from_secs(3),
            max_concurrent_recoveries: 1,
            attempt_timeout: Duration::from_secs(10),
            history_size: 20,
        }
    }
}

impl RecoveryConfig {
    pub fn testing() -> Self {
        Self {
            cooldown: Duration::from_millis(20),
            // Long enough for a full re-signal, which waits out a batch flush
            attempt_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Degradation Configuration
// ----------------------------------------------------------------------------

/// Configuration for the quality ladder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// One strategy per ladder level, best first
    pub ladder: Vec<FallbackStrategy>,
    /// Fraction of the current thresholds all metrics must stay under to upgrade
    pub upgrade_hysteresis: f64,
    /// Level a critical alert jumps to, bypassing cooldown
    pub emergency_level: QualityLevel,
    /// Lowest level the emergency fallback may step down to
    pub floor_level: QualityLevel,
    /// Wait between emergency steps before re-checking health
    #[serde(rename = "emergency_step_wait_ms", with = "duration_ms")]
    pub emergency_step_wait: Duration,
    /// Device/network context used to pick the starting level
    pub device: DeviceProfile,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            ladder: default_ladder(),
            upgrade_hysteresis: 0.6,
            emergency_level: QualityLevel::Low,
            floor_level: QualityLevel::Minimum,
            emergency_step_wait: Duration::from_secs(2),
            device: DeviceProfile::default(),
        }
    }
}

impl DegradationConfig {
    pub fn strategy(&self, level: QualityLevel) -> Option<&FallbackStrategy> {
        self.ladder.iter().find(|strategy| strategy.level == level)
    }

    pub fn testing() -> Self {
        Self {
            emergency_step_wait: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for per-session channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of the transport event intake channel
    pub transport_event_buffer_size: usize,
    /// Transitions kept in the state machine audit trail
    pub audit_trail_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transport_event_buffer_size: 128,
            audit_trail_size: 256,
        }
    }
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Master configuration consolidating every component's settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TourlinkConfig {
    pub batching: BatchConfig,
    pub signaling: SignalingConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub degradation: DegradationConfig,
    pub channels: ChannelConfig,
}

impl TourlinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration for phones on cellular links
    pub fn mobile_optimized() -> Self {
        Self {
            degradation: DegradationConfig {
                device: DeviceProfile {
                    is_mobile: true,
                    ..DeviceProfile::default()
                },
                ..DegradationConfig::default()
            },
            health: HealthConfig {
                history_size: 60,
                ..HealthConfig::default()
            },
            ..Self::default()
        }
    }

    /// Create configuration optimized for testing (short timers everywhere)
    pub fn testing() -> Self {
        Self {
            batching: BatchConfig::default(),
            signaling: SignalingConfig::testing(),
            health: HealthConfig::testing(),
            recovery: RecoveryConfig::testing(),
            degradation: DegradationConfig::testing(),
            channels: ChannelConfig::default(),
        }
    }

    pub fn with_batching(mut self, batching: BatchConfig) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_signaling(mut self, signaling: SignalingConfig) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_degradation(mut self, degradation: DegradationConfig) -> Self {
        self.degradation = degradation;
        self
    }

    /// Parse a TOML document; missing sections fall back to defaults
    pub fn from_toml_str(source: &str) -> TourlinkResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| TourlinkError::config_error(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> TourlinkResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            TourlinkError::config_error(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> TourlinkResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TourlinkError::config_error(format!("cannot encode TOML: {e}")))
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> TourlinkResult<()> {
        if self.batching.max_batch_size == 0 {
            return Err(TourlinkError::config_error("batching.max_batch_size must be > 0"));
        }
        if self.signaling.max_transaction_attempts == 0 {
            return Err(TourlinkError::config_error(
                "signaling.max_transaction_attempts must be > 0",
            ));
        }
        if self.health.history_size == 0 {
            return Err(TourlinkError::config_error("health.history_size must be > 0"));
        }
        if self.recovery.max_concurrent_recoveries == 0 {
            return Err(TourlinkError::config_error(
                "recovery.max_concurrent_recoveries must be > 0",
            ));
        }
        if self.recovery.attempt_timeout <= self.batching.flush_timeout {
            return Err(TourlinkError::config_error(
                "recovery.attempt_timeout must exceed batching.flush_timeout",
            ));
        }
        let hysteresis = self.degradation.upgrade_hysteresis;
        if !(hysteresis > 0.0 && hysteresis < 1.0) {
            return Err(TourlinkError::config_error(
                "degradation.upgrade_hysteresis must be within (0, 1)",
            ));
        }
        for level in QualityLevel::ALL {
            if self.degradation.strategy(level).is_none() {
                return Err(TourlinkError::config_error(format!(
                    "degradation.ladder has no strategy for {level:?}"
                )));
            }
        }
        if self.degradation.emergency_level > self.degradation.floor_level {
            return Err(TourlinkError::config_error(
                "degradation.emergency_level must not be below floor_level",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = TourlinkConfig::default();
        assert_eq!(config.batching.max_batch_size, 5);
        assert_eq!(config.batching.flush_timeout, Duration::from_millis(200));
        assert_eq!(config.signaling.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.signaling.participant_ttl, Duration::from_secs(300));
        assert_eq!(config.signaling.ice_candidate_ttl, Duration::from_secs(120));
        assert_eq!(config.health.history_size, 120);
        assert_eq!(config.recovery.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = SignalingConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(25));
        assert_eq!(config.backoff_for(2), Duration::from_millis(50));
        assert_eq!(config.backoff_for(3), Duration::from_millis(100));
        assert_eq!(config.backoff_for(20), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = TourlinkConfig::from_toml_str(
            r#"
            [batching]
            max_batch_size = 8
            flush_timeout_ms = 150

            [recovery]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.batching.max_batch_size, 8);
        assert_eq!(config.batching.flush_timeout, Duration::from_millis(150));
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.recovery.cooldown, Duration::from_secs(3));
        assert_eq!(config.signaling.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_toml_round_trip_keeps_ladder() {
        let config = TourlinkConfig::default();
        let encoded = config.to_toml_string().unwrap();
        let decoded = TourlinkConfig::from_toml_str(&encoded).unwrap();
        assert_eq!(decoded.degradation.ladder.len(), 5);
    }

    #[test]
    fn test_validation_rejects_bad_hysteresis() {
        let mut config = TourlinkConfig::default();
        config.degradation.upgrade_hysteresis = 1.5;
        assert!(config.validate().is_err());

        let mut config = TourlinkConfig::default();
        config.batching.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_attempt_timeout_must_cover_a_batch_flush() {
        assert!(TourlinkConfig::testing().validate().is_ok());

        let mut config = TourlinkConfig::testing();
        config.recovery.attempt_timeout = config.batching.flush_timeout;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mobile_preset_marks_device() {
        let config = TourlinkConfig::mobile_optimized();
        assert!(config.degradation.device.is_mobile);
    }
}
