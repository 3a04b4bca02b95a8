//! Core types for tour audio sessions
//!
//! Identity of a session (tour, language, participant, role) and the time
//! primitives every policy in this crate is driven by.

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::ValidationError;

// ----------------------------------------------------------------------------
// Role
// ----------------------------------------------------------------------------

/// Which side of a tour audio link a participant plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The broadcaster; creates offers
    Guide,
    /// A receiver; answers the guide's offer
    Attendee,
}

impl Role {
    /// The role on the other end of the link
    pub fn peer(&self) -> Role {
        match self {
            Role::Guide => Role::Attendee,
            Role::Attendee => Role::Guide,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guide => "guide",
            Role::Attendee => "attendee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Participant Identifier
// ----------------------------------------------------------------------------

/// Opaque identifier of a participant within a tour
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Validate and wrap a participant id
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::MissingParticipantId);
        }
        if id.contains(':') {
            return Err(ValidationError::InvalidIdentifier {
                field: "participant_id",
                value: id,
            });
        }
        Ok(Self(id))
    }

    /// Generate a random participant id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Session Key
// ----------------------------------------------------------------------------

/// Composite key identifying one live session: (tour, language, participant)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub tour_id: String,
    pub language: String,
    pub participant_id: ParticipantId,
}

impl SessionKey {
    pub fn new(
        tour_id: impl Into<String>,
        language: impl Into<String>,
        participant_id: ParticipantId,
    ) -> Result<Self, ValidationError> {
        let tour_id = tour_id.into();
        let language = language.into();
        validate_segment("tour_id", &tour_id)?;
        validate_segment("language", &language)?;
        Ok(Self {
            tour_id,
            language,
            participant_id,
        })
    }

    /// The (tour, language) pair that owns one coordination state
    pub fn channel(&self) -> ChannelKey {
        ChannelKey {
            tour_id: self.tour_id.clone(),
            language: self.language.clone(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tour_id, self.language, self.participant_id)
    }
}

/// (tour, language) pair; one coordination state exists per channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub tour_id: String,
    pub language: String,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tour_id, self.language)
    }
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() || value.contains(':') {
        return Err(ValidationError::InvalidIdentifier {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Timestamp {
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Wall-clock now
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to this timestamp (zero if `earlier` is later)
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        *self - earlier
    }

    /// True once `ttl` has fully elapsed since this timestamp
    pub fn is_expired(&self, ttl: Duration, now: Timestamp) -> bool {
        now.duration_since(*self) > ttl
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Provides timestamps to every time-dependent policy
///
/// Tests substitute [`ManualTimeSource`] to make TTL expiry, cooldowns and
/// batch deadlines deterministic.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Manually advanced clock, shared between clones
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    current: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(millis: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.current
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.current.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_validation() {
        assert!(ParticipantId::new("att-1").is_ok());
        assert!(matches!(
            ParticipantId::new("  "),
            Err(ValidationError::MissingParticipantId)
        ));
        assert!(ParticipantId::new("a:b").is_err());
    }

    #[test]
    fn test_session_key_channel() {
        let key = SessionKey::new("tour-9", "en", ParticipantId::new("g").unwrap()).unwrap();
        assert_eq!(key.channel().to_string(), "tour-9:en");
        assert_eq!(key.to_string(), "tour-9/en/g");
        assert!(SessionKey::new("", "en", ParticipantId::new("g").unwrap()).is_err());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(1_000);
        let later = t + Duration::from_millis(500);
        assert_eq!(later.as_millis(), 1_500);
        assert_eq!(later - t, Duration::from_millis(500));
        assert_eq!(t - later, Duration::ZERO);
        assert!(!t.is_expired(Duration::from_millis(500), later));
        assert!(t.is_expired(Duration::from_millis(499), later));
    }

    #[test]
    fn test_manual_time_source_shared() {
        let clock = ManualTimeSource::starting_at(10);
        let other = clock.clone();
        clock.advance(Duration::from_secs(1));
        assert_eq!(other.now().as_millis(), 1_010);
    }

    #[test]
    fn test_role_peer() {
        assert_eq!(Role::Guide.peer(), Role::Attendee);
        assert_eq!(Role::Attendee.peer(), Role::Guide);
        assert_eq!(serde_json::to_string(&Role::Guide).unwrap(), "\"guide\"");
    }
}
