//! Coordination store contract
//!
//! The shared keyed store both roles of a channel signal through. Writers
//! that read-modify-write use [`CoordinationStore::compare_and_swap`] so a
//! concurrent write is detected instead of silently lost.

use async_trait::async_trait;
use core::time::Duration;

use crate::errors::StoreError;
use crate::types::{ChannelKey, ParticipantId};

pub mod memory;

pub use memory::InMemoryStore;

// ----------------------------------------------------------------------------
// Store Values
// ----------------------------------------------------------------------------

/// A stored value with the version it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// Result of a compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Committed { version: u64 },
    /// Another writer got there first; carries what is stored now
    Conflict { current: Option<Versioned> },
}

// ----------------------------------------------------------------------------
// Store Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a live (unexpired) value
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Unconditional write; returns the new version
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration)
        -> Result<u64, StoreError>;

    /// Write only if the stored version equals `expected_version`
    ///
    /// `None` means the key must be absent (or expired).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<CasOutcome, StoreError>;

    /// Append to an ordered list, refreshing its TTL; returns the new length
    async fn list_append(&self, key: &str, item: String, ttl: Duration)
        -> Result<usize, StoreError>;

    /// Items from index `start` onwards
    async fn list_range(&self, key: &str, start: usize) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

// ----------------------------------------------------------------------------
// Key Schema
// ----------------------------------------------------------------------------

/// Key layout of the coordination store
pub mod keys {
    use super::*;

    pub fn coordination(channel: &ChannelKey) -> String {
        format!("coordination:{}:{}", channel.tour_id, channel.language)
    }

    pub fn ice_candidate(channel: &ChannelKey, candidate_id: &str) -> String {
        format!("ice:{}:{}:{}", channel.tour_id, channel.language, candidate_id)
    }

    pub fn ice_candidate_list(channel: &ChannelKey) -> String {
        format!("ice-list:{}:{}", channel.tour_id, channel.language)
    }

    pub fn message(channel: &ChannelKey, message_id: &str) -> String {
        format!("messages:{}:{}:{}", channel.tour_id, channel.language, message_id)
    }

    pub fn message_list(channel: &ChannelKey) -> String {
        format!("messages-list:{}:{}", channel.tour_id, channel.language)
    }

    pub fn participant(channel: &ChannelKey, participant_id: &ParticipantId) -> String {
        format!(
            "participant:{}:{}:{}",
            channel.tour_id, channel.language, participant_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_schema() {
        let channel = ChannelKey {
            tour_id: "tour-1".into(),
            language: "en".into(),
        };
        let pid = ParticipantId::new("att-7").unwrap();
        assert_eq!(keys::coordination(&channel), "coordination:tour-1:en");
        assert_eq!(keys::ice_candidate(&channel, "c1"), "ice:tour-1:en:c1");
        assert_eq!(keys::message(&channel, "m1"), "messages:tour-1:en:m1");
        assert_eq!(keys::participant(&channel, &pid), "participant:tour-1:en:att-7");
        assert_ne!(keys::ice_candidate_list(&channel), keys::message_list(&channel));
    }
}
