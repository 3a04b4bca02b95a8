//! Real-time transport collaborator contract
//!
//! The media/connectivity primitive (offer/answer generation, candidate
//! gathering, media flow) is provided by the embedding application. Sessions
//! drive it through [`RealtimeTransport`] and receive its callbacks as
//! [`TransportEvent`]s on a channel handed to the [`TransportFactory`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::{TransportError, ValidationError};
use crate::types::SessionKey;

// ----------------------------------------------------------------------------
// Candidates and Descriptions
// ----------------------------------------------------------------------------

/// A connectivity candidate as produced by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    /// Reject empty or non-candidate lines
    pub fn validate(&self) -> Result<(), ValidationError> {
        let line = self.candidate.trim();
        if line.is_empty() {
            return Err(ValidationError::MalformedCandidate {
                reason: "empty candidate line".into(),
            });
        }
        if !line.starts_with("candidate:") {
            return Err(ValidationError::MalformedCandidate {
                reason: format!("unexpected prefix in {line:?}"),
            });
        }
        Ok(())
    }

    /// Priority field of the candidate line, if present
    pub fn priority(&self) -> Option<u32> {
        self.candidate.split_whitespace().nth(3)?.parse().ok()
    }

    /// Candidate type (`host`, `srflx`, `relay`, ...) from the `typ` attribute
    pub fn candidate_type(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during the offer/answer handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sdp.trim().is_empty() {
            return Err(ValidationError::MalformedDescription {
                reason: "empty sdp".into(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Transport State and Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Statistics snapshot reported by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TransportStats {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Cumulative since the transport was created
    pub packets_lost: u64,
    /// Cumulative since the transport was created
    pub packets_received: u64,
    /// Cumulative since the transport was created
    pub bytes_received: u64,
    /// Normalized inbound audio level in [0, 1]
    pub audio_level: f64,
    pub connection_state: TransportState,
    pub ice_state: IceConnectionState,
    pub selected_candidate_type: Option<String>,
}

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Callbacks raised by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    IceGatheringComplete,
    ConnectionStateChanged(TransportState),
    IceStateChanged(IceConnectionState),
    TrackAdded { track_id: String },
}

// ----------------------------------------------------------------------------
// Collaborator Traits
// ----------------------------------------------------------------------------

/// The real-time transport primitive one session drives
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn get_stats(&self) -> Result<TransportStats, TransportError>;

    /// In-place connectivity restart keeping descriptions
    async fn restart_ice(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Builds transports; used at session creation and when recovery rebuilds one
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        key: &SessionKey,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn RealtimeTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_validation() {
        assert!(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host")
            .validate()
            .is_ok());
        assert!(IceCandidate::new("  ").validate().is_err());
        assert!(IceCandidate::new("a=foo").validate().is_err());
    }

    #[test]
    fn test_candidate_type() {
        let relay = IceCandidate::new("candidate:7 1 udp 5 1.2.3.4 3478 typ relay raddr 0.0.0.0");
        assert_eq!(relay.candidate_type(), Some("relay"));
        assert_eq!(relay.priority(), Some(5));
        assert_eq!(IceCandidate::new("candidate:1").candidate_type(), None);
        assert_eq!(IceCandidate::new("candidate:1").priority(), None);
    }

    #[test]
    fn test_description_validation() {
        assert!(SessionDescription::new(SdpKind::Offer, "v=0").validate().is_ok());
        assert!(SessionDescription::new(SdpKind::Answer, "").validate().is_err());
    }
}
