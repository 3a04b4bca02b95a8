//! Property-based tests for quality scoring, the quality ladder and candidate
//! gating
//!
//! These tests verify invariants that must hold for any metric combination:
//! score bounds, monotonicity under worsening conditions, adjacency of ladder
//! transitions and the absence of premature candidate release.

use core::time::Duration;
use proptest::prelude::*;
use tourlink_core::{
    config::{BatchConfig, DegradationConfig},
    degradation::{ChangeReason, DegradationManager, QualityMetrics},
    health::{quality_score, ScoreInputs, ScoreThresholds},
    ConnectionStateMachine, IceCandidate, IceCandidateBatcher, IceConnectionState,
    ParticipantId, Timestamp, TransportState,
};

fn arb_transport_state() -> impl Strategy<Value = TransportState> {
    prop_oneof![
        Just(TransportState::New),
        Just(TransportState::Connecting),
        Just(TransportState::Connected),
        Just(TransportState::Disconnected),
        Just(TransportState::Failed),
    ]
}

fn arb_ice_state() -> impl Strategy<Value = IceConnectionState> {
    prop_oneof![
        Just(IceConnectionState::Checking),
        Just(IceConnectionState::Connected),
        Just(IceConnectionState::Disconnected),
        Just(IceConnectionState::Failed),
    ]
}

/// Generate arbitrary score inputs
fn arb_inputs() -> impl Strategy<Value = ScoreInputs> {
    (
        0.0f64..2_000.0,
        0.0f64..300.0,
        0.0f64..1.0,
        0.0f64..1.0,
        arb_transport_state(),
        arb_ice_state(),
    )
        .prop_map(
            |(rtt_ms, jitter_ms, loss_rate, audio_level, connection_state, ice_state)| {
                ScoreInputs {
                    rtt_ms,
                    jitter_ms,
                    loss_rate,
                    audio_level,
                    connection_state,
                    ice_state,
                }
            },
        )
}

fn arb_metrics() -> impl Strategy<Value = QualityMetrics> {
    (0.0f64..1_500.0, 0.0f64..0.2, 0.0f64..250.0, 0.0f64..0.5).prop_map(
        |(rtt_ms, packet_loss, jitter_ms, audio_level)| QualityMetrics {
            rtt_ms,
            packet_loss,
            jitter_ms,
            audio_level,
        },
    )
}

proptest! {
    /// Property: the score always lies in [0, 100]
    #[test]
    fn score_is_bounded(inputs in arb_inputs()) {
        let score = quality_score(&inputs, &ScoreThresholds::default());
        prop_assert!(score <= 100);
    }

    /// Property: worsening rtt, loss or jitter never raises the score
    #[test]
    fn score_is_monotone_in_network_metrics(
        inputs in arb_inputs(),
        extra_rtt in 0.0f64..1_000.0,
        extra_loss in 0.0f64..0.5,
        extra_jitter in 0.0f64..200.0,
    ) {
        let thresholds = ScoreThresholds::default();
        let base = quality_score(&inputs, &thresholds);

        let worse_rtt = ScoreInputs { rtt_ms: inputs.rtt_ms + extra_rtt, ..inputs };
        prop_assert!(quality_score(&worse_rtt, &thresholds) <= base);

        let worse_loss = ScoreInputs { loss_rate: inputs.loss_rate + extra_loss, ..inputs };
        prop_assert!(quality_score(&worse_loss, &thresholds) <= base);

        let worse_jitter = ScoreInputs { jitter_ms: inputs.jitter_ms + extra_jitter, ..inputs };
        prop_assert!(quality_score(&worse_jitter, &thresholds) <= base);
    }

    /// Property: non-emergency transitions move one adjacent level and never
    /// inside a cooldown window
    #[test]
    fn ladder_transitions_respect_adjacency_and_cooldown(
        samples in prop::collection::vec((arb_metrics(), 0u64..20_000), 1..60),
    ) {
        let mut manager = DegradationManager::new(DegradationConfig::default());
        let mut now = Timestamp::new(0);
        let mut last_change: Option<(Timestamp, Duration)> = None;

        for (metrics, step_ms) in samples {
            now = now + Duration::from_millis(step_ms);
            if let Some(change) = manager.evaluate(&metrics, now) {
                prop_assert!(change.from.is_adjacent(change.to));
                prop_assert!(!matches!(change.reason, ChangeReason::Emergency));
                if let Some((at, window)) = last_change {
                    prop_assert!(now.duration_since(at) >= window);
                }
                // The level entered decides the next window
                let cooldown = manager
                    .current_strategy()
                    .map(|s| s.triggers.adaptation_cooldown)
                    .unwrap_or_default();
                last_change = Some((now, cooldown));
            }
        }
    }

    /// Property: nothing is released before both descriptions are applied
    #[test]
    fn candidates_never_released_before_ready(
        priorities in prop::collection::vec(0u32..1_000, 1..30),
        apply_local in any::<bool>(),
    ) {
        let mut machine = ConnectionStateMachine::new(64, Timestamp::new(0));
        for (i, priority) in priorities.iter().enumerate() {
            let candidate = IceCandidate::new(format!("candidate:{i} 1 udp {priority} 10.0.0.1 {} typ host", 5000 + i));
            machine.buffer_ice_candidate(candidate, *priority);
        }
        if apply_local {
            machine.set_local_description_complete(Timestamp::new(1)).unwrap();
        } else {
            machine.set_remote_description_complete(Timestamp::new(1)).unwrap();
        }
        prop_assert!(machine.drain_ready_candidates().is_empty());
        prop_assert_eq!(machine.pending_candidates(), priorities.len());
    }

    /// Property: size and deadline flushes deliver every candidate exactly once,
    /// in generation order
    #[test]
    fn batches_preserve_order_without_duplicates(
        gaps in prop::collection::vec(0u64..400, 1..40),
    ) {
        let mut batcher = IceCandidateBatcher::new(
            ParticipantId::new("guide").unwrap(),
            BatchConfig::default(),
        );
        let mut now = Timestamp::new(0);
        let mut delivered = Vec::new();

        for (i, gap) in gaps.iter().enumerate() {
            now = now + Duration::from_millis(*gap);
            if let Some(batch) = batcher.poll_deadline(now) {
                prop_assert!(batch.len() <= 5);
                delivered.extend(batch.candidates);
            }
            let candidate = IceCandidate::new(format!("candidate:{i} 1 udp 1 10.0.0.1 {} typ host", 6000 + i));
            if let Some(batch) = batcher.add_candidate(candidate, now).unwrap() {
                prop_assert_eq!(batch.len(), 5);
                delivered.extend(batch.candidates);
            }
        }
        if let Some(batch) = batcher.force_flush(now) {
            delivered.extend(batch.candidates);
        }
        prop_assert!(batcher.force_flush(now).is_none());

        let sequences: Vec<u64> = delivered.iter().map(|c| c.sequence_number).collect();
        let expected: Vec<u64> = (0..gaps.len() as u64).collect();
        prop_assert_eq!(sequences, expected);
    }
}
