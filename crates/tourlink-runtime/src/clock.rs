//! Runtime clock
//!
//! Timestamps derived from the tokio clock, so a paused test runtime moves
//! TTL expiry, cooldowns and batch deadlines in step with the timers that
//! wait on them.

use tokio::time::Instant;
use tourlink_core::{TimeSource, Timestamp};

/// Wall-clock anchored time source that advances with `tokio::time`
#[derive(Debug, Clone, Copy)]
pub struct TokioTimeSource {
    anchor: Instant,
    epoch: Timestamp,
}

impl TokioTimeSource {
    /// Anchor at the current wall-clock time
    pub fn new() -> Self {
        Self::anchored_at(Timestamp::now())
    }

    /// Anchor at a fixed timestamp; useful for reproducible tests
    pub fn anchored_at(epoch: Timestamp) -> Self {
        Self {
            anchor: Instant::now(),
            epoch,
        }
    }
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioTimeSource {
    fn now(&self) -> Timestamp {
        self.epoch + self.anchor.elapsed()
    }
}
