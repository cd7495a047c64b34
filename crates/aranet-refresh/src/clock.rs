//! Wall-clock source for refresh bookkeeping.
//!
//! Timestamps (last success, next expected refresh, last metadata fetch) are
//! taken from a [`Clock`] so tests running with paused tokio time see the same
//! timeline the engine's timers do.

use std::fmt;

use time::OffsetDateTime;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in UTC.
    fn now(&self) -> OffsetDateTime;
}

/// Reads the system clock directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Wall time anchored at construction and advanced by [`tokio::time::Instant`].
///
/// Under `tokio::time::pause` this clock only moves when the runtime's time
/// does, which keeps timestamps and sleeps consistent.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_wall: OffsetDateTime,
    anchor_instant: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor the clock at the current system time.
    pub fn new() -> Self {
        Self::starting_at(OffsetDateTime::now_utc())
    }

    /// Anchor the clock at an explicit wall time.
    pub fn starting_at(anchor_wall: OffsetDateTime) -> Self {
        Self {
            anchor_wall,
            anchor_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> OffsetDateTime {
        self.anchor_wall + self.anchor_instant.elapsed()
    }
}
