//! Request timing across two independent hooks
//!
//! The early hook stores a [`TimingToken`] in a per-request [`TimingSlot`];
//! the late hook reads it back. A late hook that finds no token (the early
//! hook was skipped, the pipeline short-circuited, an earlier hook failed)
//! counts the request as "unknown latency" instead of guessing.
//!
//! The tracker knows nothing about labels: callers hand it a histogram that
//! is already labeled with the view and method.

use crate::clock::TimingToken;
use prometheus::{Histogram, IntCounter};

/// Per-request storage for at most one timing token
///
/// Lifecycle: empty when the request context is created, set by
/// [`RequestTimingTracker::mark_start`], then only read. Dropped with the
/// request context that owns it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSlot(Option<TimingToken>);

impl TimingSlot {
    /// An empty slot
    pub fn empty() -> Self {
        Self(None)
    }

    /// The stored token, if the early hook ran
    pub fn token(&self) -> Option<TimingToken> {
        self.0
    }

    /// Whether a token has been recorded
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    fn store(&mut self, token: TimingToken) {
        self.0 = Some(token);
    }
}

/// Outcome of a late-hook observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Elapsed seconds recorded into the histogram
    Recorded(f64),
    /// No token present, the fallback counter was incremented
    Unknown,
}

/// Start/elapsed arithmetic shared by every hook pair
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTimingTracker;

impl RequestTimingTracker {
    /// Record "now" into the slot
    ///
    /// A second call overwrites the first.
    pub fn mark_start(slot: &mut TimingSlot) {
        slot.store(TimingToken::now());
    }

    /// Observe the time since the slot's token, or count the request as unknown
    ///
    /// Safe to call several times for the same request (for example from both
    /// the exception and the response hook); every call that finds a token
    /// records its own observation. Durations are clamped at zero.
    pub fn observe_elapsed(
        slot: &TimingSlot,
        histogram: &Histogram,
        fallback: &IntCounter,
    ) -> Observation {
        match slot.token() {
            Some(token) => {
                let elapsed = token.elapsed_secs();
                histogram.observe(elapsed);
                Observation::Recorded(elapsed)
            }
            None => {
                fallback.inc();
                Observation::Unknown
            }
        }
    }
}
