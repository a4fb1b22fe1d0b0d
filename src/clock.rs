//! Monotonic timing tokens
//!
//! A `TimingToken` is an opaque reading of the monotonic clock. It is never
//! shown to users; it only exists to be compared with a later reading.

use std::time::{Duration, Instant};

/// Opaque point on the monotonic clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimingToken(Instant);

impl TimingToken {
    /// Read the monotonic clock
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Wrap an existing instant
    pub fn from_instant(instant: Instant) -> Self {
        Self(instant)
    }

    /// Time between this token and `later`
    ///
    /// Saturates at zero when `later` precedes this token, so a token taken
    /// after the reading it is compared against yields `0.0` rather than a
    /// negative duration.
    pub fn duration_until(&self, later: TimingToken) -> Duration {
        later.0.saturating_duration_since(self.0)
    }

    /// Seconds elapsed between this token and now, clamped at zero
    pub fn elapsed_secs(&self) -> f64 {
        self.duration_until(TimingToken::now()).as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_is_non_negative() {
        let token = TimingToken::now();
        assert!(token.elapsed_secs() >= 0.0);
    }

    #[test]
    fn test_elapsed_grows_with_time() {
        let token = TimingToken::from_instant(Instant::now() - Duration::from_millis(250));
        assert!(token.elapsed_secs() >= 0.25);
    }

    #[test]
    fn test_future_token_clamps_to_zero() {
        let future = TimingToken::from_instant(Instant::now() + Duration::from_secs(5));
        assert_eq!(future.elapsed_secs(), 0.0);
    }

    #[test]
    fn test_duration_until_between_tokens() {
        let base = Instant::now();
        let start = TimingToken::from_instant(base);
        let end = TimingToken::from_instant(base + Duration::from_millis(1500));
        assert_eq!(start.duration_until(end), Duration::from_millis(1500));
        assert_eq!(end.duration_until(start), Duration::ZERO);
    }
}
