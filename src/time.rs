//! Delay arithmetic shared by the queue backends

use std::time::Duration;

use chrono::{DateTime, Utc};

/// When a job should become available for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Relative to now
    For(Duration),
    /// At an absolute instant
    Until(DateTime<Utc>),
}

impl Delay {
    /// A zero-length delay (available immediately)
    pub fn none() -> Self {
        Delay::For(Duration::ZERO)
    }
}

impl From<Duration> for Delay {
    fn from(d: Duration) -> Self {
        Delay::For(d)
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(at: DateTime<Utc>) -> Self {
        Delay::Until(at)
    }
}

/// Current wall-clock time as unix seconds.
pub fn current_time() -> i64 {
    Utc::now().timestamp()
}

/// Unix timestamp at which a delayed job becomes available.
pub fn available_at(delay: Delay) -> i64 {
    match delay {
        Delay::For(d) => current_time() + d.as_secs() as i64,
        Delay::Until(at) => at.timestamp(),
    }
}

/// Whole seconds from now until the delay elapses, clamped at zero.
pub fn seconds_until(delay: Delay) -> u64 {
    match delay {
        Delay::For(d) => d.as_secs(),
        Delay::Until(at) => (at.timestamp() - current_time()).max(0) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_delay_offsets_from_now() {
        let at = available_at(Delay::For(Duration::from_secs(60)));
        let now = current_time();
        assert!((at - now - 60).abs() <= 1);
    }

    #[test]
    fn absolute_delay_uses_the_instant() {
        let when = Utc::now() + chrono::Duration::seconds(90);
        let at = available_at(Delay::Until(when));
        assert_eq!(at, when.timestamp());
    }

    #[test]
    fn past_instants_clamp_to_zero_seconds() {
        let when = Utc::now() - chrono::Duration::seconds(30);
        assert_eq!(seconds_until(Delay::Until(when)), 0);
    }

    #[test]
    fn delay_converts_from_duration() {
        let delay: Delay = Duration::from_secs(5).into();
        assert_eq!(delay, Delay::For(Duration::from_secs(5)));
    }
}
