use std::time::{Duration, Instant};

use tracing::trace;

use super::config::ScopeConfig;

/// Token reservoir with lazy, interval-aligned refill
///
/// No timer drives the refill. Every read first catches up on the whole
/// intervals elapsed since the last replenishment, which keeps the level exact
/// regardless of how rarely it is observed.
#[derive(Debug, Clone)]
pub(crate) struct Reservoir {
    capacity: u64,
    level: u64,
    refill_amount: u64,
    refill_interval: Duration,
    last_replenished: Instant,
}

impl Reservoir {
    pub(crate) fn new(config: &ScopeConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity,
            level: config.capacity,
            refill_amount: config.refill_amount,
            refill_interval: config.refill_interval,
            last_replenished: now,
        }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current level after catching up to `now`
    pub(crate) fn level(&mut self, now: Instant) -> u64 {
        self.catch_up(now);
        self.level
    }

    /// Add `refill_amount` per whole elapsed interval, capped at capacity
    pub(crate) fn catch_up(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_replenished);
        let interval_nanos = self.refill_interval.as_nanos().max(1);
        let intervals = elapsed.as_nanos() / interval_nanos;
        if intervals == 0 {
            return;
        }

        let added = u64::try_from(intervals).unwrap_or(u64::MAX).saturating_mul(self.refill_amount);
        self.level = self.level.saturating_add(added).min(self.capacity);

        // Advance by exactly `intervals` intervals, keeping the partial remainder
        let remainder = elapsed.as_nanos() % interval_nanos;
        let remainder = Duration::from_nanos(u64::try_from(remainder).unwrap_or(u64::MAX));
        self.last_replenished += elapsed.saturating_sub(remainder);

        trace!(added, level = self.level, "Reservoir replenished");
    }

    /// Time until the next refill boundary
    pub(crate) fn next_refill_in(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_replenished);
        self.refill_interval.saturating_sub(elapsed)
    }

    /// Remove `weight` tokens; caller must have checked the level
    pub(crate) fn take(&mut self, weight: u64) {
        self.level = self.level.saturating_sub(weight);
    }

    /// Apply a new configuration, restoring the level to the new capacity
    pub(crate) fn reconfigure(&mut self, config: &ScopeConfig, now: Instant) {
        *self = Self::new(config, now);
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for limiter::reservoir.
    use relaygate_common::{Clock, MockClock};

    use super::*;

    fn config(capacity: u64, refill: u64, interval: Duration) -> ScopeConfig {
        ScopeConfig::builder()
            .capacity(capacity)
            .refill_amount(refill)
            .refill_interval(interval)
            .build()
            .expect("valid config")
    }

    /// Validates that no tokens return before a full interval and the level
    /// is restored (capped) exactly at the boundary.
    #[test]
    fn test_refill_at_interval_boundary() {
        let clock = MockClock::new();
        let mut reservoir = Reservoir::new(&config(5, 5, Duration::from_secs(60)), clock.now());

        reservoir.take(5);
        assert_eq!(reservoir.level(clock.now()), 0);

        clock.advance(Duration::from_millis(59_999));
        assert_eq!(reservoir.level(clock.now()), 0);
        assert_eq!(reservoir.next_refill_in(clock.now()), Duration::from_millis(1));

        clock.advance(Duration::from_millis(1));
        assert_eq!(reservoir.level(clock.now()), 5);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let clock = MockClock::new();
        let mut reservoir = Reservoir::new(&config(5, 3, Duration::from_secs(1)), clock.now());

        reservoir.take(1);
        clock.advance(Duration::from_secs(10));
        assert_eq!(reservoir.level(clock.now()), 5);
    }

    /// Validates that partial intervals carry over to the next catch-up.
    #[test]
    fn test_partial_interval_carries_over() {
        let clock = MockClock::new();
        let mut reservoir = Reservoir::new(&config(10, 1, Duration::from_millis(100)), clock.now());
        reservoir.take(10);

        clock.advance(Duration::from_millis(150));
        assert_eq!(reservoir.level(clock.now()), 1);

        clock.advance(Duration::from_millis(50));
        assert_eq!(reservoir.level(clock.now()), 2);
        assert_eq!(reservoir.next_refill_in(clock.now()), Duration::from_millis(100));
    }

    /// Validates `0 <= level <= capacity` across an arbitrary sequence of
    /// takes and time advances.
    #[test]
    fn test_level_stays_within_bounds() {
        let clock = MockClock::new();
        let mut reservoir = Reservoir::new(&config(4, 3, Duration::from_millis(70)), clock.now());

        for step in 0..200u64 {
            let weight = step % 3 + 1;
            if reservoir.level(clock.now()) >= weight {
                reservoir.take(weight);
            }
            clock.advance_millis(step % 45);
            let level = reservoir.level(clock.now());
            assert!(level <= reservoir.capacity(), "level {} above capacity", level);
        }
    }
}
