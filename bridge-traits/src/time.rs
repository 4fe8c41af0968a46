//! Time source
//!
//! Queue entries, delta tokens and events are stamped through a [`Clock`]
//! rather than `Utc::now()` so tests can pin and step time.

use chrono::{DateTime, Utc};
use std::sync::RwLock;

/// Time source trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::time::Clock;
///
/// fn stamp(clock: &dyn Clock) {
///     println!("Enqueued at: {}", clock.now());
/// }
/// ```
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a settable instant
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += delta;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let first = SystemClock.now();
        let second = SystemClock.now();
        assert!(second >= first);
    }

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::new(start());

        assert_eq!(clock.now(), start());
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now().timestamp(), start().timestamp() + 90);
        clock.set(start());
        assert_eq!(clock.now(), start());
    }

    #[test]
    fn test_clock_as_trait_object() {
        let clock: std::sync::Arc<dyn Clock> = std::sync::Arc::new(FixedClock::new(start()));
        assert_eq!(clock.now(), start());
    }
}
