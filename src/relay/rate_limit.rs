//! Per-connection rate limiting.
//!
//! Each presence owns two token buckets:
//! - a general bucket charged by every ordinary action (emote, speak, begin/end, ...)
//! - a possession bucket charged only by the high-frequency camera/movement stream
//!
//! The buckets are separate so that a ghost streaming movement cannot starve its
//! own ordinary actions, and a burst of ordinary actions cannot stall the stream.
//!
//! A bucket is restored to full capacity each time a refill interval elapses.
//! Refill is applied lazily on the next check, inside the same lock as the
//! decrement, so test-and-take is a single atomic step.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Reason a check was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    /// The general action bucket is empty.
    GeneralExhausted { capacity: u32 },
    /// The possession stream bucket is empty.
    PossessionExhausted { capacity: u32 },
}

impl std::fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitReason::GeneralExhausted { capacity } => {
                write!(f, "general bucket exhausted (capacity {})", capacity)
            }
            RateLimitReason::PossessionExhausted { capacity } => {
                write!(f, "possession bucket exhausted (capacity {})", capacity)
            }
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Fixed-capacity bucket refilled to full once per interval.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Returns false when the bucket is empty.
    pub fn try_take(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill);
        if !self.refill_interval.is_zero() && elapsed >= self.refill_interval {
            let intervals = (elapsed.as_nanos() / self.refill_interval.as_nanos()) as u32;
            state.tokens = self.capacity;
            state.last_refill += self.refill_interval * intervals;
        }

        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        true
    }

    pub fn available(&self) -> u32 {
        self.state.lock().tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// The pair of buckets owned by one presence.
#[derive(Debug)]
pub struct RateLimiter {
    general: TokenBucket,
    possession: TokenBucket,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            general: TokenBucket::new(
                cfg.general_capacity,
                Duration::from_millis(cfg.general_refill_interval_ms),
            ),
            possession: TokenBucket::new(
                cfg.possession_capacity,
                Duration::from_millis(cfg.possession_refill_interval_ms),
            ),
        }
    }

    /// Charge the general bucket.
    pub fn check_general(&self) -> Result<(), RateLimitReason> {
        if self.general.try_take() {
            Ok(())
        } else {
            Err(RateLimitReason::GeneralExhausted {
                capacity: self.general.capacity(),
            })
        }
    }

    /// Charge the possession stream bucket.
    pub fn check_possession(&self) -> Result<(), RateLimitReason> {
        if self.possession.try_take() {
            Ok(())
        } else {
            Err(RateLimitReason::PossessionExhausted {
                capacity: self.possession.capacity(),
            })
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            general_available: self.general.available(),
            general_capacity: self.general.capacity(),
            possession_available: self.possession.available(),
            possession_capacity: self.possession.capacity(),
        }
    }
}

/// Snapshot of a presence's bucket levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub general_available: u32,
    pub general_capacity: u32,
    pub possession_available: u32,
    pub possession_capacity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cfg(general: u32, possession: u32) -> RateLimitConfig {
        RateLimitConfig {
            general_capacity: general,
            general_refill_interval_ms: 1000,
            possession_capacity: possession,
            possession_refill_interval_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_then_refill() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            assert!(bucket.try_take());
        }
        assert!(!bucket.try_take());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!bucket.try_take());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(bucket.try_take());
        assert_eq!(bucket.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2, Duration::from_millis(10));
        assert!(bucket.try_take());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(bucket.try_take());
        assert_eq!(bucket.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_are_independent() {
        let limiter = RateLimiter::new(&cfg(1, 2));
        assert!(limiter.check_general().is_ok());
        assert!(matches!(
            limiter.check_general(),
            Err(RateLimitReason::GeneralExhausted { capacity: 1 })
        ));
        assert!(limiter.check_possession().is_ok());
        assert!(limiter.check_possession().is_ok());
        assert!(matches!(
            limiter.check_possession(),
            Err(RateLimitReason::PossessionExhausted { capacity: 2 })
        ));
        let stats = limiter.stats();
        assert_eq!(stats.general_available, 0);
        assert_eq!(stats.possession_available, 0);
    }

    #[test]
    fn last_token_goes_to_exactly_one_thread() {
        let bucket = Arc::new(TokenBucket::new(1, Duration::from_secs(3600)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&bucket);
                std::thread::spawn(move || b.try_take())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
