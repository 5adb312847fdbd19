//! Token bucket rate limiter.

use parking_lot::Mutex;
use std::time::Instant;

/// A token bucket that refills continuously at `capacity` tokens per second.
///
/// The bucket starts full. Each permitted event consumes one whole token;
/// fractional refill is carried over between calls so that a caller pacing
/// itself at the configured rate is never refused.
pub struct TokenBucket {
    /// Maximum number of stored tokens (also the refill rate per second)
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket allowing `per_second` events per second.
    pub fn new(per_second: u32) -> Self {
        Self::new_at(per_second, Instant::now())
    }

    pub(crate) fn new_at(per_second: u32, now: Instant) -> Self {
        let capacity = f64::from(per_second);
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub(crate) fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently stored, after refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // A clock reading older than the last refill adds nothing.
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.capacity).min(self.capacity);
        if now > state.last_refill {
            state.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_instantaneous_calls_bounded_by_capacity() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(2, start);

        let allowed = (0..5).filter(|_| bucket.allow_at(start)).count();
        assert_eq!(allowed, 2);
    }

    #[test]
    fn test_fewer_calls_than_capacity_all_allowed() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(10, start);

        let allowed = (0..7).filter(|_| bucket.allow_at(start)).count();
        assert_eq!(allowed, 7);
    }

    #[test]
    fn test_paced_calls_never_refused() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(10, start);
        let spacing = Duration::from_millis(100);

        for i in 0..200 {
            assert!(bucket.allow_at(start + spacing * i), "call {i} was refused");
        }
    }

    #[test]
    fn test_refill_after_exhaustion() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(4, start);

        for _ in 0..4 {
            assert!(bucket.allow_at(start));
        }
        assert!(!bucket.allow_at(start));

        // A quarter second buys exactly one token at 4/s.
        assert!(bucket.allow_at(start + Duration::from_millis(250)));
        assert!(!bucket.allow_at(start + Duration::from_millis(250)));
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(3, start);

        let later = start + Duration::from_secs(60);
        let allowed = (0..10).filter(|_| bucket.allow_at(later)).count();
        assert_eq!(allowed, 3);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let start = Instant::now() + Duration::from_secs(5);
        let bucket = TokenBucket::new_at(1, start);

        assert!(bucket.allow_at(start));
        assert!(!bucket.allow_at(start - Duration::from_secs(1)));
    }
}
