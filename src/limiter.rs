//! Token-bucket admission gate.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Bounds the number of tasks admitted per minute.
///
/// Capacity equals the per-minute ceiling and tokens refill continuously at
/// `capacity / 60` per second. [`try_acquire`](Self::try_acquire) never
/// blocks.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket admitting `per_minute` tasks per minute.
    pub fn new(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Time until the next token becomes available.
    pub fn retry_after(&self) -> Duration {
        let available = self.available();
        if available >= 1.0 || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - available) / self.refill_per_sec)
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        // Instant is monotonic, so elapsed is never negative.
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .clamp(0.0, self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_beyond_capacity_is_rejected() {
        let limiter = RateLimiter::new(10);
        let admitted = (0..11).filter(|_| limiter.try_acquire()).count();
        assert_eq!(admitted, 10);
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_continuous() {
        let limiter = RateLimiter::new(60);
        while limiter.try_acquire() {}
        assert!(!limiter.try_acquire());

        // One token per second at 60/min; half a second is not enough.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_rate_never_exhausts() {
        let limiter = RateLimiter::new(30);
        for _ in 0..200 {
            assert!(limiter.try_acquire());
            tokio::time::advance(Duration::from_secs(2)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_capped_at_capacity() {
        let limiter = RateLimiter::new(5);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!((limiter.available() - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after() {
        let limiter = RateLimiter::new(60);
        assert_eq!(limiter.retry_after(), Duration::ZERO);
        while limiter.try_acquire() {}
        let wait = limiter.retry_after();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(1));
    }
}
