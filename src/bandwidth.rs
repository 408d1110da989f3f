//! Token-bucket rate limiting for upload and download traffic.
//!
//! The writer reserves bytes before sending a chunk; a nonzero delay
//! means the caller should cancel the reservation, arm a retry timer,
//! and try again later. The reader reserves after receiving a chunk and
//! sleeps out the delay with no lock held.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }
}

/// A token-bucket rate limiter shared by all peers of a torrent.
///
/// The bucket size is twice the rate, allowing short bursts.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        let max_tokens = (bytes_per_sec * 2) as f64;
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec: bytes_per_sec as f64,
                last_update: Instant::now(),
            }),
        })
    }

    /// A limiter that always grants immediately.
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: f64::MAX,
                max_tokens: f64::MAX,
                tokens_per_sec: f64::MAX,
                last_update: Instant::now(),
            }),
        })
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        bucket.tokens_per_sec = bytes_per_sec as f64;
        bucket.max_tokens = (bytes_per_sec * 2) as f64;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    /// Reserves `bytes` from the bucket, possibly into debt.
    ///
    /// `ok()` is false only when `bytes` exceeds the burst size, which
    /// is a configuration error. A nonzero `delay()` tells the caller
    /// when the debt will have been paid off; callers that won't wait
    /// must `cancel()` to return the tokens.
    pub fn reserve(&self, bytes: usize) -> Reservation<'_> {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        let amount = bytes as f64;
        if amount > bucket.max_tokens {
            return Reservation {
                limiter: self,
                bytes: 0,
                delay: Duration::ZERO,
                ok: false,
            };
        }
        bucket.tokens -= amount;
        let delay = if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bucket.tokens_per_sec)
        };
        Reservation {
            limiter: self,
            bytes,
            delay,
            ok: true,
        }
    }

    fn release(&self, bytes: usize) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (bucket.tokens + bytes as f64).min(bucket.max_tokens);
    }
}

/// An outstanding reservation against a [`RateLimiter`].
#[must_use]
pub struct Reservation<'a> {
    limiter: &'a RateLimiter,
    bytes: usize,
    delay: Duration,
    ok: bool,
}

impl Reservation<'_> {
    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns the reserved tokens to the bucket.
    pub fn cancel(self) {
        if self.ok {
            self.limiter.release(self.bytes);
        }
    }
}

/// Separate upload and download limiters for one torrent.
pub struct BandwidthLimiter {
    pub download: Arc<RateLimiter>,
    pub upload: Arc<RateLimiter>,
}

impl BandwidthLimiter {
    /// A limit of 0 means unlimited.
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        let make = |limit: u64| {
            if limit == 0 {
                RateLimiter::unlimited()
            } else {
                RateLimiter::new(limit)
            }
        };
        Self {
            download: make(download_limit),
            upload: make(upload_limit),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_delays() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..100 {
            let res = limiter.reserve(1 << 20);
            assert!(res.ok());
            assert_eq!(res.delay(), Duration::ZERO);
        }
    }

    #[test]
    fn burst_then_delay() {
        let limiter = RateLimiter::new(16384);
        // Burst capacity is 2x the rate.
        let first = limiter.reserve(32768);
        assert!(first.ok());
        assert_eq!(first.delay(), Duration::ZERO);
        let second = limiter.reserve(16384);
        assert!(second.ok());
        assert!(second.delay() > Duration::ZERO);
        second.cancel();
    }

    #[test]
    fn cancel_restores_tokens() {
        let limiter = RateLimiter::new(16384);
        limiter.reserve(32768).cancel();
        let res = limiter.reserve(32768);
        assert!(res.ok());
        assert_eq!(res.delay(), Duration::ZERO);
    }

    #[test]
    fn oversized_reservation_not_ok() {
        let limiter = RateLimiter::new(1024);
        assert!(!limiter.reserve(1 << 20).ok());
    }
}
