//! Token-bucket request limiter keyed by remote address. Buckets refill
//! lazily on access, so no timer fires per key; a periodic sweep drops
//! buckets that have sat idle at full credit.

use hashbrown::HashMap;
use quark::clock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

const SHARD_COUNT: usize = 16;
const IDLE_EVICT_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct LimiterConfig {
    pub max_tokens: u32,
    pub refill_interval: Duration,
    pub tokens_per_refill: u32,
    /// Lockout applied after `lockout_threshold` denials inside
    /// `lockout_window`. `None` disables lockouts.
    pub lockout: Option<Duration>,
    pub lockout_threshold: u32,
    pub lockout_window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> LimiterConfig {
        LimiterConfig {
            max_tokens: 64,
            refill_interval: Duration::from_millis(1000),
            tokens_per_refill: 64,
            lockout: Some(Duration::from_secs(30)),
            lockout_threshold: 32,
            lockout_window: Duration::from_secs(10),
        }
    }
}

/// The outcome of a limiter check. Denials carry the suggested retry delay.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Denied { retry_after_ms: u64 },
}

impl Decision {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

struct Bucket {
    tokens: u32,
    last_refill: u64,
    blocked_until: Option<u64>,
    denials: u32,
    window_start: u64,
}

/// Sharded table of per-key token buckets.
pub struct RequestLimiter {
    config: LimiterConfig,
    shards: Vec<Mutex<HashMap<IpAddr, Bucket>>>,
}

impl RequestLimiter {
    pub fn new(config: LimiterConfig) -> RequestLimiter {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();

        RequestLimiter { config, shards }
    }

    /// Checks and consumes one token for the key.
    pub fn check(&self, key: IpAddr) -> Decision {
        self.check_at(key, clock::unix_millis())
    }

    /// Deterministic variant taking an explicit timestamp.
    pub fn check_at(&self, key: IpAddr, now_ms: u64) -> Decision {
        let interval_ms = self.config.refill_interval.as_millis() as u64;

        let mut shard = self.shard(&key).lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let config = &self.config;
        let bucket = shard.entry(key).or_insert_with(|| Bucket {
            tokens: config.max_tokens,
            last_refill: now_ms,
            blocked_until: None,
            denials: 0,
            window_start: now_ms,
        });

        // Active lockout trumps everything
        if let Some(until) = bucket.blocked_until {
            if now_ms < until {
                return Decision::Denied {
                    retry_after_ms: until - now_ms,
                };
            }

            bucket.blocked_until = None;
            bucket.denials = 0;
            bucket.window_start = now_ms;
        }

        // Lazy refill
        let refills = (now_ms.saturating_sub(bucket.last_refill)) / interval_ms;
        if refills > 0 {
            let earned = refills.saturating_mul(u64::from(self.config.tokens_per_refill));
            bucket.tokens = std::cmp::min(
                self.config.max_tokens,
                bucket.tokens.saturating_add(earned as u32),
            );
            bucket.last_refill = now_ms;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            return Decision::Allowed {
                remaining: bucket.tokens,
            };
        }

        // Denied: track repeat offenders inside the rolling window
        if now_ms.saturating_sub(bucket.window_start) > self.config.lockout_window.as_millis() as u64 {
            bucket.window_start = now_ms;
            bucket.denials = 0;
        }

        bucket.denials += 1;

        if let Some(lockout) = self.config.lockout {
            if bucket.denials >= self.config.lockout_threshold {
                let until = now_ms + lockout.as_millis() as u64;
                bucket.blocked_until = Some(until);

                return Decision::Denied {
                    retry_after_ms: until - now_ms,
                };
            }
        }

        Decision::Denied {
            retry_after_ms: interval_ms - (now_ms.saturating_sub(bucket.last_refill)) % interval_ms,
        }
    }

    /// Drops buckets that have been idle long enough to be back at full
    /// credit. Called from the housekeeping tick.
    pub fn sweep(&self, now_ms: u64) {
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            shard.retain(|_, bucket| {
                bucket.blocked_until.is_some()
                    || now_ms.saturating_sub(bucket.last_refill) < IDLE_EVICT_MS
            });
        }
    }

    /// Number of tracked keys, across all shards.
    pub fn tracked_keys(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .sum()
    }

    fn shard(&self, key: &IpAddr) -> &Mutex<HashMap<IpAddr, Bucket>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);

        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    fn limiter(max_tokens: u32, interval_ms: u64, per_refill: u32) -> RequestLimiter {
        RequestLimiter::new(LimiterConfig {
            max_tokens,
            refill_interval: Duration::from_millis(interval_ms),
            tokens_per_refill: per_refill,
            lockout: None,
            lockout_threshold: 0,
            lockout_window: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_burst_up_to_max_then_denied() {
        let limiter = limiter(3, 1000, 3);
        let now = 1_000_000;

        assert_eq!(limiter.check_at(key(), now), Decision::Allowed { remaining: 2 });
        assert_eq!(limiter.check_at(key(), now), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.check_at(key(), now), Decision::Allowed { remaining: 0 });

        match limiter.check_at(key(), now) {
            Decision::Denied { retry_after_ms } => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 1000);
            }
            other => panic!("Unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_refill_restores_credit() {
        let limiter = limiter(2, 1000, 2);
        let now = 1_000_000;

        limiter.check_at(key(), now);
        limiter.check_at(key(), now);
        assert!(!limiter.check_at(key(), now).is_allowed());

        // One full interval later the bucket is usable again
        assert!(limiter.check_at(key(), now + 1000).is_allowed());
    }

    #[test]
    fn test_refill_clamped_at_max() {
        let limiter = limiter(2, 1000, 2);
        let now = 1_000_000;

        limiter.check_at(key(), now);

        // A long quiet period must not bank more than max_tokens
        let later = now + 100_000;
        assert_eq!(limiter.check_at(key(), later), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.check_at(key(), later), Decision::Allowed { remaining: 0 });
        assert!(!limiter.check_at(key(), later).is_allowed());
    }

    #[test]
    fn test_retry_after_counts_down() {
        let limiter = limiter(1, 1000, 1);
        let now = 1_000_000;

        limiter.check_at(key(), now);

        let first = match limiter.check_at(key(), now + 100) {
            Decision::Denied { retry_after_ms } => retry_after_ms,
            other => panic!("Unexpected decision {:?}", other),
        };
        let second = match limiter.check_at(key(), now + 700) {
            Decision::Denied { retry_after_ms } => retry_after_ms,
            other => panic!("Unexpected decision {:?}", other),
        };

        assert_eq!(first, 900);
        assert_eq!(second, 300);
    }

    #[test]
    fn test_allowed_rate_bounded_over_window() {
        let max_tokens = 5u32;
        let per_refill = 5u32;
        let interval = 100u64;
        let limiter = limiter(max_tokens, interval, per_refill);

        let start = 1_000_000;
        let window = 1000u64;

        let mut allowed = 0u64;
        for tick in 0..window {
            if limiter.check_at(key(), start + tick).is_allowed() {
                allowed += 1;
            }
        }

        let ceiling = u64::from(max_tokens)
            + u64::from(per_refill) * ((window + interval - 1) / interval);

        assert!(allowed <= ceiling, "allowed {} exceeds ceiling {}", allowed, ceiling);
    }

    #[test]
    fn test_lockout_after_repeat_denials() {
        let limiter = RequestLimiter::new(LimiterConfig {
            max_tokens: 1,
            refill_interval: Duration::from_millis(1000),
            tokens_per_refill: 1,
            lockout: Some(Duration::from_secs(60)),
            lockout_threshold: 3,
            lockout_window: Duration::from_secs(10),
        });
        let now = 1_000_000;

        limiter.check_at(key(), now);

        // Three denials in the window trip the lockout
        limiter.check_at(key(), now + 1);
        limiter.check_at(key(), now + 2);
        let decision = limiter.check_at(key(), now + 3);

        match decision {
            Decision::Denied { retry_after_ms } => assert_eq!(retry_after_ms, 60_000),
            other => panic!("Unexpected decision {:?}", other),
        }

        // Even after the bucket would have refilled, the lockout holds
        assert!(!limiter.check_at(key(), now + 5000).is_allowed());

        // And it expires
        assert!(limiter.check_at(key(), now + 3 + 60_000).is_allowed());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 1000, 1);
        let now = 1_000_000;

        let other: IpAddr = "10.9.9.9".parse().unwrap();

        assert!(limiter.check_at(key(), now).is_allowed());
        assert!(!limiter.check_at(key(), now).is_allowed());
        assert!(limiter.check_at(other, now).is_allowed());
    }

    #[test]
    fn test_sweep_drops_idle_full_buckets() {
        let limiter = limiter(2, 1000, 2);
        let now = 1_000_000;

        limiter.check_at(key(), now);
        assert_eq!(limiter.tracked_keys(), 1);

        // A recently active bucket survives the sweep
        limiter.sweep(now + IDLE_EVICT_MS - 1);
        assert_eq!(limiter.tracked_keys(), 1);

        // Once idle past the eviction age it is dropped
        limiter.sweep(now + IDLE_EVICT_MS + 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
