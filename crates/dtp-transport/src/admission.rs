//! # Admission Control
//!
//! Per-priority token buckets applied before packets reach the scheduler, so
//! no single class can flood the queue. A refusal here is accounted
//! separately from deadline drops.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::{ensure_positive, ConfigError};
use crate::wire::Priority;

// ─── Token Bucket ───────────────────────────────────────────────────────────

/// Sustained rate and burst capacity of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    /// Tokens per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: u32,
}

impl TokenBucketConfig {
    pub const fn new(rate: f64, burst: u32) -> Self {
        TokenBucketConfig { rate, burst }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("token bucket rate", self.rate)?;
        ensure_positive("token bucket burst", self.burst as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenBucketStats {
    pub consumed: u64,
    pub rejected: u64,
    pub available: f64,
}

/// Lazily refilled token bucket. Starts full.
///
/// On every access `tokens = min(burst, tokens + elapsed_s · rate)`; the
/// bucket never holds more than `burst`.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill_ms: u64,
    clock: SharedClock,
    consumed: u64,
    rejected: u64,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(config.rate, config.burst as f64, clock))
    }

    pub(crate) fn from_validated(rate: f64, burst: f64, clock: SharedClock) -> Self {
        let now = clock.now_ms();
        TokenBucket {
            rate,
            burst,
            tokens: burst,
            last_refill_ms: now,
            clock,
            consumed: 0,
            rejected: 0,
        }
    }

    fn refill(&mut self) {
        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(self.last_refill_ms);
        if elapsed > 0 {
            self.tokens = (self.tokens + elapsed as f64 / 1000.0 * self.rate).min(self.burst);
            self.last_refill_ms = now;
        }
    }

    /// Take `n` tokens if available.
    pub fn consume(&mut self, n: u32) -> bool {
        self.refill();
        let need = n as f64;
        if self.tokens >= need {
            self.tokens -= need;
            self.consumed += n as u64;
            true
        } else {
            self.rejected += n as u64;
            false
        }
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// How long until `n` tokens will be available (zero if they already are).
    pub fn time_until_available(&mut self, n: u32) -> Duration {
        self.refill();
        let deficit = n as f64 - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.rate)
        }
    }

    /// Change the refill rate and capacity, keeping accrued tokens (capped).
    pub(crate) fn reconfigure(&mut self, rate: f64, burst: f64) {
        self.refill();
        self.rate = rate;
        self.burst = burst;
        self.tokens = self.tokens.min(burst);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    pub fn stats(&mut self) -> TokenBucketStats {
        TokenBucketStats {
            consumed: self.consumed,
            rejected: self.rejected,
            available: self.available_tokens(),
        }
    }

    /// Refill to capacity and clear counters.
    pub fn reset(&mut self) {
        self.tokens = self.burst;
        self.last_refill_ms = self.clock.now_ms();
        self.consumed = 0;
        self.rejected = 0;
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("tokens", &self.tokens)
            .finish()
    }
}

// ─── Admission Controller ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    limits: [TokenBucketConfig; 4],
    /// When false, Critical traffic bypasses its bucket.
    pub enforce_critical_limit: bool,
}

impl AdmissionConfig {
    pub fn limit(&self, priority: Priority) -> TokenBucketConfig {
        self.limits[priority.index()]
    }

    pub fn set_limit(&mut self, priority: Priority, limit: TokenBucketConfig) {
        self.limits[priority.index()] = limit;
    }

    pub fn with_limit(mut self, priority: Priority, limit: TokenBucketConfig) -> Self {
        self.set_limit(priority, limit);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.iter().try_for_each(TokenBucketConfig::validate)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            limits: [
                TokenBucketConfig::new(50.0, 20),
                TokenBucketConfig::new(200.0, 50),
                TokenBucketConfig::new(500.0, 100),
                TokenBucketConfig::new(1_000.0, 200),
            ],
            enforce_critical_limit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PriorityAdmission {
    pub admitted: u64,
    pub rejected: u64,
    pub tokens_available: f64,
}

/// Snapshot of admission counters, indexed by [`Priority::index`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionStats {
    pub by_priority: [PriorityAdmission; 4],
}

impl AdmissionStats {
    pub fn get(&self, priority: Priority) -> &PriorityAdmission {
        &self.by_priority[priority.index()]
    }

    pub fn total_rejected(&self) -> u64 {
        self.by_priority.iter().map(|p| p.rejected).sum()
    }
}

/// One independently locked token bucket per priority.
pub struct AdmissionController {
    buckets: [Mutex<TokenBucket>; 4],
    admitted: [AtomicU64; 4],
    rejected: [AtomicU64; 4],
    enforce_critical_limit: bool,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        let buckets = std::array::from_fn(|i| {
            let limit = config.limits[i];
            Mutex::new(TokenBucket::from_validated(
                limit.rate,
                limit.burst as f64,
                clock.clone(),
            ))
        });
        Ok(AdmissionController {
            buckets,
            admitted: Default::default(),
            rejected: Default::default(),
            enforce_critical_limit: config.enforce_critical_limit,
        })
    }

    /// Consume one token from the packet's priority bucket.
    pub fn admit(&self, priority: Priority) -> bool {
        let idx = priority.index();
        let admitted = if priority == Priority::Critical && !self.enforce_critical_limit {
            true
        } else {
            self.bucket(priority).consume(1)
        };

        if admitted {
            self.admitted[idx].fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected[idx].fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    pub fn stats(&self) -> AdmissionStats {
        let mut stats = AdmissionStats::default();
        for p in Priority::ALL {
            let i = p.index();
            stats.by_priority[i] = PriorityAdmission {
                admitted: self.admitted[i].load(Ordering::Relaxed),
                rejected: self.rejected[i].load(Ordering::Relaxed),
                tokens_available: self.bucket(p).available_tokens(),
            };
        }
        stats
    }

    /// Refill every bucket and zero all counters.
    pub fn reset(&self) {
        for p in Priority::ALL {
            self.bucket(p).reset();
            self.admitted[p.index()].store(0, Ordering::Relaxed);
            self.rejected[p.index()].store(0, Ordering::Relaxed);
        }
    }

    fn bucket(&self, priority: Priority) -> std::sync::MutexGuard<'_, TokenBucket> {
        self.buckets[priority.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    // ─── TokenBucket ────────────────────────────────────────────────────

    #[test]
    fn bucket_starts_full_and_drains() {
        let (clock, _) = ManualClock::shared(0);
        let mut bucket = TokenBucket::new(TokenBucketConfig::new(10.0, 3), clock).unwrap();
        assert!(bucket.consume(1));
        assert!(bucket.consume(2));
        assert!(!bucket.consume(1));
        let stats = bucket.stats();
        assert_eq!(stats.consumed, 3);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn bucket_refills_lazily_and_caps_at_burst() {
        let (clock, time) = ManualClock::shared(0);
        let mut bucket = TokenBucket::new(TokenBucketConfig::new(100.0, 5), clock).unwrap();
        assert!(bucket.consume(5));
        assert_eq!(bucket.available_tokens(), 0.0);

        time.advance(20); // 2 tokens at 100/s
        assert!((bucket.available_tokens() - 2.0).abs() < 1e-9);

        time.advance(10_000);
        assert_eq!(bucket.available_tokens(), 5.0);
    }

    #[test]
    fn bucket_time_until_available() {
        let (clock, _) = ManualClock::shared(0);
        let mut bucket = TokenBucket::new(TokenBucketConfig::new(1_000.0, 1), clock).unwrap();
        assert_eq!(bucket.time_until_available(1), Duration::ZERO);
        assert!(bucket.consume(1));
        let wait = bucket.time_until_available(1);
        assert!(wait > Duration::from_micros(900) && wait <= Duration::from_micros(1_100));
    }

    #[test]
    fn bucket_rejects_invalid_config() {
        let (clock, _) = ManualClock::shared(0);
        assert!(TokenBucket::new(TokenBucketConfig::new(0.0, 5), clock.clone()).is_err());
        assert!(TokenBucket::new(TokenBucketConfig::new(f64::NAN, 5), clock.clone()).is_err());
        assert!(TokenBucket::new(TokenBucketConfig::new(5.0, 0), clock).is_err());
    }

    #[test]
    fn bucket_reset_refills() {
        let (clock, _) = ManualClock::shared(0);
        let mut bucket = TokenBucket::new(TokenBucketConfig::new(1.0, 2), clock).unwrap();
        assert!(bucket.consume(2));
        bucket.reset();
        assert_eq!(bucket.available_tokens(), 2.0);
        assert_eq!(bucket.stats().consumed, 0);
    }

    // ─── AdmissionController ────────────────────────────────────────────

    #[test]
    fn default_limits() {
        let cfg = AdmissionConfig::default();
        assert_eq!(cfg.limit(Priority::Critical), TokenBucketConfig::new(50.0, 20));
        assert_eq!(cfg.limit(Priority::High), TokenBucketConfig::new(200.0, 50));
        assert_eq!(cfg.limit(Priority::Medium), TokenBucketConfig::new(500.0, 100));
        assert_eq!(cfg.limit(Priority::Low), TokenBucketConfig::new(1_000.0, 200));
        assert!(cfg.enforce_critical_limit);
    }

    #[test]
    fn admission_burst_then_refusal() {
        let (clock, _) = ManualClock::shared(0);
        let ctrl = AdmissionController::new(AdmissionConfig::default(), clock).unwrap();
        for _ in 0..20 {
            assert!(ctrl.admit(Priority::Critical));
        }
        assert!(!ctrl.admit(Priority::Critical));

        // Other classes are unaffected.
        assert!(ctrl.admit(Priority::Low));

        let stats = ctrl.stats();
        assert_eq!(stats.get(Priority::Critical).admitted, 20);
        assert_eq!(stats.get(Priority::Critical).rejected, 1);
        assert_eq!(stats.get(Priority::Low).admitted, 1);
        assert_eq!(stats.total_rejected(), 1);
    }

    #[test]
    fn admission_refills_over_time() {
        let (clock, time) = ManualClock::shared(0);
        let cfg = AdmissionConfig::default().with_limit(Priority::High, TokenBucketConfig::new(100.0, 1));
        let ctrl = AdmissionController::new(cfg, clock).unwrap();
        assert!(ctrl.admit(Priority::High));
        assert!(!ctrl.admit(Priority::High));
        time.advance(10);
        assert!(ctrl.admit(Priority::High));
    }

    #[test]
    fn critical_bypass_when_not_enforced() {
        let (clock, _) = ManualClock::shared(0);
        let cfg = AdmissionConfig {
            enforce_critical_limit: false,
            ..AdmissionConfig::default()
        };
        let ctrl = AdmissionController::new(cfg, clock).unwrap();
        for _ in 0..100 {
            assert!(ctrl.admit(Priority::Critical));
        }
        assert_eq!(ctrl.stats().get(Priority::Critical).admitted, 100);
    }

    #[test]
    fn admission_reset() {
        let (clock, _) = ManualClock::shared(0);
        let ctrl = AdmissionController::new(AdmissionConfig::default(), clock).unwrap();
        while ctrl.admit(Priority::Medium) {}
        ctrl.reset();
        let stats = ctrl.stats();
        assert_eq!(stats.get(Priority::Medium).admitted, 0);
        assert_eq!(stats.get(Priority::Medium).rejected, 0);
        assert_eq!(stats.get(Priority::Medium).tokens_available, 100.0);
    }
}
