//! # AIMD Congestion Control
//!
//! A single scalar send rate (packets/s) governed by additive increase on
//! acknowledgments and multiplicative decrease on loss, plus a pacing token
//! bucket derived from that rate. The bucket decides *how fast* the sender may
//! drain the scheduler; the scheduler alone decides *what* goes next.
//!
//! ```text
//!   rate
//!    ▲        +ai  +ai  +ai
//!    │           ┌──┐┌──┐┌──┐        +ai  +ai
//!    │        ┌──┘  └┘  └┘  │     ┌──┐┌──┐
//!    │     ┌──┘             │  ┌──┘  └┘  └─ ...
//!    │  ───┘                └──┘  ×(1 − md) on loss
//!    └──────────────────────────────────────────▶ t
//! ```
//!
//! `is_congested()` is derived, never stored: loss ratio over the current
//! window, smoothed one-way latency, or a held receiver congestion notice.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::admission::{TokenBucket, TokenBucketStats};
use crate::clock::SharedClock;
use crate::config::{ensure_positive, ensure_range, ConfigError};
use crate::stats::Ewma;

/// Smoothing factor for one-way latency samples.
const LATENCY_EWMA_ALPHA: f64 = 0.125;

/// Lower bound on the pacing bucket's burst.
const MIN_PACING_BURST: f64 = 10.0;

// ─── Congestion Signal ──────────────────────────────────────────────────────

/// Read-only view of "is the link congested right now", consumed by the
/// scheduler's low-priority gate.
pub trait CongestionSignal: Send + Sync {
    fn is_congested(&self) -> bool;
}

impl CongestionSignal for AtomicBool {
    fn is_congested(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

// ─── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CongestionConfig {
    /// Starting rate, packets/s.
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Packets/s added per acknowledgment event.
    pub additive_increase: f64,
    /// Fraction removed per loss event, in `(0, 1]`.
    pub multiplicative_decrease: f64,
    /// Loss ratio above which the link counts as congested.
    pub loss_threshold: f64,
    /// Loss accounting window.
    pub window_ms: u64,
    /// Smoothed one-way latency above which the link counts as congested.
    pub latency_threshold_ms: f64,
    /// How long a receiver congestion notice keeps the link congested.
    pub notice_hold_ms: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        CongestionConfig {
            initial_rate: 500.0,
            min_rate: 50.0,
            max_rate: 5_000.0,
            additive_increase: 10.0,
            multiplicative_decrease: 0.5,
            loss_threshold: 0.02,
            window_ms: 1_000,
            latency_threshold_ms: 250.0,
            notice_hold_ms: 1_000,
        }
    }
}

impl CongestionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("min_rate", self.min_rate)?;
        ensure_positive("max_rate", self.max_rate)?;
        if self.min_rate > self.max_rate {
            return Err(ConfigError::RateBounds {
                min: self.min_rate,
                max: self.max_rate,
            });
        }
        ensure_range("initial_rate", self.initial_rate, self.min_rate, self.max_rate)?;
        ensure_positive("additive_increase", self.additive_increase)?;
        ensure_positive("multiplicative_decrease", self.multiplicative_decrease)?;
        ensure_range("multiplicative_decrease", self.multiplicative_decrease, 0.0, 1.0)?;
        ensure_range("loss_threshold", self.loss_threshold, 0.0, 1.0)?;
        ensure_positive("window_ms", self.window_ms as f64)?;
        ensure_positive("latency_threshold_ms", self.latency_threshold_ms)
    }
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct CongestionStats {
    pub rate: f64,
    pub congested: bool,
    pub loss_ratio: f64,
    pub smoothed_latency_ms: f64,
    pub sent_in_window: u64,
    pub lost_in_window: u64,
    pub acks: u64,
    pub losses: u64,
    pub timeouts: u64,
    pub notices: u64,
    pub pacing: TokenBucketStats,
}

// ─── Controller ─────────────────────────────────────────────────────────────

struct CongestionState {
    rate: f64,
    pacing: TokenBucket,

    // ─── Loss window ───
    window_start_ms: u64,
    sent_in_window: u64,
    lost_in_window: u64,
    /// Loss ratio of the last completed window.
    prev_loss_ratio: f64,

    latency: Ewma,
    notice_until_ms: Option<u64>,

    acks: u64,
    losses: u64,
    timeouts: u64,
    notices: u64,
}

/// AIMD rate controller. All state sits behind its own lock, independent of
/// the scheduler's.
pub struct CongestionController {
    config: CongestionConfig,
    clock: SharedClock,
    state: Mutex<CongestionState>,
}

fn pacing_burst(rate: f64) -> f64 {
    (rate / 10.0).floor().max(MIN_PACING_BURST)
}

impl CongestionController {
    pub fn new(config: CongestionConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = Self::initial_state(&config, &clock);
        Ok(CongestionController {
            config,
            clock,
            state: Mutex::new(state),
        })
    }

    fn initial_state(config: &CongestionConfig, clock: &SharedClock) -> CongestionState {
        let rate = config.initial_rate;
        CongestionState {
            rate,
            pacing: TokenBucket::from_validated(rate, pacing_burst(rate), clock.clone()),
            window_start_ms: clock.now_ms(),
            sent_in_window: 0,
            lost_in_window: 0,
            prev_loss_ratio: 0.0,
            latency: Ewma::new(LATENCY_EWMA_ALPHA),
            notice_until_ms: None,
            acks: 0,
            losses: 0,
            timeouts: 0,
            notices: 0,
        }
    }

    pub fn config(&self) -> &CongestionConfig {
        &self.config
    }

    // ─── Feedback ───────────────────────────────────────────────────────

    /// A packet left the sender; counts toward the loss window denominator.
    pub fn on_packet_sent(&self) {
        let mut st = self.lock();
        self.roll_window(&mut st);
        st.sent_in_window += 1;
    }

    /// `n` acknowledgments arrived: one additive step, capped at `max_rate`.
    pub fn on_ack_received(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut st = self.lock();
        st.acks += n as u64;
        let rate = (st.rate + self.config.additive_increase).min(self.config.max_rate);
        self.set_rate(&mut st, rate);
    }

    /// `n` packets were lost: one multiplicative step, floored at `min_rate`.
    pub fn on_loss_detected(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut st = self.lock();
        self.roll_window(&mut st);
        st.losses += n as u64;
        st.lost_in_window += n as u64;
        let rate = (st.rate * (1.0 - self.config.multiplicative_decrease)).max(self.config.min_rate);
        self.set_rate(&mut st, rate);
        tracing::debug!(rate, lost = n, "congestion: multiplicative decrease");
    }

    /// Retransmission-timeout class event: decrease by `1.5 × md`.
    pub fn on_timeout(&self) {
        let mut st = self.lock();
        st.timeouts += 1;
        let factor = (1.0 - 1.5 * self.config.multiplicative_decrease).max(0.0);
        let rate = (st.rate * factor).max(self.config.min_rate);
        self.set_rate(&mut st, rate);
        tracing::debug!(rate, "congestion: timeout decrease");
    }

    /// Fold in a one-way latency measurement.
    pub fn on_latency_sample(&self, latency_ms: f64) {
        self.lock().latency.update(latency_ms);
    }

    /// The receiver reported congestion; hold the congested state for
    /// `notice_hold_ms`.
    pub fn on_congestion_notice(&self, level: f32) {
        let until = self.clock.now_ms() + self.config.notice_hold_ms;
        let mut st = self.lock();
        st.notices += 1;
        st.notice_until_ms = Some(until);
        tracing::debug!(level, hold_ms = self.config.notice_hold_ms, "congestion notice");
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn rate(&self) -> f64 {
        self.lock().rate
    }

    pub fn is_congested(&self) -> bool {
        let mut st = self.lock();
        self.roll_window(&mut st);
        self.congested_locked(&st)
    }

    /// Take one pacing token if available.
    pub fn try_acquire_send_slot(&self) -> bool {
        self.lock().pacing.consume(1)
    }

    /// Time until the next pacing token accrues.
    pub fn time_until_send_slot(&self) -> Duration {
        self.lock().pacing.time_until_available(1)
    }

    /// `1 / rate`, recomputed on every call.
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate())
    }

    pub fn stats(&self) -> CongestionStats {
        let mut st = self.lock();
        self.roll_window(&mut st);
        let congested = self.congested_locked(&st);
        let loss_ratio = Self::loss_ratio(&st);
        CongestionStats {
            rate: st.rate,
            congested,
            loss_ratio,
            smoothed_latency_ms: st.latency.value(),
            sent_in_window: st.sent_in_window,
            lost_in_window: st.lost_in_window,
            acks: st.acks,
            losses: st.losses,
            timeouts: st.timeouts,
            notices: st.notices,
            pacing: st.pacing.stats(),
        }
    }

    /// Return to the initial rate with a full pacing bucket and empty window.
    pub fn reset(&self) {
        *self.lock() = Self::initial_state(&self.config, &self.clock);
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, CongestionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_rate(&self, st: &mut CongestionState, rate: f64) {
        st.rate = rate;
        st.pacing.reconfigure(rate, pacing_burst(rate));
    }

    fn roll_window(&self, st: &mut CongestionState) {
        let now = self.clock.now_ms();
        if now.saturating_sub(st.window_start_ms) < self.config.window_ms {
            return;
        }
        st.prev_loss_ratio = if st.sent_in_window > 0 {
            st.lost_in_window as f64 / st.sent_in_window as f64
        } else {
            0.0
        };
        st.sent_in_window = 0;
        st.lost_in_window = 0;
        st.window_start_ms = now;
    }

    /// Current window's ratio once it has traffic, else the last window's.
    fn loss_ratio(st: &CongestionState) -> f64 {
        if st.sent_in_window > 0 {
            st.lost_in_window as f64 / st.sent_in_window as f64
        } else {
            st.prev_loss_ratio
        }
    }

    fn congested_locked(&self, st: &CongestionState) -> bool {
        let now = self.clock.now_ms();
        let noticed = st.notice_until_ms.is_some_and(|until| now < until);
        let lossy = Self::loss_ratio(st) > self.config.loss_threshold;
        let slow = st.latency.is_initialized()
            && st.latency.value() > self.config.latency_threshold_ms;
        noticed || lossy || slow
    }
}

impl CongestionSignal for CongestionController {
    fn is_congested(&self) -> bool {
        CongestionController::is_congested(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn controller() -> (CongestionController, Arc<ManualClock>) {
        let (clock, time) = ManualClock::shared(0);
        let cc = CongestionController::new(CongestionConfig::default(), clock).unwrap();
        (cc, time)
    }

    // ─── AIMD ───────────────────────────────────────────────────────────

    #[test]
    fn starts_at_initial_rate() {
        let (cc, _) = controller();
        assert_eq!(cc.rate(), 500.0);
        assert!(!cc.is_congested());
    }

    #[test]
    fn single_loss_multiplies_exactly() {
        let (cc, _) = controller();
        cc.on_loss_detected(1);
        assert_eq!(cc.rate(), 250.0);
    }

    #[test]
    fn ack_adds_once_per_event() {
        let (cc, _) = controller();
        cc.on_ack_received(5);
        assert_eq!(cc.rate(), 510.0);
        cc.on_ack_received(0);
        assert_eq!(cc.rate(), 510.0);
    }

    #[test]
    fn repeated_acks_capped_at_max() {
        let (cc, _) = controller();
        for _ in 0..10_000 {
            cc.on_ack_received(1);
        }
        assert_eq!(cc.rate(), 5_000.0);
    }

    #[test]
    fn repeated_losses_floored_at_min() {
        let (cc, _) = controller();
        for _ in 0..100 {
            cc.on_loss_detected(1);
        }
        assert_eq!(cc.rate(), 50.0);
    }

    #[test]
    fn timeout_cuts_harder_than_loss() {
        let (cc, _) = controller();
        cc.on_timeout();
        assert_eq!(cc.rate(), 125.0);
    }

    // ─── Congestion signal ──────────────────────────────────────────────

    #[test]
    fn loss_ratio_above_threshold_is_congested() {
        let (cc, _) = controller();
        for _ in 0..100 {
            cc.on_packet_sent();
        }
        cc.on_loss_detected(2);
        assert!(!cc.is_congested(), "2% is not above a 2% threshold");
        cc.on_loss_detected(1);
        assert!(cc.is_congested());
    }

    #[test]
    fn congestion_clears_after_clean_window() {
        let (cc, time) = controller();
        for _ in 0..10 {
            cc.on_packet_sent();
        }
        cc.on_loss_detected(5);
        assert!(cc.is_congested());

        // Next window: carried ratio until fresh traffic arrives.
        time.advance(1_000);
        assert!(cc.is_congested());
        for _ in 0..50 {
            cc.on_packet_sent();
        }
        assert!(!cc.is_congested());
    }

    #[test]
    fn latency_above_threshold_is_congested() {
        let (cc, _) = controller();
        cc.on_latency_sample(100.0);
        assert!(!cc.is_congested());
        for _ in 0..50 {
            cc.on_latency_sample(400.0);
        }
        assert!(cc.is_congested());
    }

    #[test]
    fn notice_held_for_configured_period() {
        let (cc, time) = controller();
        cc.on_congestion_notice(0.9);
        assert!(cc.is_congested());
        time.advance(999);
        assert!(cc.is_congested());
        time.advance(1);
        assert!(!cc.is_congested());
        assert_eq!(cc.stats().notices, 1);
    }

    #[test]
    fn atomic_bool_is_a_signal() {
        let flag = AtomicBool::new(false);
        assert!(!CongestionSignal::is_congested(&flag));
        flag.store(true, Ordering::Release);
        assert!(CongestionSignal::is_congested(&flag));
    }

    // ─── Pacing ─────────────────────────────────────────────────────────

    #[test]
    fn pacing_bucket_burst_tracks_rate() {
        let (cc, _) = controller();
        // burst = max(10, 500 / 10) = 50
        let mut granted = 0;
        while cc.try_acquire_send_slot() {
            granted += 1;
        }
        assert_eq!(granted, 50);
        assert!(cc.time_until_send_slot() > Duration::ZERO);
    }

    #[test]
    fn pacing_refills_at_rate() {
        let (cc, time) = controller();
        while cc.try_acquire_send_slot() {}
        time.advance(10); // 5 tokens at 500/s
        let mut granted = 0;
        while cc.try_acquire_send_slot() {
            granted += 1;
        }
        assert_eq!(granted, 5);
    }

    #[test]
    fn pacing_interval_follows_rate() {
        let (cc, _) = controller();
        assert_eq!(cc.pacing_interval(), Duration::from_millis(2));
        cc.on_loss_detected(1);
        assert_eq!(cc.pacing_interval(), Duration::from_millis(4));
    }

    #[test]
    fn reset_restores_initial_state() {
        let (cc, _) = controller();
        cc.on_loss_detected(1);
        cc.on_congestion_notice(1.0);
        cc.reset();
        assert_eq!(cc.rate(), 500.0);
        assert!(!cc.is_congested());
        assert_eq!(cc.stats().losses, 0);
    }

    // ─── Config ─────────────────────────────────────────────────────────

    #[test]
    fn rejects_initial_rate_outside_bounds() {
        let (clock, _) = ManualClock::shared(0);
        let cfg = CongestionConfig {
            initial_rate: 10.0,
            ..CongestionConfig::default()
        };
        assert!(matches!(
            CongestionController::new(cfg, clock),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn stats_serialize() {
        let (cc, _) = controller();
        cc.on_ack_received(1);
        let json = serde_json::to_value(cc.stats()).unwrap();
        assert_eq!(json["rate"], 510.0);
        assert_eq!(json["acks"], 1);
    }
}
