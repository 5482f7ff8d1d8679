//! # Delivery Metrics
//!
//! Per-priority delivery statistics and the [`MetricsSink`] seam through which
//! the scheduler, sender and receiver report packet lifecycle events.
//! Snapshots are `Serialize` for JSON export.
//!
//! Latency aggregates cover the most recent [`LATENCY_WINDOW`] samples per
//! class; counters are lifetime totals. Receive throughput is a packets/s
//! count over a trailing [`THROUGHPUT_WINDOW_MS`] window, read from the
//! collector's clock.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::clock::{MonotonicClock, SharedClock};
use crate::wire::{Packet, Priority};

/// Latency percentiles fall back to the maximum below this many samples.
const MIN_PERCENTILE_SAMPLES: usize = 20;

/// Latency samples retained per priority class.
pub const LATENCY_WINDOW: usize = 10_000;

/// Trailing window over which receive throughput is counted.
pub const THROUGHPUT_WINDOW_MS: u64 = 1_000;

/// Minimum spacing between throughput history points.
pub const THROUGHPUT_REFRESH_MS: u64 = 100;

/// Throughput history points retained.
pub const THROUGHPUT_HISTORY_LEN: usize = 200;

// ─── Drop Reasons ───────────────────────────────────────────────────────────

/// Why a packet never reached (or was discarded by) the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    /// Already past its deadline when offered to the scheduler.
    ExpiredAtEnqueue,
    /// Expired while waiting in the queue.
    ExpiredInQueue,
    /// Queue at capacity and nothing could be evicted.
    QueueFull,
    /// Removed to make room for a more urgent packet.
    Evicted,
    /// Refused by the per-priority token bucket.
    AdmissionRefused,
    /// Receiver saw the packet after its deadline.
    ExpiredOnArrival,
    /// Header did not fit the wire format.
    EncodingFailed,
    /// The datagram transport returned an error.
    TransportError,
}

impl DropReason {
    /// Metrics tag. Both expiry variants share `dropped_expired`, matching
    /// the scheduler's single `dropped_expired` counter.
    pub const fn as_str(self) -> &'static str {
        match self {
            DropReason::ExpiredAtEnqueue => "dropped_expired",
            DropReason::ExpiredInQueue => "dropped_expired",
            DropReason::QueueFull => "dropped_full",
            DropReason::Evicted => "evicted",
            DropReason::AdmissionRefused => "admission_refused",
            DropReason::ExpiredOnArrival => "expired_on_arrival",
            DropReason::EncodingFailed => "encoding_failed",
            DropReason::TransportError => "transport_error",
        }
    }
}

// ─── Sink ───────────────────────────────────────────────────────────────────

/// Receives packet lifecycle events. Implementations must be cheap; they are
/// called from the sender's hot path (never while a scheduler lock is held).
pub trait MetricsSink: Send + Sync {
    /// A packet was generated and offered for sending.
    fn record_sent(&self, packet: &Packet);
    /// A packet arrived; `latency_ms` is receive time minus creation time.
    fn record_received(&self, packet: &Packet, latency_ms: i64);
    fn record_dropped(&self, packet: &Packet, reason: DropReason);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_sent(&self, _packet: &Packet) {}
    fn record_received(&self, _packet: &Packet, _latency_ms: i64) {}
    fn record_dropped(&self, _packet: &Packet, _reason: DropReason) {}
}

// ─── Priority Stats ─────────────────────────────────────────────────────────

/// Aggregated statistics for one priority class.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PriorityStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    /// Received with `latency <= deadline`.
    pub on_time: u64,
    pub late: u64,
    /// Drop counts keyed by [`DropReason::as_str`].
    pub drops_by_reason: BTreeMap<&'static str, u64>,
    /// Most recent [`LATENCY_WINDOW`] samples, oldest first.
    #[serde(skip)]
    latencies: VecDeque<f64>,
}

impl PriorityStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&mut self, latency_ms: f64, on_time: bool) {
        self.received += 1;
        if on_time {
            self.on_time += 1;
        } else {
            self.late += 1;
        }
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
    }

    pub fn record_drop(&mut self, reason: DropReason) {
        self.dropped += 1;
        *self.drops_by_reason.entry(reason.as_str()).or_insert(0) += 1;
    }

    /// received / sent.
    pub fn delivery_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.received as f64 / self.sent as f64
        }
    }

    /// on_time / received.
    pub fn on_time_rate(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            self.on_time as f64 / self.received as f64
        }
    }

    pub fn avg_latency(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }

    pub fn median_latency(&self) -> f64 {
        median_of(&self.sorted_latencies())
    }

    pub fn p95_latency(&self) -> f64 {
        self.percentile(0.95)
    }

    pub fn p99_latency(&self) -> f64 {
        self.percentile(0.99)
    }

    /// Percentile by index `min(floor(q·n), n−1)` into the sorted samples.
    /// With fewer than 20 samples this is the maximum observed latency.
    pub fn percentile(&self, q: f64) -> f64 {
        percentile_of(&self.sorted_latencies(), q)
    }

    /// Retained latency samples, oldest first.
    pub fn latencies(&self) -> impl Iterator<Item = f64> + '_ {
        self.latencies.iter().copied()
    }

    fn sorted_latencies(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted
    }

    /// Flattened, serializable summary including derived rates.
    pub fn summary(&self) -> PrioritySummary {
        let sorted = self.sorted_latencies();
        PrioritySummary {
            sent: self.sent,
            received: self.received,
            dropped: self.dropped,
            on_time: self.on_time,
            late: self.late,
            delivery_rate: self.delivery_rate(),
            on_time_rate: self.on_time_rate(),
            avg_latency_ms: self.avg_latency(),
            median_latency_ms: median_of(&sorted),
            p95_latency_ms: percentile_of(&sorted, 0.95),
            p99_latency_ms: percentile_of(&sorted, 0.99),
            drops_by_reason: self.drops_by_reason.clone(),
        }
    }
}

fn median_of(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

fn percentile_of(sorted: &[f64], q: f64) -> f64 {
    let Some(&max) = sorted.last() else {
        return 0.0;
    };
    if sorted.len() < MIN_PERCENTILE_SAMPLES {
        return max;
    }
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Serializable view of [`PriorityStats`] with derived values computed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrioritySummary {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub on_time: u64,
    pub late: u64,
    pub delivery_rate: f64,
    pub on_time_rate: f64,
    pub avg_latency_ms: f64,
    pub median_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub drops_by_reason: BTreeMap<&'static str, u64>,
}

// ─── Throughput ─────────────────────────────────────────────────────────────

/// One throughput history point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputPoint {
    /// Clock time the point was taken.
    pub at_ms: u64,
    pub packets_per_sec: f64,
}

/// Sliding-window receive counter.
#[derive(Debug, Default)]
struct ThroughputMeter {
    /// Receive times inside the trailing window, oldest first.
    arrivals: VecDeque<u64>,
    last_point_ms: Option<u64>,
    history: VecDeque<ThroughputPoint>,
}

impl ThroughputMeter {
    fn record(&mut self, now: u64) {
        self.arrivals.push_back(now);
        let rate = self.rate_at(now);
        if self
            .last_point_ms
            .is_some_and(|last| now.saturating_sub(last) < THROUGHPUT_REFRESH_MS)
        {
            return;
        }
        self.last_point_ms = Some(now);
        if self.history.len() == THROUGHPUT_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(ThroughputPoint {
            at_ms: now,
            packets_per_sec: rate,
        });
    }

    /// Packets/s over `(now − window, now]`, pruning older arrivals.
    fn rate_at(&mut self, now: u64) -> f64 {
        if let Some(cutoff) = now.checked_sub(THROUGHPUT_WINDOW_MS) {
            while self.arrivals.front().is_some_and(|&t| t <= cutoff) {
                self.arrivals.pop_front();
            }
        }
        self.arrivals.len() as f64 * 1_000.0 / THROUGHPUT_WINDOW_MS as f64
    }
}

// ─── Collector ──────────────────────────────────────────────────────────────

/// Everything [`MetricsCollector::snapshot`] reports. Serializes as one
/// object keyed by priority name plus a `throughput_pps` field.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub throughput_pps: f64,
    #[serde(flatten)]
    pub priorities: BTreeMap<&'static str, PrioritySummary>,
}

/// In-memory [`MetricsSink`] keeping a [`PriorityStats`] per class and a
/// receive throughput window.
pub struct MetricsCollector {
    clock: SharedClock,
    stats: Mutex<[PriorityStats; 4]>,
    throughput: Mutex<ThroughputMeter>,
}

impl MetricsCollector {
    /// Collector timing throughput against its own monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        MetricsCollector {
            clock,
            stats: Mutex::default(),
            throughput: Mutex::default(),
        }
    }

    /// Copy of the stats for one priority.
    pub fn priority(&self, priority: Priority) -> PriorityStats {
        self.lock()[priority.index()].clone()
    }

    /// Packets/s received over the trailing window ending now.
    pub fn throughput(&self) -> f64 {
        let now = self.clock.now_ms();
        self.meter().rate_at(now)
    }

    /// Throughput points, oldest first, at most one per refresh interval.
    pub fn throughput_history(&self) -> Vec<ThroughputPoint> {
        self.meter().history.iter().copied().collect()
    }

    /// Per-priority summaries keyed by priority name, plus throughput.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let priorities = {
            let stats = self.lock();
            Priority::ALL
                .iter()
                .map(|p| (p.as_str(), stats[p.index()].summary()))
                .collect()
        };
        MetricsSnapshot {
            throughput_pps: self.throughput(),
            priorities,
        }
    }

    pub fn reset(&self) {
        *self.lock() = Default::default();
        *self.meter() = ThroughputMeter::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [PriorityStats; 4]> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn meter(&self) -> std::sync::MutexGuard<'_, ThroughputMeter> {
        self.throughput.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("stats", &*self.lock())
            .field("throughput", &*self.meter())
            .finish()
    }
}

impl MetricsSink for MetricsCollector {
    fn record_sent(&self, packet: &Packet) {
        self.lock()[packet.priority().index()].sent += 1;
    }

    fn record_received(&self, packet: &Packet, latency_ms: i64) {
        let on_time = latency_ms <= packet.header.deadline as i64;
        self.lock()[packet.priority().index()].record_latency(latency_ms as f64, on_time);
        let now = self.clock.now_ms();
        self.meter().record(now);
    }

    fn record_dropped(&self, packet: &Packet, reason: DropReason) {
        self.lock()[packet.priority().index()].record_drop(reason);
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    /// `alpha` is clamped to `[0, 1]`; higher reacts faster.
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: 0.0,
            initialized: false,
        }
    }

    /// Fold in a sample and return the smoothed value. The first sample seeds it.
    pub fn update(&mut self, sample: f64) -> f64 {
        if self.initialized {
            self.value += self.alpha * (sample - self.value);
        } else {
            self.value = sample;
            self.initialized = true;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}
