//! # Monotonic Time Reference
//!
//! Every timestamp in DTP is "milliseconds since a reference point". The
//! reference is captured once when a clock is built and can be re-captured
//! with [`Clock::reset`] between runs. All components receive the clock
//! through their constructors as a [`SharedClock`]; nothing reads the system
//! wall clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quanta::Clock as QuantaClock;

// ─── Clock Capability ───────────────────────────────────────────────────────

/// Source of monotonic milliseconds relative to a resettable reference.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since the reference point.
    fn now_ms(&self) -> u64;

    /// Move the reference point to "now".
    fn reset(&self);
}

/// Clock handle shared by all components of one run.
pub type SharedClock = Arc<dyn Clock>;

// ─── MonotonicClock ─────────────────────────────────────────────────────────

/// TSC-backed monotonic clock (via `quanta`).
pub struct MonotonicClock {
    clock: QuantaClock,
    /// Raw quanta reading taken at the reference point.
    reference: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::with_clock(QuantaClock::new())
    }

    /// Build on top of an existing quanta clock (e.g. `quanta::Clock::mock()`).
    pub fn with_clock(clock: QuantaClock) -> Self {
        let reference = AtomicU64::new(clock.raw());
        MonotonicClock { clock, reference }
    }

    /// Convenience constructor returning a [`SharedClock`].
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        let start = self.reference.load(Ordering::Acquire);
        let end = self.clock.raw();
        if end <= start {
            return 0;
        }
        self.clock.delta(start, end).as_millis() as u64
    }

    fn reset(&self) {
        self.reference.store(self.clock.raw(), Ordering::Release);
    }
}

// ─── ManualClock ────────────────────────────────────────────────────────────

/// Clock that only moves when told to. Used by tests and offline simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Shared handle to a new manual clock, plus the concrete handle for driving it.
    pub fn shared(start_ms: u64) -> (SharedClock, Arc<ManualClock>) {
        let clock = Arc::new(Self::new(start_ms));
        (clock.clone(), clock)
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Release);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.now.store(0, Ordering::Release);
    }
}
