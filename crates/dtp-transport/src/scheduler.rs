//! # Deadline Scheduler
//!
//! Bounded priority queue releasing packets one at a time by
//! `(priority rank, absolute deadline, arrival)`: strict priority across
//! classes, earliest-deadline-first within a class, FIFO among equal deadlines.
//!
//! ```text
//!  enqueue ──▶ expired? ──▶ capacity/evict ──▶ Low & !EXPEDITED ──▶ batch buffer
//!                                                   │                    │ size / age
//!                                                   ▼                    ▼
//!                                              ┌────────────────────────────┐
//!                                              │ heap of (SortKey, arena id) │
//!                                              └─────────────┬──────────────┘
//!  dequeue ◀── congestion gate ◀── expiry tolerance ◀── pop min
//! ```
//!
//! Packets live out-of-line in a `slab` arena; the heap only holds keys.
//! Evicting an entry removes it from the arena and leaves its heap item
//! behind; such stale items are skipped on pop and swept out when they come
//! to dominate the heap.
//!
//! `dequeue` never blocks. Under congestion a lowest-rank head yields
//! [`DequeueOutcome::Deferred`] and the caller backs off before polling again.

use serde::Serialize;
use slab::Slab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::SharedClock;
use crate::config::{ensure_positive, ConfigError};
use crate::congestion::CongestionSignal;
use crate::stats::{DropReason, MetricsSink, NoopSink};
use crate::wire::{Packet, PacketFlags, PacketHeader, Priority};

/// Heap sweeps only start once this many stale items have accumulated.
const COMPACT_MIN_STALE: usize = 64;

// ─── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Capacity, counting heap and batch-buffer members.
    pub max_queue_size: usize,
    /// Batch flushes when it holds this many packets.
    pub batch_size: usize,
    /// Batch flushes once its first packet is this old.
    pub batch_timeout_ms: u64,
    /// Global switch for lowest-priority batching.
    pub batching: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_queue_size: 1_000,
            batch_size: 10,
            batch_timeout_ms: 50,
            batching: true,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("max_queue_size", self.max_queue_size as f64)?;
        ensure_positive("batch_size", self.batch_size as f64)
    }
}

// ─── Dequeue Outcome ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueOutcome {
    Sent(Packet),
    /// Nothing queued and no pending batches.
    Empty,
    /// Head is held back by the congestion gate; poll again later.
    Deferred,
}

impl DequeueOutcome {
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            DequeueOutcome::Sent(p) => Some(p),
            _ => None,
        }
    }
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub deferred: u64,
    pub dropped_full: u64,
    pub dropped_expired: u64,
    pub evicted: u64,
    pub batches_flushed: u64,
    /// Packets currently held (heap + batch buffers).
    pub queued: usize,
    pub pending_batched: usize,
}

// ─── Expiry tolerance ───────────────────────────────────────────────────────

/// Dequeue-time expiry rule: Critical never expires, High gets a 2× grace
/// window, Medium and Low expire strictly past `timestamp + deadline`.
pub fn expired_for_dequeue(header: &PacketHeader, now_ms: u64) -> bool {
    match header.priority {
        Priority::Critical => false,
        Priority::High => now_ms > header.timestamp.saturating_add(header.deadline.saturating_mul(2)),
        Priority::Medium | Priority::Low => header.is_expired(now_ms),
    }
}

// ─── Internal state ─────────────────────────────────────────────────────────

/// Heap order: rank, then absolute deadline, then enqueue order. The 16-bit
/// wire sequence wraps, so FIFO among equal deadlines uses the scheduler's
/// own arrival counter instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    priority: Priority,
    deadline: u64,
    arrival: u64,
}

impl SortKey {
    fn new(header: &PacketHeader, arrival: u64) -> Self {
        SortKey {
            priority: header.priority,
            deadline: header.absolute_deadline(),
            arrival,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Heap,
    Batched,
}

struct Entry {
    packet: Packet,
    key: SortKey,
    slot: Slot,
}

#[derive(Default)]
struct BatchBuffer {
    ids: Vec<usize>,
    started_ms: u64,
}

struct SchedulerState {
    arena: Slab<Entry>,
    heap: BinaryHeap<Reverse<(SortKey, usize)>>,
    batches: [BatchBuffer; 4],
    batched: usize,
    stale: usize,
    next_arrival: u64,
    next_batch_id: u16,
    stats: SchedulerStats,
}

type Drops = Vec<(Packet, DropReason)>;

impl SchedulerState {
    fn new(capacity: usize) -> Self {
        SchedulerState {
            arena: Slab::with_capacity(capacity),
            heap: BinaryHeap::with_capacity(capacity),
            batches: Default::default(),
            batched: 0,
            stale: 0,
            next_arrival: 0,
            next_batch_id: 1,
            stats: SchedulerStats::default(),
        }
    }

    fn is_live(&self, key: &SortKey, id: usize) -> bool {
        self.arena
            .get(id)
            .is_some_and(|e| e.slot == Slot::Heap && e.key == *key)
    }

    fn heap_live(&self) -> usize {
        self.arena.len() - self.batched
    }

    fn insert(&mut self, packet: Packet, batch: bool, now: u64, config: &SchedulerConfig) {
        let key = SortKey::new(&packet.header, self.next_arrival);
        self.next_arrival += 1;
        self.stats.enqueued += 1;

        if !batch {
            let id = self.arena.insert(Entry {
                packet,
                key,
                slot: Slot::Heap,
            });
            self.heap.push(Reverse((key, id)));
            return;
        }

        let idx = key.priority.index();
        let id = self.arena.insert(Entry {
            packet,
            key,
            slot: Slot::Batched,
        });
        self.batched += 1;
        let buf = &mut self.batches[idx];
        if buf.ids.is_empty() {
            buf.started_ms = now;
        }
        buf.ids.push(id);
        let full = buf.ids.len() >= config.batch_size;
        let aged = now.saturating_sub(buf.started_ms) >= config.batch_timeout_ms;
        if full || aged {
            self.flush_batch(idx);
        }
    }

    /// Move one batch buffer into the heap under a fresh batch id.
    fn flush_batch(&mut self, idx: usize) {
        let ids = std::mem::take(&mut self.batches[idx].ids);
        if ids.is_empty() {
            return;
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id = match self.next_batch_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };

        for &id in &ids {
            if let Some(entry) = self.arena.get_mut(id) {
                entry.packet.header.flags.insert(PacketFlags::BATCHED);
                entry.packet.header.batch_id = batch_id;
                entry.slot = Slot::Heap;
                self.heap.push(Reverse((entry.key, id)));
            }
        }
        self.batched -= ids.len();
        self.stats.batches_flushed += 1;
        tracing::trace!(batch_id, size = ids.len(), "batch flushed");
    }

    fn flush_all(&mut self) {
        for idx in 0..self.batches.len() {
            self.flush_batch(idx);
        }
    }

    fn flush_due(&mut self, now: u64, timeout_ms: u64) {
        let drain_all = self.heap_live() == 0;
        for idx in 0..self.batches.len() {
            let buf = &self.batches[idx];
            if buf.ids.is_empty() {
                continue;
            }
            if drain_all || now.saturating_sub(buf.started_ms) >= timeout_ms {
                self.flush_batch(idx);
            }
        }
    }

    /// Remove an entry from wherever it lives.
    fn remove(&mut self, id: usize) -> Packet {
        let entry = self.arena.remove(id);
        match entry.slot {
            Slot::Heap => self.stale += 1,
            Slot::Batched => {
                self.batched -= 1;
                self.batches[entry.key.priority.index()]
                    .ids
                    .retain(|&b| b != id);
            }
        }
        entry.packet
    }

    /// Free one slot for an incoming packet of `incoming` priority. Expired
    /// entries go first; otherwise an urgent arrival may evict the max-key
    /// entry, but only one of strictly lower rank.
    fn make_room(&mut self, incoming: Priority, now: u64, drops: &mut Drops) -> bool {
        let expired = self
            .arena
            .iter()
            .filter(|(_, e)| expired_for_dequeue(&e.packet.header, now))
            .max_by_key(|(_, e)| e.key)
            .map(|(id, _)| id);
        if let Some(id) = expired {
            let packet = self.remove(id);
            self.stats.dropped_expired += 1;
            drops.push((packet, DropReason::ExpiredInQueue));
            return true;
        }

        if !incoming.is_urgent() {
            return false;
        }

        let victim = self
            .arena
            .iter()
            .max_by_key(|(_, e)| e.key)
            .filter(|(_, e)| e.key.priority > incoming)
            .map(|(id, _)| id);
        match victim {
            Some(id) => {
                let packet = self.remove(id);
                tracing::debug!(
                    victim = %packet.priority(),
                    seq = packet.header.sequence,
                    incoming = %incoming,
                    "scheduler full, evicting"
                );
                self.stats.evicted += 1;
                drops.push((packet, DropReason::Evicted));
                true
            }
            None => false,
        }
    }

    fn maybe_compact(&mut self) {
        if self.stale < COMPACT_MIN_STALE || self.stale * 2 < self.heap.len() {
            return;
        }
        let arena = &self.arena;
        self.heap.retain(|Reverse((key, id))| {
            arena
                .get(*id)
                .is_some_and(|e| e.slot == Slot::Heap && e.key == *key)
        });
        self.stale = 0;
    }

    /// Pop the next sendable entry, discarding expired ones.
    fn pop(&mut self, now: u64, congested: bool, drops: &mut Drops) -> DequeueOutcome {
        while let Some(Reverse((key, id))) = self.heap.pop() {
            if !self.is_live(&key, id) {
                self.stale = self.stale.saturating_sub(1);
                continue;
            }

            let entry = &self.arena[id];
            if expired_for_dequeue(&entry.packet.header, now) {
                let entry = self.arena.remove(id);
                self.stats.dropped_expired += 1;
                drops.push((entry.packet, DropReason::ExpiredInQueue));
                continue;
            }

            if congested && key.priority.is_lowest() && !entry.packet.is_expedited() {
                self.heap.push(Reverse((key, id)));
                self.stats.deferred += 1;
                return DequeueOutcome::Deferred;
            }

            let entry = self.arena.remove(id);
            self.stats.dequeued += 1;
            return DequeueOutcome::Sent(entry.packet);
        }
        DequeueOutcome::Empty
    }
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

/// Thread-safe deadline scheduler. One mutex guards all queue state and is
/// held only for the duration of a single call.
pub struct DeadlineScheduler {
    config: SchedulerConfig,
    clock: SharedClock,
    congestion: Option<Arc<dyn CongestionSignal>>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<SchedulerState>,
}

impl DeadlineScheduler {
    pub fn new(config: SchedulerConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = SchedulerState::new(config.max_queue_size);
        Ok(DeadlineScheduler {
            config,
            clock,
            congestion: None,
            metrics: Arc::new(NoopSink),
            state: Mutex::new(state),
        })
    }

    /// Gate lowest-priority traffic on this signal.
    pub fn with_congestion(mut self, signal: Arc<dyn CongestionSignal>) -> Self {
        self.congestion = Some(signal);
        self
    }

    /// Report every drop to `sink`.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ─── Enqueue ────────────────────────────────────────────────────────

    /// Enqueue with batching allowed. Returns whether the packet was accepted.
    pub fn enqueue(&self, packet: Packet) -> bool {
        self.enqueue_with(packet, true)
    }

    pub fn enqueue_with(&self, packet: Packet, allow_batch: bool) -> bool {
        let now = self.clock.now_ms();
        let priority = packet.priority();
        let mut drops = Drops::new();

        let accepted = {
            let mut st = self.lock();
            if !priority.is_urgent() && packet.header.is_expired(now) {
                st.stats.dropped_expired += 1;
                drops.push((packet, DropReason::ExpiredAtEnqueue));
                false
            } else if st.arena.len() >= self.config.max_queue_size
                && !st.make_room(priority, now, &mut drops)
            {
                st.stats.dropped_full += 1;
                drops.push((packet, DropReason::QueueFull));
                false
            } else {
                let batch = allow_batch
                    && self.config.batching
                    && priority.is_lowest()
                    && !packet.is_expedited();
                st.insert(packet, batch, now, &self.config);
                st.maybe_compact();
                true
            }
        };

        self.report(drops);
        accepted
    }

    // ─── Dequeue ────────────────────────────────────────────────────────

    pub fn dequeue(&self) -> DequeueOutcome {
        // Read before taking our own lock; the two locks never nest.
        let congested = self
            .congestion
            .as_ref()
            .is_some_and(|c| c.is_congested());
        let now = self.clock.now_ms();
        let mut drops = Drops::new();

        let outcome = {
            let mut st = self.lock();
            st.flush_due(now, self.config.batch_timeout_ms);
            st.pop(now, congested, &mut drops)
        };

        self.report(drops);
        outcome
    }

    /// Flush every batch buffer into the heap regardless of size or age.
    pub fn flush_all(&self) {
        self.lock().flush_all();
    }

    /// Remove everything still sendable in dequeue order, ignoring the
    /// congestion gate. Expiry tolerance still applies.
    pub fn drain(&self) -> Vec<Packet> {
        let now = self.clock.now_ms();
        let mut drops = Drops::new();
        let mut out = Vec::new();
        {
            let mut st = self.lock();
            st.flush_all();
            while let DequeueOutcome::Sent(packet) = st.pop(now, false, &mut drops) {
                out.push(packet);
            }
        }
        self.report(drops);
        out
    }

    // ─── Introspection ──────────────────────────────────────────────────

    /// Packets held, heap and batch buffers together.
    pub fn len(&self) -> usize {
        self.lock().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_batched(&self) -> usize {
        self.lock().batched
    }

    /// Discard everything without reporting drops. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut st = self.lock();
        let removed = st.arena.len();
        st.arena.clear();
        st.heap.clear();
        st.batches = Default::default();
        st.batched = 0;
        st.stale = 0;
        removed
    }

    pub fn stats(&self) -> SchedulerStats {
        let st = self.lock();
        SchedulerStats {
            queued: st.arena.len(),
            pending_batched: st.batched,
            ..st.stats.clone()
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(&self, drops: Drops) {
        for (packet, reason) in drops {
            tracing::trace!(
                priority = %packet.priority(),
                seq = packet.header.sequence,
                reason = reason.as_str(),
                "scheduler drop"
            );
            self.metrics.record_dropped(&packet, reason);
        }
    }
}
