//! # Sender Runtime
//!
//! Wires admission, scheduling, pacing and the transport together behind a
//! dedicated worker thread.
//!
//! ```text
//!   submit ──▶ AdmissionController ──▶ DeadlineScheduler ─┐
//!                                                         │  worker thread
//!   ┌──── pacing slot? ◀─ CongestionController ◀──────────┘
//!   └──▶ dequeue ──▶ encode ──▶ Transport::send
//!
//!   feedback (ACK / NACK / CONGESTION) ──▶ CongestionController
//! ```
//!
//! The worker never spins: on `Empty`, `Deferred` or an exhausted pacing
//! bucket it sleeps for a bounded interval derived from the current rate.
//! On shutdown it flushes batches and drains the queue (expiry tolerance still
//! applies, the congestion gate does not) before exiting.

use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::admission::{AdmissionController, AdmissionStats};
use crate::clock::SharedClock;
use crate::config::{DeadlineTable, DtpConfig};
use crate::congestion::{CongestionController, CongestionStats};
use crate::scheduler::{DeadlineScheduler, DequeueOutcome, SchedulerStats};
use crate::stats::{DropReason, MetricsSink};
use crate::transport::Transport;
use crate::wire::{MalformedPacket, Packet, PacketFlags, PacketType, Priority};

/// Bounds on the worker's idle sleep.
const MIN_IDLE_SLEEP: Duration = Duration::from_micros(200);
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(10);

// ─── Packet Factory ─────────────────────────────────────────────────────────

/// Stamps sequence numbers and creation timestamps on outgoing data packets.
pub struct PacketFactory {
    clock: SharedClock,
    deadlines: DeadlineTable,
    next_seq: AtomicU16,
}

impl PacketFactory {
    pub fn new(clock: SharedClock, deadlines: DeadlineTable) -> Self {
        PacketFactory {
            clock,
            deadlines,
            next_seq: AtomicU16::new(0),
        }
    }

    /// Data packet with the class's default deadline.
    pub fn make(&self, priority: Priority, payload: Bytes) -> Packet {
        self.make_with_deadline(priority, self.deadlines.get(priority), payload)
    }

    pub fn make_with_deadline(&self, priority: Priority, deadline_ms: u64, payload: Bytes) -> Packet {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Packet::data(priority, seq, self.clock.now_ms(), deadline_ms, payload)
    }

    /// Data packet carrying extra flags (e.g. `RELIABLE`, `EXPEDITED`).
    pub fn make_flagged(&self, priority: Priority, flags: PacketFlags, payload: Bytes) -> Packet {
        let mut packet = self.make(priority, payload);
        packet.header.flags.insert(flags);
        packet
    }
}

// ─── Outcomes & Stats ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Refused by the priority's token bucket.
    Refused,
    /// Rejected by the scheduler (expired or queue full).
    Rejected,
}

#[derive(Debug, Default)]
struct SenderCounters {
    submitted: AtomicU64,
    admission_refused: AtomicU64,
    scheduler_rejected: AtomicU64,
    sent: AtomicU64,
    bytes_sent: AtomicU64,
    encode_failures: AtomicU64,
    transport_errors: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    congestion_notices: AtomicU64,
    malformed_feedback: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub submitted: u64,
    pub admission_refused: u64,
    pub scheduler_rejected: u64,
    pub sent: u64,
    pub bytes_sent: u64,
    pub encode_failures: u64,
    pub transport_errors: u64,
    pub acks: u64,
    pub nacks: u64,
    pub congestion_notices: u64,
    pub malformed_feedback: u64,
}

/// Everything the sender side knows, in one serializable snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub sender: SenderStats,
    pub scheduler: SchedulerStats,
    pub admission: AdmissionStats,
    pub congestion: CongestionStats,
}

// ─── Shared State ───────────────────────────────────────────────────────────

struct SenderShared {
    scheduler: DeadlineScheduler,
    admission: AdmissionController,
    congestion: Arc<CongestionController>,
    metrics: Arc<dyn MetricsSink>,
    transport: Arc<dyn Transport>,
    dest: SocketAddr,
    counters: SenderCounters,
}

impl SenderShared {
    fn submit(&self, packet: Packet) -> SubmitOutcome {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_sent(&packet);

        if !self.admission.admit(packet.priority()) {
            self.counters.admission_refused.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_dropped(&packet, DropReason::AdmissionRefused);
            return SubmitOutcome::Refused;
        }
        if self.scheduler.enqueue(packet) {
            SubmitOutcome::Queued
        } else {
            self.counters.scheduler_rejected.fetch_add(1, Ordering::Relaxed);
            SubmitOutcome::Rejected
        }
    }

    fn transmit(&self, packet: Packet) {
        let bytes = match packet.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(seq = packet.header.sequence, error = %e, "encode failed, skipping packet");
                self.counters.encode_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_dropped(&packet, DropReason::EncodingFailed);
                return;
            }
        };
        let len = bytes.len() as u64;
        match self.transport.send(bytes, self.dest) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                self.congestion.on_packet_sent();
            }
            Err(e) => {
                tracing::warn!(dest = %self.dest, seq = packet.header.sequence, error = %e, "transport send failed");
                self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_dropped(&packet, DropReason::TransportError);
            }
        }
    }

    fn handle_feedback(&self, bytes: Bytes) -> Result<PacketType, MalformedPacket> {
        let packet = Packet::decode(bytes).inspect_err(|e| {
            tracing::debug!(error = %e, "malformed feedback");
            self.counters.malformed_feedback.fetch_add(1, Ordering::Relaxed);
        })?;

        match packet.header.packet_type {
            PacketType::Ack => {
                self.counters.acks.fetch_add(1, Ordering::Relaxed);
                self.congestion.on_ack_received(1);
            }
            PacketType::Nack => {
                self.counters.nacks.fetch_add(1, Ordering::Relaxed);
                self.congestion.on_loss_detected(1);
            }
            PacketType::Congestion => {
                self.counters.congestion_notices.fetch_add(1, Ordering::Relaxed);
                self.congestion
                    .on_congestion_notice(packet.congestion_level().unwrap_or(1.0));
            }
            PacketType::Data | PacketType::Keepalive => {}
        }
        Ok(packet.header.packet_type)
    }

    fn idle_sleep(&self) -> Duration {
        self.congestion
            .pacing_interval()
            .clamp(MIN_IDLE_SLEEP, MAX_IDLE_SLEEP)
    }

    fn stats(&self) -> RuntimeStats {
        let c = &self.counters;
        RuntimeStats {
            sender: SenderStats {
                submitted: c.submitted.load(Ordering::Relaxed),
                admission_refused: c.admission_refused.load(Ordering::Relaxed),
                scheduler_rejected: c.scheduler_rejected.load(Ordering::Relaxed),
                sent: c.sent.load(Ordering::Relaxed),
                bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
                encode_failures: c.encode_failures.load(Ordering::Relaxed),
                transport_errors: c.transport_errors.load(Ordering::Relaxed),
                acks: c.acks.load(Ordering::Relaxed),
                nacks: c.nacks.load(Ordering::Relaxed),
                congestion_notices: c.congestion_notices.load(Ordering::Relaxed),
                malformed_feedback: c.malformed_feedback.load(Ordering::Relaxed),
            },
            scheduler: self.scheduler.stats(),
            admission: self.admission.stats(),
            congestion: self.congestion.stats(),
        }
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Cloneable handle for producer and feedback threads.
#[derive(Clone)]
pub struct SenderHandle {
    shared: Arc<SenderShared>,
}

impl SenderHandle {
    /// Admission → enqueue. The packet is recorded as sent at this point.
    pub fn submit(&self, packet: Packet) -> SubmitOutcome {
        self.shared.submit(packet)
    }

    /// Apply an ACK / NACK / CONGESTION datagram from the peer.
    pub fn handle_feedback(&self, bytes: Bytes) -> Result<PacketType, MalformedPacket> {
        self.shared.handle_feedback(bytes)
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }

    pub fn congestion(&self) -> &CongestionController {
        &self.shared.congestion
    }

    pub fn queued(&self) -> usize {
        self.shared.scheduler.len()
    }
}

// ─── Runtime ────────────────────────────────────────────────────────────────

/// Owns the sender worker thread.
pub struct SenderRuntime {
    handle: SenderHandle,
    shutdown: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SenderRuntime {
    pub fn spawn(
        config: &DtpConfig,
        clock: SharedClock,
        transport: Arc<dyn Transport>,
        dest: SocketAddr,
        metrics: Arc<dyn MetricsSink>,
    ) -> anyhow::Result<Self> {
        let congestion = Arc::new(CongestionController::new(
            config.congestion.clone(),
            clock.clone(),
        )?);
        let scheduler = DeadlineScheduler::new(config.scheduler.clone(), clock.clone())?
            .with_congestion(congestion.clone())
            .with_metrics(metrics.clone());
        let admission = AdmissionController::new(config.admission.clone(), clock)?;

        let shared = Arc::new(SenderShared {
            scheduler,
            admission,
            congestion,
            metrics,
            transport,
            dest,
            counters: SenderCounters::default(),
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("dtp-sender".into())
                .spawn(move || sender_worker(&shared, &shutdown))?
        };

        tracing::info!(%dest, "sender runtime started");
        Ok(SenderRuntime {
            handle: SenderHandle { shared },
            shutdown,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> SenderHandle {
        self.handle.clone()
    }

    pub fn submit(&self, packet: Packet) -> SubmitOutcome {
        self.handle.submit(packet)
    }

    pub fn handle_feedback(&self, bytes: Bytes) -> Result<PacketType, MalformedPacket> {
        self.handle.handle_feedback(bytes)
    }

    pub fn stats(&self) -> RuntimeStats {
        self.handle.stats()
    }

    /// Stop the worker after it drains the queue. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("sender worker panicked");
            }
            tracing::info!("sender runtime stopped");
        }
    }
}

impl Drop for SenderRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sender_worker(shared: &SenderShared, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        let wait = shared.congestion.time_until_send_slot();
        if !wait.is_zero() {
            thread::sleep(wait.clamp(MIN_IDLE_SLEEP, MAX_IDLE_SLEEP));
            continue;
        }

        match shared.scheduler.dequeue() {
            DequeueOutcome::Sent(packet) => {
                shared.congestion.try_acquire_send_slot();
                shared.transmit(packet);
            }
            DequeueOutcome::Empty | DequeueOutcome::Deferred => {
                thread::sleep(shared.idle_sleep());
            }
        }
    }

    let remaining = shared.scheduler.drain();
    if !remaining.is_empty() {
        tracing::debug!(count = remaining.len(), "draining sender queue");
    }
    for packet in remaining {
        shared.transmit(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stats::MetricsCollector;
    use crate::transport::LoopbackTransport;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:5001".parse().unwrap(),
        )
    }

    #[test]
    fn factory_stamps_sequence_and_deadline() {
        let (clock, time) = ManualClock::shared(42);
        let factory = PacketFactory::new(clock, DeadlineTable::default());
        let a = factory.make(Priority::High, Bytes::new());
        time.advance(8);
        let b = factory.make_flagged(Priority::Low, PacketFlags::RELIABLE, Bytes::new());

        assert_eq!(a.header.sequence, 0);
        assert_eq!(a.header.timestamp, 42);
        assert_eq!(a.header.deadline, 1_500);
        assert_eq!(b.header.sequence, 1);
        assert_eq!(b.header.timestamp, 50);
        assert_eq!(b.header.deadline, 6_000);
        assert!(b.header.flags.contains(PacketFlags::RELIABLE));
    }

    #[test]
    fn admission_refusal_is_counted_and_reported() {
        let (a, b) = addrs();
        let (left, _right) = LoopbackTransport::pair(a, b);
        let (clock, _) = ManualClock::shared(0);
        let metrics = Arc::new(MetricsCollector::new());
        let mut rt = SenderRuntime::spawn(
            &DtpConfig::default(),
            clock.clone(),
            Arc::new(left),
            b,
            metrics.clone(),
        )
        .unwrap();

        let factory = PacketFactory::new(clock, DeadlineTable::default());
        let outcomes: Vec<SubmitOutcome> = (0..21)
            .map(|_| rt.submit(factory.make(Priority::Critical, Bytes::new())))
            .collect();
        assert_eq!(outcomes[20], SubmitOutcome::Refused);
        rt.shutdown();

        let stats = rt.stats();
        assert_eq!(stats.sender.submitted, 21);
        assert_eq!(stats.sender.admission_refused, 1);
        assert_eq!(stats.admission.get(Priority::Critical).rejected, 1);
        let critical = metrics.priority(Priority::Critical);
        assert_eq!(critical.sent, 21);
        assert_eq!(critical.drops_by_reason.get("admission_refused"), Some(&1));
    }

    #[test]
    fn feedback_drives_congestion_controller() {
        let (a, b) = addrs();
        let (left, _right) = LoopbackTransport::pair(a, b);
        let (clock, _) = ManualClock::shared(0);
        let rt = SenderRuntime::spawn(
            &DtpConfig::default(),
            clock,
            Arc::new(left),
            b,
            Arc::new(MetricsCollector::new()),
        )
        .unwrap();
        let h = rt.handle();

        let ack = Packet::ack(1, Priority::High, 0).encode().unwrap();
        assert_eq!(h.handle_feedback(ack), Ok(PacketType::Ack));
        assert_eq!(h.congestion().rate(), 510.0);

        let nack = Packet::nack(2, Priority::High, 0).encode().unwrap();
        assert_eq!(h.handle_feedback(nack), Ok(PacketType::Nack));
        assert_eq!(h.congestion().rate(), 255.0);

        let notice = Packet::congestion(0.8, 0).encode().unwrap();
        h.handle_feedback(notice).unwrap();
        assert!(h.congestion().is_congested());

        assert!(h.handle_feedback(Bytes::from_static(b"junk")).is_err());
        let stats = h.stats().sender;
        assert_eq!(stats.acks, 1);
        assert_eq!(stats.nacks, 1);
        assert_eq!(stats.congestion_notices, 1);
        assert_eq!(stats.malformed_feedback, 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (a, b) = addrs();
        let (left, _right) = LoopbackTransport::pair(a, b);
        let (clock, _) = ManualClock::shared(0);
        let mut rt = SenderRuntime::spawn(
            &DtpConfig::default(),
            clock,
            Arc::new(left),
            b,
            Arc::new(MetricsCollector::new()),
        )
        .unwrap();
        rt.shutdown();
        rt.shutdown();
    }
}
