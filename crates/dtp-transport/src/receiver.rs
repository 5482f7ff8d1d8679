//! # Receive Path
//!
//! Pure logic, no sockets: the caller feeds datagrams from its transport into
//! [`PacketReceiver::on_receive`] and sends back whatever feedback it returns.
//!
//! 1. Decode. Malformed datagrams are logged at `debug`, counted and skipped.
//! 2. Measure one-way latency against the sender's creation timestamp,
//!    corrected by the current clock-sync calibration if one is installed.
//! 3. Drop packets that arrived past their deadline.
//! 4. Record delivery and, for `RELIABLE` packets, produce an ACK.

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::clock_sync::ClockSyncResult;
use crate::stats::{DropReason, MetricsSink};
use crate::wire::{MalformedPacket, Packet, PacketFlags, PacketType};

/// A congestion notice is issued when the level moves by more than this.
const NOTICE_LEVEL_STEP: f32 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    Delivered {
        packet: Packet,
        latency_ms: i64,
        /// Encoded ACK to return to the source, for `RELIABLE` packets.
        ack: Option<Bytes>,
    },
    ExpiredOnArrival {
        packet: Packet,
        latency_ms: i64,
    },
    /// ACK / NACK / CONGESTION / KEEPALIVE addressed to this endpoint.
    Control(Packet),
    Malformed(MalformedPacket),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub datagrams: u64,
    pub delivered: u64,
    pub expired_on_arrival: u64,
    pub malformed: u64,
    pub control: u64,
    pub acks_generated: u64,
    pub congestion_notices: u64,
}

#[derive(Default)]
struct ReceiverCounters {
    datagrams: AtomicU64,
    delivered: AtomicU64,
    expired_on_arrival: AtomicU64,
    malformed: AtomicU64,
    control: AtomicU64,
    acks_generated: AtomicU64,
    congestion_notices: AtomicU64,
}

pub struct PacketReceiver {
    clock: SharedClock,
    metrics: Arc<dyn MetricsSink>,
    calibration: ArcSwapOption<ClockSyncResult>,
    /// Last reported congestion level, as `f32` bits.
    reported_level: AtomicU32,
    counters: ReceiverCounters,
}

impl PacketReceiver {
    pub fn new(clock: SharedClock, metrics: Arc<dyn MetricsSink>) -> Self {
        PacketReceiver {
            clock,
            metrics,
            calibration: ArcSwapOption::empty(),
            reported_level: AtomicU32::new(0f32.to_bits()),
            counters: ReceiverCounters::default(),
        }
    }

    /// Install (or replace) the clock offset used for latency correction.
    pub fn set_calibration(&self, result: ClockSyncResult) {
        tracing::debug!(offset_ms = result.offset_ms, "receiver calibration updated");
        self.calibration.store(Some(Arc::new(result)));
    }

    pub fn clear_calibration(&self) {
        self.calibration.store(None);
    }

    pub fn calibration(&self) -> Option<ClockSyncResult> {
        self.calibration.load_full().map(|c| *c)
    }

    pub fn on_receive(&self, bytes: Bytes, source: SocketAddr) -> ReceiveOutcome {
        let now = self.clock.now_ms();
        self.counters.datagrams.fetch_add(1, Ordering::Relaxed);

        let packet = match Packet::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(%source, error = %e, "dropping malformed datagram");
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return ReceiveOutcome::Malformed(e);
            }
        };

        if packet.header.packet_type != PacketType::Data {
            self.counters.control.fetch_add(1, Ordering::Relaxed);
            return ReceiveOutcome::Control(packet);
        }

        let raw_latency = now as i64 - packet.header.timestamp as i64;
        let latency_ms = match self.calibration.load().as_deref() {
            Some(cal) => cal.adjust_latency(raw_latency),
            None => raw_latency,
        };

        if latency_ms > packet.header.deadline as i64 {
            tracing::trace!(
                priority = %packet.priority(),
                seq = packet.header.sequence,
                latency_ms,
                "expired on arrival"
            );
            self.counters.expired_on_arrival.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .record_dropped(&packet, DropReason::ExpiredOnArrival);
            return ReceiveOutcome::ExpiredOnArrival { packet, latency_ms };
        }

        self.metrics.record_received(&packet, latency_ms);
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);

        let ack = if packet.header.flags.contains(PacketFlags::RELIABLE) {
            self.make_ack(&packet, now)
        } else {
            None
        };

        ReceiveOutcome::Delivered {
            packet,
            latency_ms,
            ack,
        }
    }

    fn make_ack(&self, packet: &Packet, now: u64) -> Option<Bytes> {
        match Packet::ack(packet.header.sequence, packet.priority(), now).encode() {
            Ok(bytes) => {
                self.counters.acks_generated.fetch_add(1, Ordering::Relaxed);
                Some(bytes)
            }
            Err(e) => {
                tracing::warn!(seq = packet.header.sequence, error = %e, "ack encode failed");
                None
            }
        }
    }

    /// Update the local load level (`0.0..=1.0`). Returns an encoded
    /// CONGESTION notice when it moved by more than a step since the last one.
    pub fn report_congestion_level(&self, level: f32) -> Option<Bytes> {
        let level = level.clamp(0.0, 1.0);
        let last = f32::from_bits(self.reported_level.load(Ordering::Acquire));
        if (level - last).abs() <= NOTICE_LEVEL_STEP {
            return None;
        }
        self.reported_level.store(level.to_bits(), Ordering::Release);
        match Packet::congestion(level, self.clock.now_ms()).encode() {
            Ok(bytes) => {
                self.counters.congestion_notices.fetch_add(1, Ordering::Relaxed);
                Some(bytes)
            }
            Err(e) => {
                tracing::warn!(error = %e, "congestion notice encode failed");
                None
            }
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        let c = &self.counters;
        ReceiverStats {
            datagrams: c.datagrams.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            expired_on_arrival: c.expired_on_arrival.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            control: c.control.load(Ordering::Relaxed),
            acks_generated: c.acks_generated.load(Ordering::Relaxed),
            congestion_notices: c.congestion_notices.load(Ordering::Relaxed),
        }
    }
}
