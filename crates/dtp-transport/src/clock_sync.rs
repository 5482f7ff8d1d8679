//! # Clock Synchronization
//!
//! Three-way timestamp exchange estimating the clock offset and round-trip
//! time between two hosts, so one-way latencies measured across machines mean
//! something.
//!
//! ```text
//!   local                         remote
//!     │ t1 ──── REQUEST ────────▶ │ t2 (receipt)
//!     │                           │ t3 (reply)
//!     │ t4 ◀─── RESPONSE ──────── │
//!     │ ─────── ACK ────────────▶ │
//!
//!   offset = ((t2 − t1) + (t3 − t4)) / 2
//!   rtt    = (t4 − t1) − (t3 − t2)
//! ```
//!
//! Each exchange is a [`HandshakeAttempt`]:
//!
//! ```text
//!   Idle ──request──▶ RequestSent ──response──▶ ResponseReceived ──▶ Computed
//!                          │
//!                   timeout / mismatch ──▶ Failed
//! ```
//!
//! A [`ClockSyncSession`] aggregates successful attempts: the lower-RTT half
//! is kept and the median offset and median RTT of that half are reported.

use bytes::{Buf, BufMut};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::clock::SharedClock;
use crate::config::{ensure_positive, ensure_range, ConfigError};

/// Encoded size of a sync packet: type + three i64 timestamps.
pub const SYNC_PACKET_SIZE: usize = 25;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockSyncError {
    #[error("clock sync needs {needed} samples, only {got} succeeded")]
    TooFewSamples { got: usize, needed: usize },
    #[error("sync packet too short: {len} < {SYNC_PACKET_SIZE} bytes")]
    Truncated { len: usize },
    #[error("unknown sync packet type {0:#04x}")]
    UnknownKind(u8),
}

// ─── Wire ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncKind {
    Request = 0x01,
    Response = 0x02,
    Ack = 0x03,
}

impl SyncKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(SyncKind::Request),
            0x02 => Some(SyncKind::Response),
            0x03 => Some(SyncKind::Ack),
            _ => None,
        }
    }
}

/// `type(u8) t1(i64) t2(i64) t3(i64)`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncPacket {
    pub kind: SyncKind,
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
}

impl ClockSyncPacket {
    pub fn request(t1: i64) -> Self {
        ClockSyncPacket {
            kind: SyncKind::Request,
            t1,
            t2: 0,
            t3: 0,
        }
    }

    pub fn encode(&self) -> [u8; SYNC_PACKET_SIZE] {
        let mut out = [0u8; SYNC_PACKET_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.kind as u8);
        buf.put_i64(self.t1);
        buf.put_i64(self.t2);
        buf.put_i64(self.t3);
        out
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ClockSyncError> {
        if data.len() < SYNC_PACKET_SIZE {
            return Err(ClockSyncError::Truncated { len: data.len() });
        }
        let kind_byte = data.get_u8();
        let kind = SyncKind::from_byte(kind_byte).ok_or(ClockSyncError::UnknownKind(kind_byte))?;
        Ok(ClockSyncPacket {
            kind,
            t1: data.get_i64(),
            t2: data.get_i64(),
            t3: data.get_i64(),
        })
    }
}

// ─── Sample ─────────────────────────────────────────────────────────────────

/// Offset and RTT from one completed exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    pub offset_ms: f64,
    pub rtt_ms: f64,
}

impl SyncSample {
    /// Timestamps come off the wire, so the arithmetic saturates.
    pub fn compute(t1: i64, t2: i64, t3: i64, t4: i64) -> Self {
        let forward = t2.saturating_sub(t1);
        let backward = t3.saturating_sub(t4);
        SyncSample {
            offset_ms: forward.saturating_add(backward) as f64 / 2.0,
            rtt_ms: t4.saturating_sub(t1).saturating_sub(t3.saturating_sub(t2)) as f64,
        }
    }
}

// ─── Handshake Attempt ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    RequestSent,
    ResponseReceived,
    Computed,
    Failed,
}

/// One request/response exchange.
#[derive(Debug, Clone)]
pub struct HandshakeAttempt {
    state: HandshakeState,
    t1: i64,
    timeout_ms: u64,
    sample: Option<SyncSample>,
}

impl HandshakeAttempt {
    pub fn new(timeout_ms: u64) -> Self {
        HandshakeAttempt {
            state: HandshakeState::Idle,
            t1: 0,
            timeout_ms,
            sample: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn sample(&self) -> Option<SyncSample> {
        self.sample
    }

    /// Stamp `t1` and move to `RequestSent`.
    pub fn make_request(&mut self, now_ms: i64) -> ClockSyncPacket {
        self.t1 = now_ms;
        self.state = HandshakeState::RequestSent;
        ClockSyncPacket::request(now_ms)
    }

    /// Whether `packet` is the response to this attempt's request.
    pub fn answers(&self, packet: &ClockSyncPacket) -> bool {
        packet.kind == SyncKind::Response && packet.t1 == self.t1
    }

    /// Accept a response stamped locally at `t4`. Anything other than a
    /// response echoing our `t1` fails the attempt.
    pub fn on_response(&mut self, packet: &ClockSyncPacket, t4: i64) -> Option<SyncSample> {
        if self.state != HandshakeState::RequestSent {
            return None;
        }
        if packet.kind != SyncKind::Response || packet.t1 != self.t1 {
            self.state = HandshakeState::Failed;
            return None;
        }
        self.state = HandshakeState::ResponseReceived;
        let sample = SyncSample::compute(self.t1, packet.t2, packet.t3, t4);
        self.sample = Some(sample);
        self.state = HandshakeState::Computed;
        Some(sample)
    }

    /// Fail the attempt if it has waited `timeout_ms` or longer.
    pub fn check_timeout(&mut self, now_ms: i64) -> bool {
        if self.state == HandshakeState::RequestSent
            && now_ms.saturating_sub(self.t1) >= self.timeout_ms as i64
        {
            self.state = HandshakeState::Failed;
        }
        self.state == HandshakeState::Failed
    }

    /// Mark an outstanding request as failed (no reply within the timeout).
    pub fn expire(&mut self) {
        if self.state == HandshakeState::RequestSent {
            self.state = HandshakeState::Failed;
        }
    }

    /// Ack packet confirming a computed exchange.
    pub fn make_ack(&self, response: &ClockSyncPacket) -> ClockSyncPacket {
        ClockSyncPacket {
            kind: SyncKind::Ack,
            ..*response
        }
    }
}

// ─── Result ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockSyncResult {
    pub offset_ms: f64,
    pub rtt_ms: f64,
    /// Half the RTT: the worst-case error of the offset estimate.
    pub accuracy_ms: f64,
    /// Successful exchanges the result was built from.
    pub samples: usize,
}

impl ClockSyncResult {
    /// Map a peer timestamp onto the local timeline.
    pub fn adjust_timestamp(&self, remote_ms: i64) -> i64 {
        (remote_ms as f64 + self.offset_ms) as i64
    }

    /// Correct a cross-host latency measurement.
    pub fn adjust_latency(&self, latency_ms: i64) -> i64 {
        (latency_ms as f64 - self.offset_ms) as i64
    }
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSyncConfig {
    /// Exchanges attempted per sync.
    pub num_samples: usize,
    /// Minimum successful exchanges for a result.
    pub min_samples: usize,
    /// Per-exchange reply timeout.
    pub timeout_ms: u64,
    /// Pause between exchanges.
    pub interval_ms: u64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        ClockSyncConfig {
            num_samples: 5,
            min_samples: 1,
            timeout_ms: 1_000,
            interval_ms: 10,
        }
    }
}

impl ClockSyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("num_samples", self.num_samples as f64)?;
        ensure_positive("min_samples", self.min_samples as f64)?;
        ensure_range(
            "min_samples",
            self.min_samples as f64,
            1.0,
            self.num_samples as f64,
        )?;
        ensure_positive("clock sync timeout_ms", self.timeout_ms as f64)
    }
}

/// Collects samples across attempts and produces the aggregate result.
#[derive(Debug, Clone, Default)]
pub struct ClockSyncSession {
    samples: Vec<SyncSample>,
    failed: usize,
}

impl ClockSyncSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a finished attempt in; failed attempts are only counted.
    pub fn record(&mut self, attempt: &HandshakeAttempt) {
        match attempt.sample() {
            Some(sample) if attempt.state() == HandshakeState::Computed => {
                self.samples.push(sample)
            }
            _ => self.failed += 1,
        }
    }

    pub fn push_sample(&mut self, sample: SyncSample) {
        self.samples.push(sample);
    }

    pub fn successes(&self) -> usize {
        self.samples.len()
    }

    pub fn failures(&self) -> usize {
        self.failed
    }

    /// Median offset and RTT over the lower-RTT half of the samples
    /// (rounded up, at least one).
    pub fn finish(&self, min_samples: usize) -> Result<ClockSyncResult, ClockSyncError> {
        let n = self.samples.len();
        if n == 0 || n < min_samples {
            return Err(ClockSyncError::TooFewSamples {
                got: n,
                needed: min_samples.max(1),
            });
        }

        let mut by_rtt = self.samples.clone();
        by_rtt.sort_by(|a, b| a.rtt_ms.total_cmp(&b.rtt_ms));
        by_rtt.truncate(n.div_ceil(2));

        let mut offsets: Vec<f64> = by_rtt.iter().map(|s| s.offset_ms).collect();
        offsets.sort_by(f64::total_cmp);
        let rtts: Vec<f64> = by_rtt.iter().map(|s| s.rtt_ms).collect();

        let rtt_ms = median(&rtts);
        Ok(ClockSyncResult {
            offset_ms: median(&offsets),
            rtt_ms,
            accuracy_ms: rtt_ms / 2.0,
            samples: n,
        })
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

/// Datagram path used by [`ClockSyncClient`].
pub trait SyncChannel {
    fn send(&mut self, packet: &ClockSyncPacket) -> anyhow::Result<()>;

    /// Wait up to `timeout` for a packet; `Ok(None)` on timeout.
    fn recv_timeout(&mut self, timeout: Duration) -> anyhow::Result<Option<ClockSyncPacket>>;
}

/// Drives a full sync: `num_samples` exchanges, then aggregation.
pub struct ClockSyncClient {
    config: ClockSyncConfig,
    clock: SharedClock,
}

impl ClockSyncClient {
    pub fn new(config: ClockSyncConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ClockSyncClient { config, clock })
    }

    pub fn sync(&self, channel: &mut impl SyncChannel) -> Result<ClockSyncResult, ClockSyncError> {
        let mut session = ClockSyncSession::new();
        let timeout = Duration::from_millis(self.config.timeout_ms);

        for round in 0..self.config.num_samples {
            if round > 0 && self.config.interval_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.interval_ms));
            }

            let mut attempt = HandshakeAttempt::new(self.config.timeout_ms);
            let request = attempt.make_request(self.now());
            if let Err(e) = channel.send(&request) {
                tracing::debug!(round, error = %e, "clock sync request failed");
                attempt.expire();
                session.record(&attempt);
                continue;
            }

            if let Some(response) = self.await_response(channel, &mut attempt, round, timeout) {
                let t4 = self.now();
                if !attempt.check_timeout(t4) && attempt.on_response(&response, t4).is_some() {
                    if let Err(e) = channel.send(&attempt.make_ack(&response)) {
                        tracing::debug!(round, error = %e, "clock sync ack failed");
                    }
                }
            }
            session.record(&attempt);
        }

        let result = session.finish(self.config.min_samples)?;
        tracing::info!(
            offset_ms = result.offset_ms,
            rtt_ms = result.rtt_ms,
            samples = result.samples,
            failed = session.failures(),
            "clock sync complete"
        );
        Ok(result)
    }

    /// Wait out the timeout window for the reply to `attempt`. Late replies
    /// to earlier rounds are discarded. Expires the attempt on timeout.
    fn await_response(
        &self,
        channel: &mut impl SyncChannel,
        attempt: &mut HandshakeAttempt,
        round: usize,
        timeout: Duration,
    ) -> Option<ClockSyncPacket> {
        let started = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            match channel.recv_timeout(remaining) {
                Ok(Some(response)) if attempt.answers(&response) => return Some(response),
                Ok(Some(stale)) => {
                    tracing::debug!(
                        round,
                        t1 = stale.t1,
                        kind = ?stale.kind,
                        "discarding stale clock sync reply"
                    );
                    if remaining.is_zero() {
                        attempt.expire();
                        return None;
                    }
                }
                Ok(None) => {
                    attempt.expire();
                    return None;
                }
                Err(e) => {
                    tracing::debug!(round, error = %e, "clock sync receive failed");
                    attempt.expire();
                    return None;
                }
            }
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_ms() as i64
    }
}

// ─── Responder ──────────────────────────────────────────────────────────────

/// Remote side: answers requests with receipt and reply timestamps.
pub struct ClockSyncResponder {
    clock: SharedClock,
    handled: AtomicU64,
    acks: AtomicU64,
}

impl ClockSyncResponder {
    pub fn new(clock: SharedClock) -> Self {
        ClockSyncResponder {
            clock,
            handled: AtomicU64::new(0),
            acks: AtomicU64::new(0),
        }
    }

    /// Handle one raw datagram; returns the response for requests.
    pub fn handle_datagram(&self, data: &[u8]) -> Result<Option<ClockSyncPacket>, ClockSyncError> {
        let t2 = self.clock.now_ms() as i64;
        let packet = ClockSyncPacket::decode(data)?;
        Ok(self.respond(&packet, t2))
    }

    /// Answer a decoded packet received at local time `t2`.
    pub fn respond(&self, packet: &ClockSyncPacket, t2: i64) -> Option<ClockSyncPacket> {
        match packet.kind {
            SyncKind::Request => {
                let t3 = self.clock.now_ms() as i64;
                self.handled.fetch_add(1, Ordering::Relaxed);
                Some(ClockSyncPacket {
                    kind: SyncKind::Response,
                    t1: packet.t1,
                    t2,
                    t3,
                })
            }
            SyncKind::Ack => {
                self.acks.fetch_add(1, Ordering::Relaxed);
                None
            }
            SyncKind::Response => None,
        }
    }

    pub fn requests_handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn acks_received(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }
}
