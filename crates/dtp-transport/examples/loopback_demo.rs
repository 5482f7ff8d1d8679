//! Mixed-priority traffic over a lossy in-process link.
//!
//! ```text
//! RUST_LOG=debug cargo run --example loopback_demo -- [config.toml]
//! ```
//!
//! Runs a clock sync, then streams four priority classes through the sender
//! runtime for two seconds while a receiver thread ACKs reliable packets and
//! reports congestion. Prints per-priority delivery metrics as JSON.

use anyhow::Context;
use bytes::Bytes;
use dtp_transport::clock::MonotonicClock;
use dtp_transport::clock_sync::{ClockSyncClient, ClockSyncPacket, ClockSyncResponder, SyncChannel};
use dtp_transport::config::DtpConfig;
use dtp_transport::receiver::{PacketReceiver, ReceiveOutcome};
use dtp_transport::sender::{PacketFactory, SenderRuntime};
use dtp_transport::stats::MetricsCollector;
use dtp_transport::transport::{LoopbackTransport, Transport};
use dtp_transport::wire::{PacketFlags, Priority};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const RUN_FOR: Duration = Duration::from_secs(2);

struct LoopbackSync<'a>(&'a LoopbackTransport);

impl SyncChannel for LoopbackSync<'_> {
    fn send(&mut self, packet: &ClockSyncPacket) -> anyhow::Result<()> {
        self.0
            .send(Bytes::copy_from_slice(&packet.encode()), self.0.peer_addr())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> anyhow::Result<Option<ClockSyncPacket>> {
        match self.0.recv_timeout(timeout)? {
            Some(d) => Ok(Some(ClockSyncPacket::decode(&d.bytes)?)),
            None => Ok(None),
        }
    }
}

fn load_config() -> anyhow::Result<DtpConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            Ok(DtpConfig::from_toml_str(&text)?)
        }
        None => Ok(DtpConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let clock = MonotonicClock::shared();
    let sender_addr = "127.0.0.1:6000".parse()?;
    let receiver_addr = "127.0.0.1:6001".parse()?;

    // ─── Clock sync on a dedicated link ─────────────────────────────────
    let (sync_client, sync_server) = LoopbackTransport::pair(sender_addr, receiver_addr);
    let responder = ClockSyncResponder::new(clock.clone());
    let client = ClockSyncClient::new(config.clock_sync.clone(), clock.clone())?;
    let stop = AtomicBool::new(false);
    let calibration = thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                let Ok(Some(d)) = sync_server.recv_timeout(Duration::from_millis(10)) else {
                    continue;
                };
                if let Ok(Some(reply)) = responder.handle_datagram(&d.bytes) {
                    let _ = sync_server.send(Bytes::copy_from_slice(&reply.encode()), d.source);
                }
            }
        });
        let result = client.sync(&mut LoopbackSync(&sync_client));
        stop.store(true, Ordering::Release);
        result
    })?;

    // ─── Data path: every 7th datagram is lost ──────────────────────────
    let (tx_end, rx_end) = LoopbackTransport::pair(sender_addr, receiver_addr);
    let tx_end = Arc::new(tx_end.with_drop_every(7));
    let sender_metrics = Arc::new(MetricsCollector::new());
    let receiver_metrics = Arc::new(MetricsCollector::new());

    let mut runtime = SenderRuntime::spawn(
        &config,
        clock.clone(),
        tx_end.clone(),
        receiver_addr,
        sender_metrics.clone(),
    )?;
    let receiver = PacketReceiver::new(clock.clone(), receiver_metrics.clone());
    receiver.set_calibration(calibration);

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        // Receiver: deliver, ACK, and report load from the backlog depth.
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                let Ok(Some(d)) = rx_end.recv_timeout(Duration::from_millis(5)) else {
                    continue;
                };
                if let ReceiveOutcome::Delivered { ack: Some(ack), .. } =
                    receiver.on_receive(d.bytes, d.source)
                {
                    let _ = rx_end.send(ack, d.source);
                }
                let backlog = rx_end.pending() as f32;
                if let Some(notice) = receiver.report_congestion_level(backlog / 64.0) {
                    let _ = rx_end.send(notice, d.source);
                }
            }
        });

        // Feedback: ACK / CONGESTION back into the sender.
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                if let Ok(Some(d)) = tx_end.recv_timeout(Duration::from_millis(5)) {
                    let _ = runtime.handle_feedback(d.bytes);
                }
            }
        });

        let factory = PacketFactory::new(clock.clone(), config.deadlines);
        let start = Instant::now();
        let mut tick = 0u64;
        while start.elapsed() < RUN_FOR {
            let payload = Bytes::from(vec![0u8; 200]);
            runtime.submit(factory.make(Priority::Low, payload.clone()));
            if tick % 2 == 0 {
                runtime.submit(factory.make(Priority::Medium, payload.clone()));
            }
            if tick % 5 == 0 {
                runtime.submit(factory.make_flagged(Priority::High, PacketFlags::RELIABLE, payload.clone()));
            }
            if tick % 20 == 0 {
                runtime.submit(factory.make_flagged(Priority::Critical, PacketFlags::RELIABLE, payload));
            }
            tick += 1;
            thread::sleep(Duration::from_millis(1));
        }
        // Let the tail drain before stopping the helpers.
        thread::sleep(Duration::from_millis(100));
        done.store(true, Ordering::Release);
    });

    runtime.shutdown();

    let runtime_stats = runtime.stats();
    tracing::info!(
        sent = runtime_stats.sender.sent,
        acks = runtime_stats.sender.acks,
        refused = runtime_stats.sender.admission_refused,
        rate = runtime_stats.congestion.rate,
        lost = tx_end.datagrams_dropped(),
        "run complete"
    );
    println!("{}", serde_json::to_string_pretty(&runtime_stats)?);
    println!("{}", serde_json::to_string_pretty(&receiver_metrics.snapshot())?);
    Ok(())
}
