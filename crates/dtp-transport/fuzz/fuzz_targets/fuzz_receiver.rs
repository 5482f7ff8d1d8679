#![no_main]

use bytes::Bytes;
use dtp_transport::clock::ManualClock;
use dtp_transport::receiver::PacketReceiver;
use dtp_transport::stats::MetricsCollector;
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

/// Fuzz the receive path with a stream of arbitrary datagrams.
///
/// Input is split on a 2-byte little-endian length prefix; each chunk is
/// delivered at an advancing local time. Decode, expiry checks, latency
/// accounting and ACK generation must never panic.
fuzz_target!(|data: &[u8]| {
    let (clock, time) = ManualClock::shared(0);
    let rx = PacketReceiver::new(clock, Arc::new(MetricsCollector::new()));
    let source = "127.0.0.1:9".parse().unwrap();

    let mut rest = data;
    while rest.len() >= 2 {
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        let take = len.min(rest.len());
        let (chunk, tail) = rest.split_at(take);
        rest = tail;

        time.advance(len as u64);
        let _ = rx.on_receive(Bytes::copy_from_slice(chunk), source);
        let _ = rx.report_congestion_level(chunk.first().map_or(0.0, |b| *b as f32 / 255.0));
    }
    let _ = rx.stats();
});
