#![no_main]

use dtp_transport::clock::ManualClock;
use dtp_transport::clock_sync::{ClockSyncPacket, ClockSyncResponder, HandshakeAttempt};
use libfuzzer_sys::fuzz_target;

/// Fuzz the clock-sync datagram decoder and both handshake roles.
///
/// Arbitrary bytes go to the responder and, when they decode, are fed to a
/// pending client attempt as its response. Timestamp arithmetic on extreme
/// values must never panic.
fuzz_target!(|data: &[u8]| {
    let (clock, _) = ManualClock::shared(1_000);
    let responder = ClockSyncResponder::new(clock);
    let _ = responder.handle_datagram(data);

    if let Ok(pkt) = ClockSyncPacket::decode(data) {
        let mut attempt = HandshakeAttempt::new(1_000);
        let req = attempt.make_request(pkt.t1);
        let _ = attempt.on_response(&pkt, pkt.t3);
        let _ = attempt.check_timeout(req.t1);
    }
});
