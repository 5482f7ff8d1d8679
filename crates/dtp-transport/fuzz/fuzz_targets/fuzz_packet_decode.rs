#![no_main]

use bytes::Bytes;
use dtp_transport::wire::{Packet, PacketHeader};
use libfuzzer_sys::fuzz_target;

/// Fuzz the packet decode pipeline.
///
/// Exercises `PacketHeader::decode` (priority / type validation) and
/// `Packet::decode`, and re-encodes whatever decodes. Must never panic.
fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    let _ = PacketHeader::decode(&mut buf);

    if let Ok(pkt) = Packet::decode(Bytes::copy_from_slice(data)) {
        let _ = pkt.header.is_expired(u64::MAX);
        let _ = pkt.header.time_remaining(0);
        let _ = pkt.congestion_level();
        // Decoded timestamps and deadlines are 32-bit, so re-encoding succeeds.
        if let Ok(bytes) = pkt.encode() {
            assert_eq!(&bytes[..], data);
        }
    }
});
