//! # DTP Wire Format
//!
//! Fixed 16-byte header, network byte order, followed by an opaque payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |   Priority    |        Sequence (16)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Timestamp (32-bit, ms)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Deadline (32-bit, ms)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |  Packet Type  |        Batch ID (16)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `timestamp` is the creation instant relative to the run's clock reference
//! and is never rewritten after creation. `deadline` is a duration; the
//! instant a packet expires is `timestamp + deadline`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 16;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// A header field does not fit its wire representation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("priority {0} is outside 0..=3")]
    InvalidPriority(u8),
    #[error("packet type {0} is not defined")]
    InvalidPacketType(u8),
    #[error("timestamp {0} ms does not fit in 32 bits")]
    TimestampOverflow(u64),
    #[error("deadline {0} ms does not fit in 32 bits")]
    DeadlineOverflow(u64),
}

/// Bytes received from the wire could not be parsed as a DTP packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPacket {
    #[error("datagram too short: {len} < {HEADER_SIZE} bytes")]
    Truncated { len: usize },
    #[error("invalid priority byte {0}")]
    InvalidPriority(u8),
    #[error("invalid packet type byte {0}")]
    InvalidPacketType(u8),
}

// ─── Priority ────────────────────────────────────────────────────────────────

/// Urgency class of a packet. Rank 0 is the most urgent.
///
/// Ordering is defined by [`Priority::rank`]: `Critical < High < Medium < Low`,
/// so "smaller" always means "dequeue first".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Safety-critical traffic. Never expires inside the scheduler.
    Critical,
    /// Near-critical traffic with a 2× deadline grace window.
    High,
    Medium,
    /// Bulk traffic. Batched, and held back while the link is congested.
    Low,
}

impl Priority {
    /// All classes from most to least urgent.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Wire value and ordering rank.
    pub const fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    /// Stable index for per-priority arrays.
    pub const fn index(self) -> usize {
        self.rank() as usize
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Medium),
            3 => Some(Priority::Low),
            _ => None,
        }
    }

    /// One of the two most urgent classes.
    pub const fn is_urgent(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }

    /// The least urgent class (the only one that is batched).
    pub const fn is_lowest(self) -> bool {
        matches!(self, Priority::Low)
    }

    /// Default deadline budget in milliseconds.
    pub const fn default_deadline_ms(self) -> u64 {
        match self {
            Priority::Critical => 500,
            Priority::High => 1_500,
            Priority::Medium => 3_000,
            Priority::Low => 6_000,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Packet Type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Ack = 1,
    Nack = 2,
    /// Receiver-issued congestion notice; payload is a big-endian `f32` level.
    Congestion = 3,
    Keepalive = 4,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Ack),
            2 => Some(PacketType::Nack),
            3 => Some(PacketType::Congestion),
            4 => Some(PacketType::Keepalive),
            _ => None,
        }
    }
}

// ─── Flags ───────────────────────────────────────────────────────────────────

/// Header flag bitset. Unknown bits survive a decode/encode round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0x00);
    /// Receiver answers with an ACK.
    pub const RELIABLE: PacketFlags = PacketFlags(0x01);
    pub const DROPPABLE: PacketFlags = PacketFlags(0x02);
    /// Released from a batch buffer; `batch_id` is meaningful.
    pub const BATCHED: PacketFlags = PacketFlags(0x04);
    pub const COMPRESSED: PacketFlags = PacketFlags(0x08);
    pub const ENCRYPTED: PacketFlags = PacketFlags(0x10);
    /// Bypass batching and the congestion gate.
    pub const EXPEDITED: PacketFlags = PacketFlags(0x20);

    pub const fn from_bits(bits: u8) -> Self {
        PacketFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 | rhs.0)
    }
}

// ─── Packet Header ──────────────────────────────────────────────────────────

/// Decoded DTP header.
///
/// `timestamp` and `deadline` are held as `u64` so deadline arithmetic never
/// overflows in memory; [`PacketHeader::encode`] rejects values that do not
/// fit the 32-bit wire fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub priority: Priority,
    /// Wrapping 16-bit sequence number.
    pub sequence: u16,
    /// Creation time, ms since the clock reference.
    pub timestamp: u64,
    /// Deadline budget in ms (a duration, not an instant).
    pub deadline: u64,
    pub flags: PacketFlags,
    pub packet_type: PacketType,
    pub batch_id: u16,
}

impl PacketHeader {
    /// Build a header from untyped field values, validating enumerations.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw(
        version: u8,
        priority: u8,
        sequence: u16,
        timestamp: u64,
        deadline: u64,
        flags: u8,
        packet_type: u8,
        batch_id: u16,
    ) -> Result<Self, EncodingError> {
        let priority = Priority::from_rank(priority).ok_or(EncodingError::InvalidPriority(priority))?;
        let packet_type =
            PacketType::from_byte(packet_type).ok_or(EncodingError::InvalidPacketType(packet_type))?;
        Ok(PacketHeader {
            version,
            priority,
            sequence,
            timestamp,
            deadline,
            flags: PacketFlags::from_bits(flags),
            packet_type,
            batch_id,
        })
    }

    /// Create a data packet header.
    pub fn data(priority: Priority, sequence: u16, timestamp: u64, deadline: u64) -> Self {
        PacketHeader {
            version: PROTOCOL_VERSION,
            priority,
            sequence,
            timestamp,
            deadline,
            flags: PacketFlags::NONE,
            packet_type: PacketType::Data,
            batch_id: 0,
        }
    }

    /// Encode the header into a fixed 16-byte array.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], EncodingError> {
        let mut out = [0u8; HEADER_SIZE];
        let mut cursor = &mut out[..];
        self.put(&mut cursor)?;
        Ok(out)
    }

    /// Append the encoded header to a buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), EncodingError> {
        buf.reserve(HEADER_SIZE);
        self.put(buf)
    }

    fn put(&self, buf: &mut impl BufMut) -> Result<(), EncodingError> {
        let timestamp = u32::try_from(self.timestamp)
            .map_err(|_| EncodingError::TimestampOverflow(self.timestamp))?;
        let deadline = u32::try_from(self.deadline)
            .map_err(|_| EncodingError::DeadlineOverflow(self.deadline))?;

        buf.put_u8(self.version);
        buf.put_u8(self.priority.rank());
        buf.put_u16(self.sequence);
        buf.put_u32(timestamp);
        buf.put_u32(deadline);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.batch_id);
        Ok(())
    }

    /// Decode a header, consuming exactly [`HEADER_SIZE`] bytes on success.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, MalformedPacket> {
        if buf.remaining() < HEADER_SIZE {
            return Err(MalformedPacket::Truncated {
                len: buf.remaining(),
            });
        }

        let version = buf.get_u8();
        let priority_byte = buf.get_u8();
        let sequence = buf.get_u16();
        let timestamp = buf.get_u32() as u64;
        let deadline = buf.get_u32() as u64;
        let flags = PacketFlags::from_bits(buf.get_u8());
        let type_byte = buf.get_u8();
        let batch_id = buf.get_u16();

        let priority =
            Priority::from_rank(priority_byte).ok_or(MalformedPacket::InvalidPriority(priority_byte))?;
        let packet_type =
            PacketType::from_byte(type_byte).ok_or(MalformedPacket::InvalidPacketType(type_byte))?;

        Ok(PacketHeader {
            version,
            priority,
            sequence,
            timestamp,
            deadline,
            flags,
            packet_type,
            batch_id,
        })
    }

    // ─── Deadline arithmetic ────────────────────────────────────────────

    /// Instant (ms since reference) at which this packet expires.
    pub fn absolute_deadline(&self) -> u64 {
        self.timestamp.saturating_add(self.deadline)
    }

    /// `now > timestamp + deadline`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.absolute_deadline()
    }

    /// Milliseconds left until expiry; negative once overdue.
    pub fn time_remaining(&self, now_ms: u64) -> i64 {
        self.absolute_deadline() as i64 - now_ms as i64
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags.insert(flags);
        self
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A complete DTP packet: header + opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Create a data packet stamped at `timestamp`.
    pub fn data(
        priority: Priority,
        sequence: u16,
        timestamp: u64,
        deadline: u64,
        payload: Bytes,
    ) -> Self {
        Packet {
            header: PacketHeader::data(priority, sequence, timestamp, deadline),
            payload,
        }
    }

    /// Acknowledgment for a `RELIABLE` packet, echoing its sequence and priority.
    pub fn ack(sequence: u16, priority: Priority, timestamp: u64) -> Self {
        Self::control(PacketType::Ack, priority, sequence, timestamp, Bytes::new())
    }

    /// Loss report for `sequence`.
    pub fn nack(sequence: u16, priority: Priority, timestamp: u64) -> Self {
        Self::control(PacketType::Nack, priority, sequence, timestamp, Bytes::new())
    }

    /// Congestion notice carrying a load level in `[0, 1]`.
    pub fn congestion(level: f32, timestamp: u64) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_f32(level);
        Self::control(
            PacketType::Congestion,
            Priority::Critical,
            0,
            timestamp,
            payload.freeze(),
        )
    }

    pub fn keepalive(timestamp: u64) -> Self {
        Self::control(PacketType::Keepalive, Priority::Low, 0, timestamp, Bytes::new())
    }

    fn control(
        packet_type: PacketType,
        priority: Priority,
        sequence: u16,
        timestamp: u64,
        payload: Bytes,
    ) -> Self {
        let mut header = PacketHeader::data(priority, sequence, timestamp, 0);
        header.packet_type = packet_type;
        Packet { header, payload }
    }

    /// Congestion level, for `Congestion` packets with a well-formed payload.
    pub fn congestion_level(&self) -> Option<f32> {
        if self.header.packet_type != PacketType::Congestion || self.payload.len() < 4 {
            return None;
        }
        let mut buf = &self.payload[..];
        Some(buf.get_f32())
    }

    pub fn priority(&self) -> Priority {
        self.header.priority
    }

    pub fn is_expedited(&self) -> bool {
        self.header.flags.contains(PacketFlags::EXPEDITED)
    }

    pub fn is_batched(&self) -> bool {
        self.header.flags.contains(PacketFlags::BATCHED)
    }

    /// Serialize header + payload.
    pub fn encode(&self) -> Result<Bytes, EncodingError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode_into(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a datagram. Everything after the header is payload.
    pub fn decode(mut data: Bytes) -> Result<Self, MalformedPacket> {
        let header = PacketHeader::decode(&mut data)?;
        Ok(Packet {
            header,
            payload: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PacketHeader {
        PacketHeader {
            version: PROTOCOL_VERSION,
            priority: Priority::High,
            sequence: 0xBEEF,
            timestamp: 123_456,
            deadline: 1_500,
            flags: PacketFlags::RELIABLE | PacketFlags::EXPEDITED,
            packet_type: PacketType::Data,
            batch_id: 7,
        }
    }

    // ─── Header layout ──────────────────────────────────────────────────

    #[test]
    fn header_is_sixteen_bytes_big_endian() {
        let bytes = sample_header().encode().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], 1); // High
        assert_eq!(&bytes[2..4], &[0xBE, 0xEF]);
        assert_eq!(&bytes[4..8], &123_456u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &1_500u32.to_be_bytes());
        assert_eq!(bytes[12], 0x21);
        assert_eq!(bytes[13], PacketType::Data as u8);
        assert_eq!(&bytes[14..16], &[0, 7]);
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let bytes = header.encode().unwrap();
        let decoded = PacketHeader::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn unknown_flag_bits_survive_roundtrip() {
        let mut header = sample_header();
        header.flags = PacketFlags::from_bits(0xC0);
        let bytes = header.encode().unwrap();
        let decoded = PacketHeader::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded.flags.bits(), 0xC0);
    }

    // ─── Encoding errors ────────────────────────────────────────────────

    #[test]
    fn from_raw_rejects_priority_out_of_range() {
        let err = PacketHeader::from_raw(1, 4, 0, 0, 500, 0, 0, 0).unwrap_err();
        assert_eq!(err, EncodingError::InvalidPriority(4));
    }

    #[test]
    fn from_raw_rejects_unknown_type() {
        let err = PacketHeader::from_raw(1, 0, 0, 0, 500, 0, 9, 0).unwrap_err();
        assert_eq!(err, EncodingError::InvalidPacketType(9));
    }

    #[test]
    fn encode_rejects_timestamp_overflow() {
        let mut header = sample_header();
        header.timestamp = u32::MAX as u64 + 1;
        assert_eq!(
            header.encode().unwrap_err(),
            EncodingError::TimestampOverflow(u32::MAX as u64 + 1)
        );
    }

    #[test]
    fn encode_rejects_deadline_overflow() {
        let mut header = sample_header();
        header.deadline = u64::MAX;
        assert!(matches!(
            header.encode(),
            Err(EncodingError::DeadlineOverflow(_))
        ));
    }

    // ─── Decoding errors ────────────────────────────────────────────────

    #[test]
    fn decode_rejects_short_buffer() {
        let bytes = [0u8; HEADER_SIZE - 1];
        assert_eq!(
            PacketHeader::decode(&mut &bytes[..]).unwrap_err(),
            MalformedPacket::Truncated { len: 15 }
        );
    }

    #[test]
    fn decode_rejects_bad_priority() {
        let mut bytes = sample_header().encode().unwrap();
        bytes[1] = 7;
        assert_eq!(
            PacketHeader::decode(&mut &bytes[..]).unwrap_err(),
            MalformedPacket::InvalidPriority(7)
        );
    }

    #[test]
    fn decode_rejects_bad_type() {
        let mut bytes = sample_header().encode().unwrap();
        bytes[13] = 0xFF;
        assert_eq!(
            PacketHeader::decode(&mut &bytes[..]).unwrap_err(),
            MalformedPacket::InvalidPacketType(0xFF)
        );
    }

    // ─── Deadline arithmetic ────────────────────────────────────────────

    #[test]
    fn expiry_is_strictly_after_absolute_deadline() {
        let header = PacketHeader::data(Priority::Medium, 1, 1_000, 3_000);
        assert_eq!(header.absolute_deadline(), 4_000);
        assert!(!header.is_expired(4_000));
        assert!(header.is_expired(4_001));
    }

    #[test]
    fn time_remaining_goes_negative() {
        let header = PacketHeader::data(Priority::Low, 1, 100, 50);
        assert_eq!(header.time_remaining(120), 30);
        assert_eq!(header.time_remaining(150), 0);
        assert_eq!(header.time_remaining(200), -50);
    }

    // ─── Priority ───────────────────────────────────────────────────────

    #[test]
    fn priority_order_follows_rank() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        for p in Priority::ALL {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(Priority::from_rank(4), None);
    }

    #[test]
    fn default_deadlines() {
        assert_eq!(Priority::Critical.default_deadline_ms(), 500);
        assert_eq!(Priority::High.default_deadline_ms(), 1_500);
        assert_eq!(Priority::Medium.default_deadline_ms(), 3_000);
        assert_eq!(Priority::Low.default_deadline_ms(), 6_000);
    }

    // ─── Packet ─────────────────────────────────────────────────────────

    #[test]
    fn packet_roundtrip_with_payload() {
        let pkt = Packet::data(
            Priority::Medium,
            42,
            10,
            3_000,
            Bytes::from_static(b"telemetry"),
        );
        let decoded = Packet::decode(pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn congestion_packet_carries_level() {
        let pkt = Packet::congestion(0.75, 99);
        let decoded = Packet::decode(pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.packet_type, PacketType::Congestion);
        assert_eq!(decoded.congestion_level(), Some(0.75));
    }

    #[test]
    fn ack_echoes_sequence_and_priority() {
        let ack = Packet::ack(513, Priority::High, 7);
        assert_eq!(ack.header.packet_type, PacketType::Ack);
        assert_eq!(ack.header.sequence, 513);
        assert_eq!(ack.priority(), Priority::High);
        assert!(ack.payload.is_empty());
    }
}
