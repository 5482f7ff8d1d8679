//! # dtp-transport
//!
//! Deadline-aware transport over an unreliable datagram service.
//!
//! Every packet carries a priority class and a deadline. The sender releases
//! the most urgent, closest-to-expiry packet first, sheds packets that can no
//! longer make their deadline, and paces the link with an AIMD rate
//! controller. A three-way clock-sync exchange makes cross-host latency
//! measurements meaningful.
//!
//! ## Crate structure
//!
//! - [`clock`] — Injectable monotonic millisecond clock
//! - [`wire`] — 16-byte header codec, packet types, expiry arithmetic
//! - [`scheduler`] — EDF-within-priority queue with batching and eviction
//! - [`admission`] — Per-priority token buckets
//! - [`congestion`] — AIMD rate control and pacing bucket
//! - [`clock_sync`] — Offset/RTT estimation handshake
//! - [`stats`] — Delivery metrics and the metrics sink seam
//! - [`config`] — TOML configuration
//! - [`transport`] — Datagram transport seam and in-process loopback
//! - [`sender`] — Sender runtime (admission → scheduler → pacing → transport)
//! - [`receiver`] — Receive path (decode, expiry, latency, ACK)

pub mod admission;
pub mod clock;
pub mod clock_sync;
pub mod config;
pub mod congestion;
pub mod receiver;
pub mod scheduler;
pub mod sender;
pub mod stats;
pub mod transport;
pub mod wire;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::DtpConfig;
pub use scheduler::{DeadlineScheduler, DequeueOutcome};
pub use wire::{Packet, PacketFlags, PacketHeader, PacketType, Priority};
