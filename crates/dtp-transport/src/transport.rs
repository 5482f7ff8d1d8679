//! # Datagram Transport Seam
//!
//! DTP runs over any unreliable datagram service. The sender only needs
//! [`Transport::send`]; the receive side feeds datagrams into
//! [`PacketReceiver::on_receive`](crate::receiver::PacketReceiver::on_receive).
//!
//! [`LoopbackTransport`] is an in-process stand-in built on crossbeam
//! channels, with optional deterministic loss, used by tests and the demo.

use anyhow::{bail, Context};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Fire-and-forget datagram send.
pub trait Transport: Send + Sync {
    fn send(&self, bytes: Bytes, dest: SocketAddr) -> anyhow::Result<()>;
}

/// A datagram together with its source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Bytes,
    pub source: SocketAddr,
}

/// One end of an in-process datagram link.
pub struct LoopbackTransport {
    local: SocketAddr,
    peer: SocketAddr,
    tx: Sender<Datagram>,
    rx: Receiver<Datagram>,
    /// Drop every Nth outgoing datagram (0 = never).
    drop_every: u64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl LoopbackTransport {
    /// Connected pair of endpoints with the given addresses.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (LoopbackTransport, LoopbackTransport) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (
            LoopbackTransport::new(a, b, a_tx, a_rx),
            LoopbackTransport::new(b, a, b_tx, b_rx),
        )
    }

    fn new(local: SocketAddr, peer: SocketAddr, tx: Sender<Datagram>, rx: Receiver<Datagram>) -> Self {
        LoopbackTransport {
            local,
            peer,
            tx,
            rx,
            drop_every: 0,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Silently discard every `n`th datagram sent from this end.
    pub fn with_drop_every(mut self, n: u64) -> Self {
        self.drop_every = n;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Next datagram if one is waiting.
    pub fn try_recv(&self) -> Option<Datagram> {
        match self.rx.try_recv() {
            Ok(d) => Some(d),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for a datagram. Errors once the peer is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> anyhow::Result<Option<Datagram>> {
        match self.rx.recv_timeout(timeout) {
            Ok(d) => Ok(Some(d)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("loopback peer {} disconnected", self.peer),
        }
    }

    /// Datagrams waiting to be received at this end.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn datagrams_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, bytes: Bytes, dest: SocketAddr) -> anyhow::Result<()> {
        if dest != self.peer {
            bail!("no route from {} to {dest}", self.local);
        }
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if self.drop_every > 0 && n % self.drop_every == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.tx
            .send(Datagram {
                bytes,
                source: self.local,
            })
            .ok()
            .with_context(|| format!("loopback peer {} disconnected", self.peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:4433".parse().unwrap(),
            "127.0.0.1:4434".parse().unwrap(),
        )
    }

    #[test]
    fn pair_delivers_both_ways() {
        let (a, b) = addrs();
        let (left, right) = LoopbackTransport::pair(a, b);
        left.send(Bytes::from_static(b"ping"), b).unwrap();
        let d = right.try_recv().unwrap();
        assert_eq!(d.bytes, Bytes::from_static(b"ping"));
        assert_eq!(d.source, a);

        right.send(Bytes::from_static(b"pong"), a).unwrap();
        let d = left.recv_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(d.bytes, Bytes::from_static(b"pong"));
        assert!(left.try_recv().is_none());
    }

    #[test]
    fn wrong_destination_is_an_error() {
        let (a, b) = addrs();
        let (left, _right) = LoopbackTransport::pair(a, b);
        assert!(left.send(Bytes::new(), a).is_err());
    }

    #[test]
    fn deterministic_loss() {
        let (a, b) = addrs();
        let (left, right) = LoopbackTransport::pair(a, b);
        let left = left.with_drop_every(3);
        for i in 0..9u8 {
            left.send(Bytes::copy_from_slice(&[i]), b).unwrap();
        }
        assert_eq!(left.datagrams_sent(), 9);
        assert_eq!(left.datagrams_dropped(), 3);
        assert_eq!(right.pending(), 6);
        let got: Vec<u8> = std::iter::from_fn(|| right.try_recv()).map(|d| d.bytes[0]).collect();
        assert_eq!(got, vec![0, 1, 3, 4, 6, 7]);
    }

    #[test]
    fn disconnected_peer_is_reported() {
        let (a, b) = addrs();
        let (left, right) = LoopbackTransport::pair(a, b);
        drop(right);
        assert!(left.send(Bytes::new(), b).is_err());
        assert!(left.recv_timeout(Duration::from_millis(1)).is_err());
    }
}
