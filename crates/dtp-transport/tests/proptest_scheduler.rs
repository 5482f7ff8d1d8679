//! Property-based tests for the deadline scheduler.
//!
//! Verifies that for arbitrary workloads:
//! - a more urgent class is never released after a less urgent one
//! - within a class, earlier absolute deadlines go first, ties in enqueue order
//! - the queue never holds more than `max_queue_size` packets
//! - every accepted packet is accounted for exactly once

use bytes::Bytes;
use proptest::prelude::*;
use dtp_transport::clock::{Clock, ManualClock};
use dtp_transport::scheduler::{DeadlineScheduler, DequeueOutcome, SchedulerConfig};
use dtp_transport::wire::{Packet, PacketFlags, Priority};

fn priority() -> impl Strategy<Value = Priority> {
    (0u8..4).prop_map(|r| Priority::from_rank(r).unwrap_or(Priority::Low))
}

/// (priority, timestamp, relative deadline)
fn workload(max: usize) -> impl Strategy<Value = Vec<(Priority, u64, u64)>> {
    proptest::collection::vec((priority(), 0u64..1_000, 1u64..10_000), 1..max)
}

fn unbatched(max_queue_size: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_queue_size,
        batching: false,
        ..SchedulerConfig::default()
    }
}

fn drain_sent(sched: &DeadlineScheduler) -> Vec<Packet> {
    std::iter::from_fn(|| sched.dequeue().into_packet()).collect()
}

proptest! {
    #[test]
    fn release_order_is_priority_then_deadline(items in workload(200)) {
        // Clock sits at 0, so nothing is expired.
        let (clock, _) = ManualClock::shared(0);
        let sched = DeadlineScheduler::new(unbatched(1_000), clock).unwrap();
        for (seq, &(p, ts, dl)) in items.iter().enumerate() {
            prop_assert!(sched.enqueue(Packet::data(p, seq as u16, ts, dl, Bytes::new())));
        }

        let out = drain_sent(&sched);
        prop_assert_eq!(out.len(), items.len());
        for pair in out.windows(2) {
            let (a, b) = (&pair[0].header, &pair[1].header);
            prop_assert!(a.priority.rank() <= b.priority.rank());
            if a.priority == b.priority {
                prop_assert!(a.absolute_deadline() <= b.absolute_deadline());
                if a.absolute_deadline() == b.absolute_deadline() {
                    prop_assert!(a.sequence < b.sequence);
                }
            }
        }
        prop_assert_eq!(sched.dequeue(), DequeueOutcome::Empty);
    }

    #[test]
    fn capacity_is_never_exceeded(
        items in workload(300),
        cap in 1usize..50,
        steps in proptest::collection::vec(0u64..200, 1..300),
    ) {
        let (clock, time) = ManualClock::shared(0);
        let sched = DeadlineScheduler::new(unbatched(cap), clock).unwrap();
        for (i, &(p, _, dl)) in items.iter().enumerate() {
            time.advance(steps[i % steps.len()]);
            let now = time.now_ms();
            sched.enqueue(Packet::data(p, i as u16, now, dl, Bytes::new()));
            prop_assert!(sched.len() <= cap);
            if i % 3 == 0 {
                let _ = sched.dequeue();
            }
        }
    }

    #[test]
    fn accepted_packets_are_accounted_for(items in workload(300), cap in 1usize..40) {
        // Nothing expires at t=0, so every accepted packet is either
        // released, evicted by an urgent arrival, or still queued.
        let (clock, _) = ManualClock::shared(0);
        let sched = DeadlineScheduler::new(unbatched(cap), clock).unwrap();
        let mut accepted = 0u64;
        for (seq, &(p, ts, dl)) in items.iter().enumerate() {
            if sched.enqueue(Packet::data(p, seq as u16, ts, dl, Bytes::new())) {
                accepted += 1;
            }
        }
        let released = drain_sent(&sched).len() as u64;
        let stats = sched.stats();
        prop_assert_eq!(stats.enqueued, accepted);
        prop_assert_eq!(stats.dequeued, released);
        prop_assert_eq!(accepted, released + stats.evicted);
        prop_assert_eq!(stats.dropped_expired, 0);
        prop_assert_eq!(stats.queued, 0);
    }

    #[test]
    fn batched_low_priority_is_stamped(count in 1usize..60, batch_size in 1usize..12) {
        let (clock, _) = ManualClock::shared(0);
        let config = SchedulerConfig {
            batch_size,
            ..SchedulerConfig::default()
        };
        let sched = DeadlineScheduler::new(config, clock).unwrap();
        for seq in 0..count {
            sched.enqueue(Packet::data(Priority::Low, seq as u16, 0, 6_000, Bytes::new()));
        }
        prop_assert_eq!(sched.pending_batched(), count % batch_size);

        let out = drain_sent(&sched);
        prop_assert_eq!(out.len(), count);
        for p in &out {
            prop_assert!(p.header.flags.contains(PacketFlags::BATCHED));
            prop_assert_ne!(p.header.batch_id, 0);
        }
    }
}
