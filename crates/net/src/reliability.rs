//! Acknowledgement and retransmission bookkeeping for one circuit.
//!
//! Three structures cooperate: `PendingAckSet` holds inbound sequences we
//! still owe the peer, `UnackedMap` holds reliable sends awaiting the
//! peer's ack, and `DuplicateArchive` remembers recent inbound sequences so
//! retransmits are re-acked without being redelivered. The receive loop is
//! the only writer of the archive; the send path and the resend timer share
//! the other two behind their own locks.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::protocol::{next_sequence, PacketFlags};

/// Atomic outgoing sequence assignment; wraps to 1, never reuses 0, and two
/// concurrent senders can never draw the same number.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU32);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn next(&self) -> u32 {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(next_sequence(current))
            });
        match prev {
            Ok(previous) => next_sequence(previous),
            Err(_) => unreachable!("sequence update closure never declines"),
        }
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Inbound sequences that still need acknowledging, in order.
#[derive(Debug, Default)]
pub struct PendingAckSet {
    pending: BTreeSet<u32>,
}

impl PendingAckSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sequence: u32) {
        self.pending.insert(sequence);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take up to `max` sequences for piggybacking on an outgoing packet;
    /// whatever does not fit stays pending.
    pub fn drain(&mut self, max: usize) -> Vec<u32> {
        let mut taken = Vec::with_capacity(max.min(self.pending.len()));
        while taken.len() < max {
            let Some(first) = self.pending.pop_first() else {
                break;
            };
            taken.push(first);
        }
        taken
    }
}

/// A reliable packet waiting for its acknowledgement.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub data: Vec<u8>,
    pub sequence: u32,
    pub sent_at: Instant,
    pub resend_count: u32,
}

impl OutgoingPacket {
    pub fn new(sequence: u32, data: Vec<u8>) -> Self {
        Self {
            data,
            sequence,
            sent_at: Instant::now(),
            resend_count: 0,
        }
    }

    /// Resends keep their sequence number; only the resent flag changes.
    fn mark_resent(&mut self) {
        self.data[0] = (PacketFlags::from_byte(self.data[0]) | PacketFlags::RESENT).to_byte();
        self.resend_count += 1;
        self.sent_at = Instant::now();
    }
}

/// Reliable sends awaiting acknowledgement, keyed by sequence.
#[derive(Debug)]
pub struct UnackedMap {
    packets: HashMap<u32, OutgoingPacket>,
    resend_timeout: Duration,
    max_resends: u32,
}

/// One resend sweep: buffers to put back on the wire and sequences dropped
/// after exhausting their retries.
#[derive(Debug, Default)]
pub struct ResendSweep {
    pub resend: Vec<(u32, Vec<u8>)>,
    pub expired: Vec<u32>,
}

impl UnackedMap {
    pub fn new(resend_timeout: Duration, max_resends: u32) -> Self {
        Self {
            packets: HashMap::new(),
            resend_timeout,
            max_resends,
        }
    }

    pub fn register(&mut self, packet: OutgoingPacket) {
        self.packets.insert(packet.sequence, packet);
    }

    /// Remove an acknowledged entry. `None` means the peer acked something
    /// we never sent; the caller logs and moves on.
    pub fn ack(&mut self, sequence: u32) -> Option<OutgoingPacket> {
        self.packets.remove(&sequence)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Sequence of the entry waiting longest, for the ping probe.
    pub fn oldest(&self) -> Option<u32> {
        self.packets
            .values()
            .min_by_key(|p| p.sent_at)
            .map(|p| p.sequence)
    }

    /// Scan for entries past the resend timeout. Each is either queued for
    /// resend with its counter bumped, or dropped once the counter hits the
    /// retry limit.
    pub fn sweep(&mut self, now: Instant) -> ResendSweep {
        let mut result = ResendSweep::default();

        let timed_out: Vec<u32> = self
            .packets
            .values()
            .filter(|p| now.duration_since(p.sent_at) >= self.resend_timeout)
            .map(|p| p.sequence)
            .collect();

        for sequence in timed_out {
            let Some(packet) = self.packets.get_mut(&sequence) else {
                continue;
            };
            if packet.resend_count >= self.max_resends {
                self.packets.remove(&sequence);
                result.expired.push(sequence);
            } else {
                packet.mark_resent();
                result.resend.push((sequence, packet.data.clone()));
            }
        }

        result
    }
}

/// How an inbound reliable packet relates to what we have already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// First sighting; deliver.
    New,
    /// Flagged resent but never seen: the original was lost and this is the
    /// first delivery of the retransmit. Deliver.
    ResentNew,
    /// A resent packet we already delivered. Ack again, do not redeliver.
    Duplicate,
    /// Already delivered but not flagged resent: a misbehaving peer. Same
    /// handling as `Duplicate`, logged louder.
    AnomalousDuplicate,
}

impl Delivery {
    pub fn should_deliver(self) -> bool {
        matches!(self, Delivery::New | Delivery::ResentNew)
    }
}

/// Fixed-capacity record of recently seen inbound sequences: a FIFO ring
/// for eviction order and a set for the lookup.
#[derive(Debug)]
pub struct DuplicateArchive {
    ring: VecDeque<u32>,
    seen: HashSet<u32>,
    capacity: usize,
}

impl DuplicateArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sequence and classify the packet it arrived on.
    pub fn witness(&mut self, sequence: u32, resent: bool) -> Delivery {
        if self.seen.contains(&sequence) {
            return if resent {
                Delivery::Duplicate
            } else {
                Delivery::AnomalousDuplicate
            };
        }

        while self.ring.len() >= self.capacity {
            if let Some(evicted) = self.ring.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.ring.push_back(sequence);
        self.seen.insert(sequence);

        if resent { Delivery::ResentNew } else { Delivery::New }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
