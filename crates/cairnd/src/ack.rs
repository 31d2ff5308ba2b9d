//! Ack bookkeeping: per-file tables of in-flight chunks.
//!
//! One [`AckTracker`] exists per file the sender has committed to
//! transferring; the table is rebuilt at every send-set boundary. The
//! tracker caches each unacknowledged datagram verbatim so a
//! retransmission is a pure socket send.

use std::collections::HashMap;

use bytes::Bytes;
use dashmap::DashMap;

use cairn_core::FileKey;

/// Bookkeeping for one in-flight file.
///
/// Invariants: `current <= biggest + 1`; every seqnum in `sent` lies in
/// `[current, biggest]`; acknowledging removes from `sent` and advances
/// `current` past the contiguous acknowledged prefix.
#[derive(Debug)]
struct AckTracker {
    /// Unacknowledged encoded datagrams, keyed by sequence number.
    sent: HashMap<u32, Bytes>,
    /// Lowest unacknowledged sequence number; the sender's cursor for the
    /// next chunk to originate once it passes `biggest`.
    current: u32,
    /// Highest sequence number ever recorded. None until the first send.
    biggest: Option<u32>,
}

impl AckTracker {
    fn new(init_seq: u32) -> Self {
        AckTracker {
            sent: HashMap::new(),
            current: init_seq,
            biggest: None,
        }
    }
}

/// Table of ack trackers, one per file in the active send set.
/// Operations on a single key are atomic with respect to one another.
pub struct AckTable {
    init_seq: u16,
    trackers: DashMap<FileKey, AckTracker>,
}

impl AckTable {
    pub fn new(init_seq: u16) -> Self {
        AckTable {
            init_seq,
            trackers: DashMap::new(),
        }
    }

    pub fn init_seq(&self) -> u32 {
        u32::from(self.init_seq)
    }

    /// Sequence numbers are 16 bits on the wire but a chunk stream may
    /// legally span the full 2^16 space, so trackers count in u32. This
    /// maps a wire seqnum back to the stream position by its wrapping
    /// distance from the first sequence number.
    pub fn widen(&self, wire_seq: u16) -> u32 {
        self.init_seq() + u32::from(wire_seq.wrapping_sub(self.init_seq))
    }

    /// Drop every tracker and create a fresh one per key of the new send
    /// set. Called at the start of each data phase.
    pub fn reset<I>(&self, keys: I)
    where
        I: IntoIterator<Item = FileKey>,
    {
        self.trackers.clear();
        for key in keys {
            self.trackers.insert(key, AckTracker::new(self.init_seq()));
        }
    }

    /// Remove one tracker, releasing its cached datagrams.
    pub fn release(&self, key: &FileKey) {
        self.trackers.remove(key);
    }

    /// Record an originated chunk: cache the encoded datagram and raise
    /// the high-water mark.
    pub fn record_sent(&self, key: &FileKey, seq: u32, datagram: Bytes) {
        let mut tracker = self
            .trackers
            .entry(*key)
            .or_insert_with(|| AckTracker::new(self.init_seq()));
        tracker.sent.insert(seq, datagram);
        tracker.biggest = Some(tracker.biggest.map_or(seq, |b| b.max(seq)));
    }

    /// Acknowledge one chunk. Removes it from the in-flight set and
    /// advances `current` past any contiguous acknowledged prefix.
    /// Idempotent: acknowledging an absent seqnum changes nothing.
    pub fn acknowledge(&self, key: &FileKey, wire_seq: u16) {
        let seq = self.widen(wire_seq);
        if let Some(mut tracker) = self.trackers.get_mut(key) {
            tracker.sent.remove(&seq);
            if let Some(biggest) = tracker.biggest {
                while tracker.current <= biggest && !tracker.sent.contains_key(&tracker.current) {
                    tracker.current += 1;
                }
            }
        }
    }

    /// The lowest unacknowledged sequence number for a file.
    pub fn current(&self, key: &FileKey) -> u32 {
        self.trackers
            .get(key)
            .map(|t| t.current)
            .unwrap_or_else(|| self.init_seq())
    }

    /// Whether nothing is in flight for a file.
    pub fn is_empty(&self, key: &FileKey) -> bool {
        self.trackers.get(key).map_or(true, |t| t.sent.is_empty())
    }

    /// The cached datagram for an in-flight seqnum, if still unacknowledged.
    pub fn cached(&self, key: &FileKey, seq: u32) -> Option<Bytes> {
        self.trackers
            .get(key)
            .and_then(|t| t.sent.get(&seq).cloned())
    }

    /// Whether a tracker exists for this key.
    pub fn tracked(&self, key: &FileKey) -> bool {
        self.trackers.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> FileKey {
        FileKey([n; 16])
    }

    fn datagram(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    #[test]
    fn fresh_tracker_starts_at_init() {
        let table = AckTable::new(0);
        table.reset([key(1)]);
        assert_eq!(table.current(&key(1)), 0);
        assert!(table.is_empty(&key(1)));
    }

    #[test]
    fn contiguous_acks_advance_past_biggest() {
        let table = AckTable::new(0);
        table.reset([key(1)]);
        for seq in 0..4 {
            table.record_sent(&key(1), seq, datagram(seq as u8));
        }
        for seq in 0..4u16 {
            table.acknowledge(&key(1), seq);
        }
        // All four acknowledged: the cursor sits one past the high-water mark.
        assert_eq!(table.current(&key(1)), 4);
        assert!(table.is_empty(&key(1)));
    }

    #[test]
    fn gap_holds_the_cursor_until_filled() {
        let table = AckTable::new(0);
        table.reset([key(1)]);
        for seq in 0..4 {
            table.record_sent(&key(1), seq, datagram(seq as u8));
        }
        table.acknowledge(&key(1), 0);
        table.acknowledge(&key(1), 2);
        table.acknowledge(&key(1), 3);
        // Chunk 1 is the earliest unacknowledged: current stops there.
        assert_eq!(table.current(&key(1)), 1);
        assert!(!table.is_empty(&key(1)));
        assert!(table.cached(&key(1), 1).is_some());
        assert!(table.cached(&key(1), 2).is_none());

        table.acknowledge(&key(1), 1);
        assert_eq!(table.current(&key(1)), 4);
        assert!(table.is_empty(&key(1)));
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let table = AckTable::new(0);
        table.reset([key(1)]);
        table.record_sent(&key(1), 0, datagram(0));
        table.record_sent(&key(1), 1, datagram(1));
        table.acknowledge(&key(1), 0);
        table.acknowledge(&key(1), 0);
        assert_eq!(table.current(&key(1)), 1);
        assert!(table.cached(&key(1), 1).is_some());
    }

    #[test]
    fn acknowledging_the_unsent_changes_nothing() {
        let table = AckTable::new(0);
        table.reset([key(1)]);
        table.acknowledge(&key(1), 9);
        assert_eq!(table.current(&key(1)), 0);
        assert!(table.is_empty(&key(1)));
    }

    #[test]
    fn in_flight_seqnums_stay_within_window_bounds() {
        let table = AckTable::new(0);
        table.reset([key(1)]);
        for seq in 0..8 {
            table.record_sent(&key(1), seq, datagram(seq as u8));
        }
        for seq in [0u16, 1, 4, 6] {
            table.acknowledge(&key(1), seq);
        }
        let current = table.current(&key(1));
        assert_eq!(current, 2);
        for seq in [2u32, 3, 5, 7] {
            assert!(table.cached(&key(1), seq).is_some());
            assert!(seq >= current && seq <= 7);
        }
    }

    #[test]
    fn reset_replaces_all_trackers() {
        let table = AckTable::new(0);
        table.reset([key(1)]);
        table.record_sent(&key(1), 0, datagram(0));
        table.reset([key(2)]);
        assert!(!table.tracked(&key(1)));
        assert!(table.tracked(&key(2)));
        assert_eq!(table.current(&key(1)), 0);
    }

    #[test]
    fn nonzero_init_widens_wrapped_wire_seqs() {
        let table = AckTable::new(5);
        assert_eq!(table.widen(5), 5);
        assert_eq!(table.widen(u16::MAX), 5 + u32::from(u16::MAX - 5));
        // Wire values below init wrapped past 2^16.
        assert_eq!(table.widen(4), 5 + 65535);
    }

    #[test]
    fn cached_datagram_is_returned_verbatim() {
        let table = AckTable::new(0);
        table.reset([key(3)]);
        let bytes = Bytes::from_static(b"chunk-zero");
        table.record_sent(&key(3), 0, bytes.clone());
        assert_eq!(table.cached(&key(3), 0), Some(bytes));
    }
}
