//! Message representations shared by both transport paths, the registered
//! buffer pool, and receipt-interval bookkeeping.

use std::collections::BTreeSet;

use crate::multicast::NodeId;
use crate::utils::ShardcastError;

/// Byte size of the fixed wire header.
pub(crate) const HEADER_SIZE: usize = 4 + 8 + 4 + 1;

/// Fixed header preceding every payload on either transport path.
///
/// `header_size` is carried on the wire so a receiver can skip the header
/// without knowing its exact version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageHeader {
    pub header_size: u32,
    pub index: i64,
    pub pause_sending_turns: u32,
    pub cooked_send: bool,
}

impl MessageHeader {
    pub(crate) fn new(
        index: i64,
        pause_sending_turns: u32,
        cooked_send: bool,
    ) -> Self {
        MessageHeader {
            header_size: HEADER_SIZE as u32,
            index,
            pause_sending_turns,
            cooked_send,
        }
    }

    /// Writes the header into the first `HEADER_SIZE` bytes of `buf`.
    pub(crate) fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.header_size.to_le_bytes());
        buf[4..12].copy_from_slice(&self.index.to_le_bytes());
        buf[12..16].copy_from_slice(&self.pause_sending_turns.to_le_bytes());
        buf[16] = self.cooked_send as u8;
    }

    /// Reads a header back from the first bytes of `buf`.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self, ShardcastError> {
        if buf.len() < HEADER_SIZE {
            return Err(ShardcastError::msg(format!(
                "buffer of {} bytes too short for header",
                buf.len()
            )));
        }
        let header_size = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if (header_size as usize) < HEADER_SIZE {
            return Err(ShardcastError::msg(format!(
                "invalid header_size {}",
                header_size
            )));
        }
        Ok(MessageHeader {
            header_size,
            index: i64::from_le_bytes(buf[4..12].try_into().unwrap()),
            pause_sending_turns: u32::from_le_bytes(
                buf[12..16].try_into().unwrap(),
            ),
            cooked_send: buf[16] != 0,
        })
    }
}

/// One registered send/receive buffer from a subgroup's pool. Exclusively
/// owned by the free list, a pending/current send, a bulk-receive slot, a
/// locally-stable queue, or a not-yet-persisted queue, never shared.
#[derive(Debug)]
pub(crate) struct MessageBuffer {
    data: Box<[u8]>,
}

impl MessageBuffer {
    pub(crate) fn new(size: usize) -> Self {
        MessageBuffer {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Zero-capacity buffer used by skipped-turn placeholders; never pooled.
    pub(crate) fn empty() -> Self {
        MessageBuffer {
            data: Box::new([]),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A message owning a pooled buffer, moved through the bulk path.
#[derive(Debug)]
pub(crate) struct BulkMessage {
    pub sender_id: NodeId,
    pub index: i64,
    /// Total bytes used in `buffer`, header included. Zero for placeholders.
    pub size: usize,
    pub buffer: MessageBuffer,
}

impl BulkMessage {
    /// Placeholder occupying one skipped sending turn.
    pub(crate) fn placeholder(sender_id: NodeId, index: i64) -> Self {
        BulkMessage {
            sender_id,
            index,
            size: 0,
            buffer: MessageBuffer::empty(),
        }
    }
}

/// A message received through an SST slot; owns a copy of the slot bytes.
#[derive(Debug, Clone)]
pub(crate) struct SlotMessage {
    pub sender_id: NodeId,
    pub index: i64,
    /// Total bytes in `data`, header included. Zero for placeholders.
    pub size: usize,
    pub data: Vec<u8>,
}

impl SlotMessage {
    pub(crate) fn placeholder(sender_id: NodeId, index: i64) -> Self {
        SlotMessage {
            sender_id,
            index,
            size: 0,
            data: Vec::new(),
        }
    }
}

/// Hole-aware receipt counter for one sender column.
///
/// `value()` is the highest index such that every index at or below it has
/// been received; receipt intervals past a hole are remembered but do not
/// advance the counter until the hole fills.
#[derive(Debug, Clone)]
pub(crate) struct IntervalTracker {
    contiguous: i64,
    pending: BTreeSet<i64>,
}

impl IntervalTracker {
    pub(crate) fn new() -> Self {
        IntervalTracker {
            contiguous: -1,
            pending: BTreeSet::new(),
        }
    }

    /// Records receipt of indices `beg..=end`; returns the new counter.
    pub(crate) fn insert(&mut self, beg: i64, end: i64) -> i64 {
        debug_assert!(beg <= end);
        for idx in beg..=end {
            if idx > self.contiguous {
                self.pending.insert(idx);
            }
        }
        while self.pending.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
        self.contiguous
    }

    #[inline]
    pub(crate) fn value(&self) -> i64 {
        self.contiguous
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = MessageHeader::new(42, 2, true);
        let mut buf = vec![0u8; HEADER_SIZE + 8];
        header.encode_into(&mut buf);
        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.header_size as usize, HEADER_SIZE);
    }

    #[test]
    fn header_too_short() {
        let buf = vec![0u8; HEADER_SIZE - 1];
        assert!(MessageHeader::decode(&buf).is_err());
    }

    #[test]
    fn tracker_advances_contiguously() {
        let mut tracker = IntervalTracker::new();
        assert_eq!(tracker.value(), -1);
        assert_eq!(tracker.insert(0, 0), 0);
        assert_eq!(tracker.insert(1, 3), 3);
    }

    #[test]
    fn tracker_stops_at_holes() {
        let mut tracker = IntervalTracker::new();
        // indices 2..=4 arrive before 0..=1
        assert_eq!(tracker.insert(2, 4), -1);
        assert_eq!(tracker.insert(1, 1), -1);
        // hole at 0 fills, counter jumps to 4
        assert_eq!(tracker.insert(0, 0), 4);
    }

    #[test]
    fn tracker_duplicate_intervals_idempotent() {
        let mut tracker = IntervalTracker::new();
        assert_eq!(tracker.insert(0, 2), 2);
        assert_eq!(tracker.insert(1, 2), 2);
        assert_eq!(tracker.insert(3, 3), 3);
    }
}
