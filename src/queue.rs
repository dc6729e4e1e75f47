//! Per-endpoint queue of received segments awaiting a reader.
//!
//! Segments are appended on the protocol thread as they arrive and consumed,
//! possibly in pieces, by reader threads. Entries are never reordered: a
//! partially read entry goes back to the head with its offset advanced.

use std::collections::VecDeque;

use crate::context::PoolSlot;
use crate::engine::Segment;

/// A buffered segment and the number of its bytes already delivered.
#[derive(Debug)]
pub struct QueueEntry {
    segment: Segment,
    offset: usize,
    _slot: PoolSlot,
}

impl QueueEntry {
    /// Wraps a segment, taking ownership of it, in an entry accounted against
    /// `slot`.
    pub fn new(segment: Segment, slot: PoolSlot) -> Self {
        QueueEntry {
            segment,
            offset: 0,
            _slot: slot,
        }
    }

    /// The buffered segment.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Bytes already delivered to readers.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet delivered.
    pub fn remaining(&self) -> usize {
        self.segment.len() - self.offset
    }

    /// Marks `len` more bytes as delivered.
    pub fn advance(&mut self, len: usize) {
        debug_assert!(len <= self.remaining());
        self.offset += len.min(self.remaining());
    }

    /// Releases the entry, keeping only the segment.
    pub fn into_segment(self) -> Segment {
        self.segment
    }
}

/// FIFO of [`QueueEntry`] values. Guarded by the owning endpoint's lock.
#[derive(Debug, Default)]
pub struct PacketQueue {
    entries: VecDeque<QueueEntry>,
}

impl PacketQueue {
    /// Appends an entry at the tail.
    pub fn enqueue(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    /// Removes the head entry.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Puts a partially read entry back at the head.
    pub fn requeue(&mut self, entry: QueueEntry) {
        self.entries.push_front(entry);
    }

    /// Releases every entry, returning how many there were.
    pub fn drain(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Undelivered bytes across all entries.
    pub fn pending_bytes(&self) -> usize {
        self.entries.iter().map(QueueEntry::remaining).sum()
    }
}
