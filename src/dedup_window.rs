use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::sequence_number::SequenceNumber;

/// The most recently received sequence numbers of a circuit. When the window is full, the
///  sequence number that was received longest ago is forgotten.
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<SequenceNumber>,
    seen: FxHashSet<SequenceNumber>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> DedupWindow {
        DedupWindow {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: FxHashSet::default(),
        }
    }

    /// Returns `false` if the sequence number is in the window already, i.e. the datagram is
    ///  a duplicate
    pub fn insert(&mut self, sequence: SequenceNumber) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(sequence);
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
