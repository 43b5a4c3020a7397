use std::ops::Range;

use crate::message::Message;

/// Fixed-capacity circular buffer of the newest messages, addressed by
/// global index. Messages are appended in index order.
#[derive(Debug)]
pub(crate) struct LiveRing {
    slots: Vec<Option<Message>>,
    next: usize,
}

impl LiveRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            next: 0,
        }
    }

    /// Append `msg` at the next global index and return that index.
    pub(crate) fn push(&mut self, msg: Message) -> usize {
        let index = self.next;
        let cap = self.slots.len();
        self.slots[index % cap] = Some(msg);
        self.next = index + 1;
        index
    }

    /// Global indices currently served.
    pub(crate) fn span(&self) -> Range<usize> {
        self.next.saturating_sub(self.slots.len())..self.next
    }

    pub(crate) fn get(&self, index: usize) -> Option<Message> {
        if !self.span().contains(&index) {
            return None;
        }
        self.slots[index % self.slots.len()].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::message::{EndpointId, EventTime};

    fn msg(seq: u64) -> Message {
        Message::new(seq, EndpointId::new("a"), EndpointId::new("b"), serde_json::Value::Null, EventTime(seq))
    }

    #[test]
    fn serves_only_the_newest_capacity() {
        let mut ring = LiveRing::new(4);
        for i in 0..10 {
            assert_eq!(ring.push(msg(i)), i as usize);
        }
        assert_eq!(ring.span(), 6..10);
        assert_eq!(ring.get(5), None);
        assert_eq!(ring.get(6).map(|m| m.seq), Some(6));
        assert_eq!(ring.get(9).map(|m| m.seq), Some(9));
        assert_eq!(ring.get(10), None);
    }

    #[test]
    fn partially_filled_ring_serves_from_zero() {
        let mut ring = LiveRing::new(8);
        for i in 0..3 {
            ring.push(msg(i));
        }
        assert_eq!(ring.span(), 0..3);
        assert_eq!(ring.get(0).map(|m| m.seq), Some(0));
        assert_eq!(ring.get(3), None);
    }

    #[test]
    fn empty_ring_serves_nothing() {
        let ring = LiveRing::new(4);
        assert!(ring.span().is_empty());
        assert_eq!(ring.get(0), None);
    }
}
