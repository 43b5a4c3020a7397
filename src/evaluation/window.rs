use std::collections::VecDeque;
use std::sync::Arc;

use crate::message::{EventTime, Message};
use crate::virtual_time::{Lane, Stamped};

/// The most recent messages seen on a lane, bounded by capacity.
#[derive(Debug, Clone)]
pub(crate) struct TrailingWindow {
    capacity: usize,
    messages: VecDeque<Message>,
    seen: u64,
    last_time: Option<EventTime>,
}

impl TrailingWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity),
            seen: 0,
            last_time: None,
        }
    }

    pub(crate) fn push(&mut self, stamped: Stamped<Message>) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.last_time = Some(stamped.time);
        self.messages.push_back(stamped.value);
        self.seen += 1;
    }

    /// Total messages pushed, including evicted ones.
    pub(crate) const fn seen(&self) -> u64 {
        self.seen
    }

    /// Virtual time of the newest message.
    pub(crate) const fn last_time(&self) -> Option<EventTime> {
        self.last_time
    }

    pub(crate) fn into_shared(self) -> Arc<[Message]> {
        Vec::from(self.messages).into()
    }
}

/// Follow `lane` to its end, keeping the last `capacity` messages.
pub(crate) fn track(lane: Lane, capacity: usize) -> TrailingWindow {
    let mut window = TrailingWindow::new(capacity);
    for stamped in lane {
        window.push(stamped);
    }
    window
}
