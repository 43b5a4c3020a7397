//! Random access over a session's filtered message sequence.
//!
//! [`WindowedMessageCache`] pages through replayed history in fixed-size
//! buffers and serves the newest messages from a live ring, so a viewer can
//! scroll an unbounded sequence without materializing it.

mod cache;
mod feed;
mod live;

use crate::message::Message;

pub use cache::{CacheStats, SizeChange, WindowedMessageCache};

/// Predicate selecting which messages a cache exposes.
pub trait MessageFilter: Send + Sync {
    /// Returns true if `msg` belongs to the filtered sequence.
    fn accept(&self, msg: &Message) -> bool;
}

impl<F> MessageFilter for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn accept(&self, msg: &Message) -> bool {
        self(msg)
    }
}

/// Filter that keeps every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl MessageFilter for AcceptAll {
    fn accept(&self, _msg: &Message) -> bool {
        true
    }
}
