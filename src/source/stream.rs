use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};

use crate::error::SourceError;
use crate::message::Message;

/// Outcome of a deadline-bounded receive.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecv {
    /// The next item of the stream.
    Item(Result<Message, SourceError>),
    /// Nothing arrived before the deadline.
    Timeout,
    /// The stream has ended.
    Closed,
}

type Release = Box<dyn FnOnce() + Send>;

/// An ordered, push-fed sequence of messages from a source.
///
/// Iterating blocks until the next message arrives. The stream ends when the
/// producer is done (end of a replay, end of a session). Dropping the stream
/// releases its upstream subscription.
pub struct MessageStream {
    rx: Receiver<Result<Message, SourceError>>,
    release: Option<Release>,
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("buffered", &self.rx.len())
            .field("subscribed", &self.release.is_some())
            .finish()
    }
}

impl MessageStream {
    /// Wrap a receiver fed by a producer.
    #[must_use]
    pub fn new(rx: Receiver<Result<Message, SourceError>>) -> Self {
        Self { rx, release: None }
    }

    /// Wrap a receiver and run `release` once when the stream is dropped.
    #[must_use]
    pub fn with_release(rx: Receiver<Result<Message, SourceError>>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            release: Some(Box::new(release)),
        }
    }

    /// A finite stream over already-known messages.
    #[must_use]
    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let (tx, rx) = unbounded();
        for msg in messages {
            // The receiver is alive in this scope.
            let _ = tx.send(Ok(msg));
        }
        Self::new(rx)
    }

    /// Receive the next item (blocking). `None` once the stream has ended.
    pub fn recv(&self) -> Option<Result<Message, SourceError>> {
        self.rx.recv().ok()
    }

    /// Receive the next item, giving up at `deadline`.
    pub fn recv_deadline(&self, deadline: Instant) -> StreamRecv {
        match self.rx.recv_deadline(deadline) {
            Ok(item) => StreamRecv::Item(item),
            Err(RecvTimeoutError::Timeout) => StreamRecv::Timeout,
            Err(RecvTimeoutError::Disconnected) => StreamRecv::Closed,
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<Result<Message, SourceError>> {
        &self.rx
    }
}

impl Iterator for MessageStream {
    type Item = Result<Message, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::message::{EndpointId, EventTime};

    fn msg(seq: u64) -> Message {
        Message::new(seq, EndpointId::new("a"), EndpointId::new("b"), serde_json::Value::Null, EventTime(seq))
    }

    #[test]
    fn finite_stream_ends() {
        let stream = MessageStream::from_messages((0..3).map(msg));
        let seqs: Vec<u64> = stream.map(|m| m.unwrap().seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn drop_runs_release_once() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let (_tx, rx) = unbounded();
        let stream = MessageStream::with_release(rx, move || flag.store(true, Ordering::SeqCst));
        assert!(!released.load(Ordering::SeqCst));
        drop(stream);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn recv_deadline_distinguishes_timeout_and_close() {
        let (tx, rx) = unbounded();
        let stream = MessageStream::new(rx);
        let soon = Instant::now() + Duration::from_millis(10);
        assert_eq!(stream.recv_deadline(soon), StreamRecv::Timeout);
        drop(tx);
        assert_eq!(stream.recv_deadline(Instant::now() + Duration::from_millis(10)), StreamRecv::Closed);
    }
}
