use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::{CacheError, ExecutionError};
use crate::message::{Message, SeqRange, SessionId};
use crate::runtime::WorkerPool;
use crate::source::{MessageSource, MessageStream};
use crate::virtual_time::{Lane, LaneRecv, ScopeReport, VirtualTimeScope};

use super::MessageFilter;

/// Outcome of a deadline-bounded feed receive.
#[derive(Debug)]
pub(crate) enum FeedRecv {
    Item(Message),
    Timeout,
    Closed,
}

/// A message stream entered into virtual time and filtered.
///
/// Live ingestion reads through this. Page fetches apply the same filter to a
/// replay, so indices agree between the two.
pub(crate) struct FilteredFeed {
    // Dropped before the scope, so the pump sees the lane close first.
    lane: Lane,
    scope: VirtualTimeScope,
    filter: Arc<dyn MessageFilter>,
}

impl FilteredFeed {
    pub(crate) fn open(
        stream: MessageStream,
        filter: Arc<dyn MessageFilter>,
        pool: &WorkerPool,
    ) -> Result<Self, ExecutionError> {
        let (scope, mut lanes) = VirtualTimeScope::enter(stream, 1, pool)?;
        let lane = lanes.pop().ok_or_else(|| ExecutionError::Disconnected {
            pool: pool.name().to_string(),
        })?;
        Ok(Self { lane, scope, filter })
    }

    /// Next accepted message, giving up at `deadline`.
    pub(crate) fn recv_deadline(&mut self, deadline: Instant) -> FeedRecv {
        loop {
            match self.lane.recv_deadline(deadline) {
                LaneRecv::Item(stamped) if self.filter.accept(&stamped.value) => return FeedRecv::Item(stamped.value),
                LaneRecv::Item(_) => {}
                LaneRecv::Timeout => return FeedRecv::Timeout,
                LaneRecv::Closed => return FeedRecv::Closed,
            }
        }
    }

    /// Stop reading and collect the scope's report.
    pub(crate) fn close(self) -> Result<ScopeReport, ExecutionError> {
        let Self { lane, scope, .. } = self;
        drop(lane);
        scope.exit()
    }
}

/// Fetch page `page` of the filtered history of `session`.
///
/// Runs on the calling thread: a finite replay needs no pump, and the caller
/// blocks for the page anyway. Returns `Ok(None)` if `cancel` was raised before
/// the page was complete; the replay subscription is released either way. A
/// page may be shorter than `page_size` if history ends inside it.
pub(crate) fn fetch_page(
    source: &dyn MessageSource,
    session: &SessionId,
    filter: &dyn MessageFilter,
    page: usize,
    page_size: usize,
    cancel: Option<&AtomicBool>,
) -> Result<Option<Vec<Message>>, CacheError> {
    let stream = source
        .replay(session, SeqRange::unbounded())
        .map_err(|source| CacheError::Fetch { page, source })?;

    let skip = page.saturating_mul(page_size);
    let mut seen = 0usize;
    let mut messages = Vec::with_capacity(page_size);
    for item in stream {
        if cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            debug!(session = %session, page, "page fetch cancelled");
            return Ok(None);
        }
        let msg = item.map_err(|source| CacheError::Fetch { page, source })?;
        if !filter.accept(&msg) {
            continue;
        }
        if seen >= skip {
            messages.push(msg);
            if messages.len() == page_size {
                break;
            }
        }
        seen += 1;
    }
    Ok(Some(messages))
}
