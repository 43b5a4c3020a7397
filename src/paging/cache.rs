//! Windowed random-access cache.
//!
//! History is held in `page_count` buffers of `page_size` messages. Page `p`
//! always lives in slot `p % page_count`; the slot's page tag and epoch are
//! the only record of what it holds. Every fetch remembers the epoch it was
//! started under and only writes back if the slot still carries it, so a late
//! prefetch can never overwrite a newer page.
//!
//! A read near a page edge in the direction of travel prefetches the
//! neighbouring page on the worker pool. A read that finds its page missing
//! cancels any prefetch targeting that slot and fetches the page on the
//! calling thread, without help from the pool. The newest `live_capacity` messages are served from a ring
//! fed by the live tail.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::WindowedCacheConfig;
use crate::error::{CacheError, InspectorResult};
use crate::message::{Message, SessionId};
use crate::runtime::WorkerPool;
use crate::source::MessageSource;

use super::feed::{fetch_page, FeedRecv, FilteredFeed};
use super::live::LiveRing;
use super::MessageFilter;

/// A batch of growth, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeChange {
    /// First new index.
    pub first_index: usize,
    /// Last new index (inclusive).
    pub last_index: usize,
    /// Size after the change.
    pub size: usize,
}

/// Counters describing cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Page fetches that blocked a caller.
    pub foreground_fetches: u64,
    /// Prefetches started on the worker pool.
    pub prefetches_started: u64,
    /// Prefetches superseded before they completed.
    pub prefetches_cancelled: u64,
    /// Fetch results dropped because their slot had moved on.
    pub discarded_writes: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    foreground_fetches: AtomicU64,
    prefetches_started: AtomicU64,
    prefetches_cancelled: AtomicU64,
    discarded_writes: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            foreground_fetches: self.foreground_fetches.load(Ordering::Relaxed),
            prefetches_started: self.prefetches_started.load(Ordering::Relaxed),
            prefetches_cancelled: self.prefetches_cancelled.load(Ordering::Relaxed),
            discarded_writes: self.discarded_writes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
enum SlotContents {
    #[default]
    Empty,
    Loading,
    Ready(Arc<[Message]>),
}

#[derive(Debug, Default)]
struct PageSlot {
    page: Option<usize>,
    epoch: u64,
    contents: SlotContents,
    prefetch: Option<Arc<AtomicBool>>,
}

impl PageSlot {
    /// Retag the slot for `page` and return the new epoch.
    fn claim(&mut self, page: usize) -> u64 {
        self.page = Some(page);
        self.epoch += 1;
        self.contents = SlotContents::Loading;
        self.epoch
    }

    fn release(&mut self) {
        self.page = None;
        self.contents = SlotContents::Empty;
        self.prefetch = None;
    }

    fn lookup(&self, page: usize, offset: usize) -> Option<Message> {
        match (&self.contents, self.page) {
            (SlotContents::Ready(messages), Some(tag)) if tag == page => messages.get(offset).cloned(),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct PagingState {
    slots: Vec<PageSlot>,
    last_index: Option<usize>,
}

struct CacheShared {
    session: SessionId,
    source: Arc<dyn MessageSource>,
    filter: Arc<dyn MessageFilter>,
    pool: Arc<WorkerPool>,
    cfg: WindowedCacheConfig,
    size: Mutex<usize>,
    grown: Condvar,
    live: Mutex<LiveRing>,
    paging: Mutex<PagingState>,
    observers: Mutex<Vec<Sender<SizeChange>>>,
    stats: StatCounters,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Random-access view of a session's filtered messages.
///
/// Reads are meant for one consumer thread; ingestion and prefetching run on
/// the worker pool.
pub struct WindowedMessageCache {
    shared: Arc<CacheShared>,
}

impl std::fmt::Debug for WindowedMessageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedMessageCache")
            .field("session", &self.shared.session)
            .field("size", &self.size())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl WindowedMessageCache {
    /// Open a cache over `session` and start following it.
    pub fn open(
        session: SessionId,
        source: Arc<dyn MessageSource>,
        filter: Arc<dyn MessageFilter>,
        pool: Arc<WorkerPool>,
        cfg: WindowedCacheConfig,
    ) -> InspectorResult<Self> {
        cfg.validate()?;

        let stream = source.replay_then_live(&session)?;
        let feed = FilteredFeed::open(stream, Arc::clone(&filter), &pool)?;

        let slots = (0..cfg.page_count).map(|_| PageSlot::default()).collect();
        let shared = Arc::new(CacheShared {
            live: Mutex::new(LiveRing::new(cfg.live_capacity)),
            session,
            source,
            filter,
            pool,
            cfg,
            size: Mutex::new(0),
            grown: Condvar::new(),
            paging: Mutex::new(PagingState {
                slots,
                last_index: None,
            }),
            observers: Mutex::new(Vec::new()),
            stats: StatCounters::default(),
            closed: AtomicBool::new(false),
        });

        // Ingestion follows the session for its whole lifetime.
        let ingest = Arc::clone(&shared);
        shared.pool.spawn_now(move || ingest_loop(&ingest, feed))?;
        info!(session = %shared.session, page_size = shared.cfg.page_size, "opened windowed message cache");
        Ok(Self { shared })
    }

    /// Number of filtered messages observed so far.
    #[must_use]
    pub fn size(&self) -> usize {
        *lock(&self.shared.size)
    }

    /// Blocks until `size() >= min` or `timeout` elapses. Returns whether the size was reached.
    pub fn wait_for_size(&self, min: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut size = lock(&self.shared.size);
        while *size < min {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            size = self
                .shared
                .grown
                .wait_timeout(size, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Subscribe to batched growth notifications.
    pub fn observe_growth(&self) -> Receiver<SizeChange> {
        let (tx, rx) = unbounded();
        lock(&self.shared.observers).push(tx);
        rx
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot()
    }

    /// Returns true while a prefetch is in flight.
    #[must_use]
    pub fn is_prefetching(&self) -> bool {
        lock(&self.shared.paging).slots.iter().any(|slot| slot.prefetch.is_some())
    }

    /// The message at `index`.
    ///
    /// Blocks for one page fetch if the page is not resident.
    pub fn get(&self, index: usize) -> Result<Message, CacheError> {
        let size = self.size();
        if index >= size {
            return Err(CacheError::IndexOutOfRange { index, size });
        }

        let shared = &self.shared;
        let live_hit = lock(&shared.live).get(index);
        if let Some(msg) = live_hit {
            lock(&shared.paging).last_index = Some(index);
            return Ok(msg);
        }

        let page_size = shared.cfg.page_size;
        let page = index / page_size;
        let offset = index % page_size;
        let slot_idx = page % shared.cfg.page_count;

        let epoch = {
            let mut state = lock(&shared.paging);
            let previous = state.last_index.replace(index);
            if let Some(msg) = state.slots[slot_idx].lookup(page, offset) {
                self.maybe_prefetch(&mut state, index, previous, size);
                return Ok(msg);
            }

            let slot = &mut state.slots[slot_idx];
            if let Some(cancel) = slot.prefetch.take() {
                cancel.store(true, Ordering::Release);
                shared.stats.prefetches_cancelled.fetch_add(1, Ordering::Relaxed);
            }
            slot.claim(page)
        };

        shared.stats.foreground_fetches.fetch_add(1, Ordering::Relaxed);
        debug!(session = %shared.session, index, page, "page miss, fetching");
        let fetched = fetch_page(shared.source.as_ref(), &shared.session, shared.filter.as_ref(), page, page_size, None);

        let mut state = lock(&shared.paging);
        let slot = &mut state.slots[slot_idx];
        let current = slot.epoch == epoch;
        match fetched {
            Ok(Some(messages)) => {
                let messages: Arc<[Message]> = messages.into();
                let found = messages.get(offset).cloned();
                let fetched = messages.len();
                if current {
                    slot.contents = SlotContents::Ready(messages);
                } else {
                    shared.stats.discarded_writes.fetch_add(1, Ordering::Relaxed);
                }
                found.ok_or(CacheError::ShortPage { page, index, fetched })
            }
            Ok(None) => Err(CacheError::ShortPage { page, index, fetched: 0 }),
            Err(err) => {
                if current {
                    slot.release();
                }
                warn!(session = %shared.session, page, error = %err, "page fetch failed");
                Err(err)
            }
        }
    }

    fn maybe_prefetch(&self, state: &mut PagingState, index: usize, previous: Option<usize>, size: usize) {
        let Some(previous) = previous else {
            return;
        };
        let cfg = &self.shared.cfg;
        let page = index / cfg.page_size;
        let offset = index % cfg.page_size;

        let target = if index > previous {
            let next = page + 1;
            (offset + cfg.prefetch_tolerance >= cfg.page_size && next * cfg.page_size < size).then_some(next)
        } else if index < previous {
            (offset < cfg.prefetch_tolerance && page > 0).then(|| page - 1)
        } else {
            None
        };
        let Some(target) = target else {
            return;
        };

        let slot_idx = target % cfg.page_count;
        let slot = &mut state.slots[slot_idx];
        if slot.page == Some(target) {
            return;
        }

        let stats = &self.shared.stats;
        if let Some(old) = slot.prefetch.take() {
            old.store(true, Ordering::Release);
            stats.prefetches_cancelled.fetch_add(1, Ordering::Relaxed);
        }
        let epoch = slot.claim(target);
        let cancel = Arc::new(AtomicBool::new(false));
        slot.prefetch = Some(Arc::clone(&cancel));

        let shared = Arc::clone(&self.shared);
        let spawned = self.shared.pool.spawn(move || {
            let fetched = fetch_page(
                shared.source.as_ref(),
                &shared.session,
                shared.filter.as_ref(),
                target,
                shared.cfg.page_size,
                Some(&cancel),
            );
            complete_prefetch(&shared, slot_idx, target, epoch, &cancel, fetched);
        });

        match spawned {
            Ok(_) => {
                stats.prefetches_started.fetch_add(1, Ordering::Relaxed);
                debug!(session = %self.shared.session, page = target, "prefetching page");
            }
            Err(err) => {
                slot.release();
                debug!(session = %self.shared.session, page = target, error = %err, "prefetch not scheduled");
            }
        }
    }
}

impl Drop for WindowedMessageCache {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        let mut state = lock(&self.shared.paging);
        for slot in &mut state.slots {
            if let Some(cancel) = slot.prefetch.take() {
                cancel.store(true, Ordering::Release);
            }
        }
    }
}

fn complete_prefetch(
    shared: &CacheShared,
    slot_idx: usize,
    page: usize,
    epoch: u64,
    cancel: &AtomicBool,
    fetched: Result<Option<Vec<Message>>, CacheError>,
) {
    let mut state = lock(&shared.paging);
    let slot = &mut state.slots[slot_idx];
    if cancel.load(Ordering::Acquire) || slot.epoch != epoch {
        if matches!(fetched, Ok(Some(_))) {
            shared.stats.discarded_writes.fetch_add(1, Ordering::Relaxed);
            debug!(session = %shared.session, page, "discarded late prefetch");
        }
        return;
    }

    match fetched {
        Ok(Some(messages)) => {
            slot.contents = SlotContents::Ready(messages.into());
            slot.prefetch = None;
        }
        Ok(None) => slot.release(),
        Err(err) => {
            warn!(session = %shared.session, page, error = %err, "prefetch failed");
            slot.release();
        }
    }
}

fn ingest_loop(shared: &CacheShared, mut feed: FilteredFeed) {
    let max_batch = shared.cfg.max_update_batch;
    let max_wait = shared.cfg.max_update_wait();
    let mut batch: Vec<Message> = Vec::with_capacity(max_batch);
    let mut batch_started: Option<Instant> = None;
    let mut next_index = 0usize;

    while !shared.closed.load(Ordering::Acquire) {
        let deadline = batch_started.map_or_else(|| Instant::now() + max_wait, |started| started + max_wait);
        match feed.recv_deadline(deadline) {
            FeedRecv::Item(msg) => {
                if batch.is_empty() {
                    batch_started = Some(Instant::now());
                }
                batch.push(msg);
                if batch.len() >= max_batch {
                    flush(shared, &mut batch, &mut next_index);
                    batch_started = None;
                }
            }
            FeedRecv::Timeout => {
                flush(shared, &mut batch, &mut next_index);
                batch_started = None;
            }
            FeedRecv::Closed => {
                flush(shared, &mut batch, &mut next_index);
                break;
            }
        }
    }

    match feed.close() {
        Ok(report) => {
            if let Some(err) = report.source_error {
                warn!(session = %shared.session, error = %err, "live feed ended with a source error");
            }
        }
        Err(err) => warn!(session = %shared.session, error = %err, "live feed did not report"),
    }
    debug!(session = %shared.session, size = next_index, "stopped following session");
}

fn flush(shared: &CacheShared, batch: &mut Vec<Message>, next_index: &mut usize) {
    if batch.is_empty() {
        return;
    }
    let first_index = *next_index;
    {
        let mut live = lock(&shared.live);
        for msg in batch.drain(..) {
            *next_index = live.push(msg) + 1;
        }
    }
    let size = *next_index;
    *lock(&shared.size) = size;
    shared.grown.notify_all();

    let change = SizeChange {
        first_index,
        last_index: size - 1,
        size,
    };
    lock(&shared.observers).retain(|tx| tx.send(change).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::PoolConfig;
    use crate::error::{ExecutionError, InspectorError};
    use crate::message::{EndpointId, EventTime};
    use crate::paging::AcceptAll;
    use crate::source::InMemoryMessageSource;

    const WAIT: Duration = Duration::from_secs(5);

    fn small_cfg() -> WindowedCacheConfig {
        WindowedCacheConfig {
            page_size: 16,
            page_count: 3,
            prefetch_tolerance: 4,
            live_capacity: 16,
            max_update_batch: 32,
            max_update_wait_ms: 10,
        }
    }

    fn open(n: u64, cfg: WindowedCacheConfig) -> (Arc<InMemoryMessageSource>, WindowedMessageCache) {
        open_on(Arc::new(WorkerPool::new("paging-test", &PoolConfig::default())), n, cfg)
    }

    fn open_on(
        pool: Arc<WorkerPool>,
        n: u64,
        cfg: WindowedCacheConfig,
    ) -> (Arc<InMemoryMessageSource>, WindowedMessageCache) {
        let source = Arc::new(InMemoryMessageSource::new());
        let session = SessionId::new("paging");
        source.open_session(&session).unwrap();
        for i in 0..n {
            source
                .publish(&session, EndpointId::new("a"), EndpointId::new("b"), serde_json::json!(i), EventTime(i))
                .unwrap();
        }
        let cache = WindowedMessageCache::open(session, source.clone(), Arc::new(AcceptAll), pool, cfg).unwrap();
        assert!(cache.wait_for_size(n as usize, WAIT));
        (source, cache)
    }

    fn settle(cache: &WindowedMessageCache) {
        let deadline = Instant::now() + WAIT;
        while cache.is_prefetching() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let (_source, cache) = open(10, small_cfg());
        let err = cache.get(10).unwrap_err();
        assert_eq!(err, CacheError::IndexOutOfRange { index: 10, size: 10 });
    }

    #[test]
    fn newest_messages_come_from_the_live_ring() {
        let (_source, cache) = open(40, small_cfg());
        assert_eq!(cache.get(39).unwrap().seq, 39);
        assert_eq!(cache.get(24).unwrap().seq, 24);
        assert_eq!(cache.stats().foreground_fetches, 0);
    }

    #[test]
    fn miss_fetches_once_then_hits() {
        let (_source, cache) = open(100, small_cfg());
        assert_eq!(cache.get(20).unwrap().seq, 20);
        assert_eq!(cache.get(21).unwrap().seq, 21);
        assert_eq!(cache.get(20).unwrap().seq, 20);
        assert_eq!(cache.stats().foreground_fetches, 1);
    }

    #[test]
    fn forward_edge_prefetches_next_page() {
        let (_source, cache) = open(100, small_cfg());
        cache.get(10).unwrap();
        cache.get(13).unwrap();
        settle(&cache);
        assert_eq!(cache.stats().prefetches_started, 1);

        cache.get(17).unwrap();
        assert_eq!(cache.stats().foreground_fetches, 1);
    }

    #[test]
    fn backward_edge_prefetches_previous_page() {
        let (_source, cache) = open(100, small_cfg());
        cache.get(35).unwrap();
        cache.get(34).unwrap();
        settle(&cache);
        assert_eq!(cache.stats().prefetches_started, 1);

        cache.get(31).unwrap();
        assert_eq!(cache.stats().foreground_fetches, 1);
    }

    #[test]
    fn stale_prefetch_result_is_discarded() {
        let (_source, cache) = open(200, small_cfg());
        let state_epoch = {
            let mut state = lock(&cache.shared.paging);
            state.slots[1].claim(4)
        };
        // A page 1 fetch started under an older epoch must not land.
        complete_prefetch(
            &cache.shared,
            1,
            1,
            state_epoch - 1,
            &AtomicBool::new(false),
            Ok(Some(Vec::new())),
        );
        assert_eq!(cache.stats().discarded_writes, 1);
        let state = lock(&cache.shared.paging);
        assert_eq!(state.slots[1].page, Some(4));
        assert!(matches!(state.slots[1].contents, SlotContents::Loading));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let source: Arc<dyn MessageSource> = Arc::new(InMemoryMessageSource::new());
        let pool = Arc::new(WorkerPool::new("paging-test", &PoolConfig::default()));
        let cfg = WindowedCacheConfig {
            page_count: 2,
            ..small_cfg()
        };
        let err = WindowedMessageCache::open(SessionId::new("s"), source, Arc::new(AcceptAll), pool, cfg).unwrap_err();
        assert!(matches!(err, InspectorError::Validation(_)));
    }

    #[test]
    fn growth_is_reported_in_batches() {
        let (source, cache) = open(0, small_cfg());
        let growth = cache.observe_growth();
        let session = SessionId::new("paging");
        for i in 0..5 {
            source
                .publish(&session, EndpointId::new("a"), EndpointId::new("b"), serde_json::Value::Null, EventTime(i))
                .unwrap();
        }
        assert!(cache.wait_for_size(5, WAIT));
        let mut last = None;
        while let Ok(change) = growth.recv_timeout(Duration::from_millis(50)) {
            last = Some(change);
        }
        let last = last.unwrap();
        assert_eq!(last.size, 5);
        assert_eq!(last.last_index, 4);
    }

    fn three_worker_pool() -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            "paging-test",
            &PoolConfig {
                max_workers: 3,
                ..PoolConfig::default()
            },
        ))
    }

    #[test]
    fn busy_pool_never_blocks_a_page_miss() {
        let pool = three_worker_pool();
        let (_source, cache) = open_on(Arc::clone(&pool), 100, small_cfg());
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let blocker = pool.spawn_now(move || release_rx.recv().is_ok()).unwrap();

        assert_eq!(cache.get(20).unwrap().seq, 20);
        // Near the forward edge: the prefetch of page 2 can only queue.
        assert_eq!(cache.get(28).unwrap().seq, 28);
        assert_eq!(cache.stats().prefetches_started, 1);
        assert!(cache.is_prefetching());

        // Reading page 2 supersedes the queued prefetch and fetches it here.
        assert_eq!(cache.get(33).unwrap().seq, 33);
        let stats = cache.stats();
        assert_eq!(stats.prefetches_cancelled, 1);
        assert_eq!(stats.foreground_fetches, 2);
        assert!(!cache.is_prefetching());

        drop(release_tx);
        assert!(!blocker.join_timeout(WAIT).unwrap());
        // The superseded fetch ends without touching the slot.
        pool.spawn(|| ()).unwrap().join_timeout(WAIT).unwrap();
        assert_eq!(cache.get(34).unwrap().seq, 34);
        assert_eq!(cache.stats().foreground_fetches, 2);
        assert_eq!(cache.stats().discarded_writes, 0);
    }

    #[test]
    fn saturated_pool_fails_open() {
        let pool = three_worker_pool();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let blockers: Vec<_> = (0..3)
            .map(|_| {
                let rx = release_rx.clone();
                pool.spawn_now(move || rx.recv().is_ok()).unwrap()
            })
            .collect();

        let source = Arc::new(InMemoryMessageSource::new());
        let session = SessionId::new("s");
        source.open_session(&session).unwrap();
        let err = WindowedMessageCache::open(session, source, Arc::new(AcceptAll), Arc::clone(&pool), small_cfg())
            .unwrap_err();
        assert!(matches!(err, InspectorError::Execution(ExecutionError::Saturated { .. })));

        drop(release_tx);
        for b in blockers {
            assert!(!b.join_timeout(WAIT).unwrap());
        }
    }
}
