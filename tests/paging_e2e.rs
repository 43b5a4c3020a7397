use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use timeline_inspector::{
    AcceptAll, CacheError, EndpointId, EventTime, InMemoryMessageSource, Message, MessageFilter, MessageSource,
    MessageStream, PoolConfig, SeqRange, SessionId, SourceError, WindowedCacheConfig, WindowedMessageCache,
    WorkerPool,
};

const WAIT: Duration = Duration::from_secs(10);

fn populated(session: &SessionId, count: u64) -> Arc<InMemoryMessageSource> {
    let source = Arc::new(InMemoryMessageSource::new());
    source.open_session(session).unwrap();
    for seq in 0..count {
        let from = if seq % 3 == 0 { "sensor" } else { "controller" };
        source
            .publish(session, EndpointId::new(from), EndpointId::new("bus"), serde_json::json!(seq), EventTime(seq))
            .unwrap();
    }
    source
}

fn open(
    source: &Arc<InMemoryMessageSource>,
    session: &SessionId,
    filter: Arc<dyn MessageFilter>,
    cfg: WindowedCacheConfig,
    expected: usize,
) -> WindowedMessageCache {
    let pool = Arc::new(WorkerPool::new("paging-e2e", &PoolConfig::default()));
    let cache = WindowedMessageCache::open(session.clone(), source.clone(), filter, pool, cfg).unwrap();
    assert!(cache.wait_for_size(expected, WAIT), "cache never reached {expected} messages");
    cache
}

/// Holds back the next replay until its gate opens.
struct GatedSource {
    inner: Arc<InMemoryMessageSource>,
    hold: Mutex<Option<(Receiver<()>, Sender<()>)>>,
}

impl GatedSource {
    /// Gate the next replay. Returns the gate opener and a receiver that fires
    /// when the gated stream is released.
    fn arm(&self) -> (Sender<()>, Receiver<()>) {
        let (open_tx, open_rx) = bounded(1);
        let (released_tx, released_rx) = bounded(1);
        *self.hold.lock().unwrap() = Some((open_rx, released_tx));
        (open_tx, released_rx)
    }

    fn is_armed(&self) -> bool {
        self.hold.lock().unwrap().is_some()
    }
}

impl MessageSource for GatedSource {
    fn replay(&self, session: &SessionId, range: SeqRange) -> Result<MessageStream, SourceError> {
        let stream = self.inner.replay(session, range)?;
        let Some((open_rx, released_tx)) = self.hold.lock().unwrap().take() else {
            return Ok(stream);
        };
        let (tx, rx) = unbounded();
        thread::spawn(move || {
            let _ = open_rx.recv();
            for item in stream {
                if tx.send(item).is_err() {
                    break;
                }
            }
        });
        Ok(MessageStream::with_release(rx, move || {
            let _ = released_tx.send(());
        }))
    }

    fn live(&self, session: &SessionId, range: SeqRange) -> Result<MessageStream, SourceError> {
        self.inner.live(session, range)
    }

    fn replay_then_live(&self, session: &SessionId) -> Result<MessageStream, SourceError> {
        self.inner.replay_then_live(session)
    }

    fn count(&self, session: &SessionId) -> Result<u64, SourceError> {
        self.inner.count(session)
    }
}

fn settle(cache: &WindowedMessageCache) {
    let deadline = Instant::now() + WAIT;
    while cache.is_prefetching() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
}

fn small_pages() -> WindowedCacheConfig {
    WindowedCacheConfig {
        page_size: 64,
        page_count: 3,
        prefetch_tolerance: 16,
        live_capacity: 64,
        max_update_batch: 128,
        max_update_wait_ms: 10,
    }
}

#[test]
fn far_jump_fetches_exactly_one_page() {
    let session = SessionId::new("jump");
    let source = populated(&session, 5000);
    let cache = open(&source, &session, Arc::new(AcceptAll), WindowedCacheConfig::default(), 5000);

    assert_eq!(cache.get(2100).unwrap().seq, 2100);
    assert_eq!(cache.stats().foreground_fetches, 1);

    assert_eq!(cache.get(2101).unwrap().seq, 2101);
    assert_eq!(cache.stats().foreground_fetches, 1);
}

#[test]
fn repeated_reads_return_identical_messages() {
    let session = SessionId::new("repeat");
    let source = populated(&session, 600);
    let cache = open(&source, &session, Arc::new(AcceptAll), small_pages(), 600);

    for index in [0, 63, 64, 300, 599, 5, 300] {
        let first = cache.get(index).unwrap();
        let second = cache.get(index).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.seq, index as u64);
    }
}

#[test]
fn ascending_scan_fetches_in_the_foreground_only_once() {
    let session = SessionId::new("ascending");
    let source = populated(&session, 640);
    let cache = open(&source, &session, Arc::new(AcceptAll), small_pages(), 640);

    for index in 0..640 {
        assert_eq!(cache.get(index).unwrap().seq, index as u64);
        settle(&cache);
    }
    let stats = cache.stats();
    assert_eq!(stats.foreground_fetches, 1);
    assert!(stats.prefetches_started >= 8);
}

#[test]
fn descending_scan_fetches_in_the_foreground_only_once() {
    let session = SessionId::new("descending");
    let source = populated(&session, 640);
    let cache = open(&source, &session, Arc::new(AcceptAll), small_pages(), 640);

    for index in (0..575).rev() {
        assert_eq!(cache.get(index).unwrap().seq, index as u64);
        settle(&cache);
    }
    assert_eq!(cache.stats().foreground_fetches, 1);
}

#[test]
fn filter_defines_the_index_space() {
    let session = SessionId::new("filtered");
    let source = populated(&session, 900);
    let sensors: Arc<dyn MessageFilter> = Arc::new(|m: &Message| m.source.as_str() == "sensor");
    let cache = open(&source, &session, sensors, small_pages(), 300);

    assert_eq!(cache.size(), 300);
    for index in [0usize, 1, 100, 299] {
        let msg = cache.get(index).unwrap();
        assert_eq!(msg.seq, index as u64 * 3);
        assert_eq!(msg.source.as_str(), "sensor");
    }
}

#[test]
fn fetch_failure_reaches_the_caller() {
    let session = SessionId::new("broken");
    let source = populated(&session, 500);
    let cache = open(&source, &session, Arc::new(AcceptAll), small_pages(), 500);

    source.fail_session(&session, "archive offline").unwrap();
    let err = cache.get(10).unwrap_err();
    assert!(matches!(err, CacheError::Fetch { page: 0, .. }));

    // The slot was released, so a later read retries.
    source.recover_session(&session).unwrap();
    assert_eq!(cache.get(10).unwrap().seq, 10);
}

#[test]
fn live_growth_is_batched_and_served_from_the_ring() {
    let session = SessionId::new("growing");
    let source = populated(&session, 10);
    let cache = open(&source, &session, Arc::new(AcceptAll), small_pages(), 10);
    let growth = cache.observe_growth();

    for seq in 10..400u64 {
        source
            .publish(&session, EndpointId::new("sensor"), EndpointId::new("bus"), serde_json::Value::Null, EventTime(seq))
            .unwrap();
    }
    assert!(cache.wait_for_size(400, WAIT));

    let mut changes = Vec::new();
    while let Ok(change) = growth.recv_timeout(Duration::from_millis(100)) {
        changes.push(change);
    }
    assert!(!changes.is_empty());
    assert!(changes.len() < 390, "growth was not batched");
    assert!(changes.iter().all(|c| c.last_index + 1 - c.first_index <= 128));
    assert_eq!(changes.last().map(|c| c.size), Some(400));
    for pair in changes.windows(2) {
        assert_eq!(pair[1].first_index, pair[0].last_index + 1);
    }

    assert_eq!(cache.get(399).unwrap().seq, 399);
    assert_eq!(cache.stats().foreground_fetches, 0);
}

#[test]
fn page_miss_cancels_the_prefetch_for_its_slot() {
    let session = SessionId::new("superseded");
    let source = Arc::new(GatedSource {
        inner: populated(&session, 640),
        hold: Mutex::new(None),
    });
    let pool = Arc::new(WorkerPool::new("paging-e2e", &PoolConfig::default()));
    let cache =
        WindowedMessageCache::open(session.clone(), source.clone(), Arc::new(AcceptAll), pool, small_pages()).unwrap();
    assert!(cache.wait_for_size(640, WAIT));

    assert_eq!(cache.get(10).unwrap().seq, 10);

    // Near the end of page 0: page 1 is prefetched into slot 1 and held at the gate.
    let (open_gate, released) = source.arm();
    assert_eq!(cache.get(50).unwrap().seq, 50);
    assert_eq!(cache.stats().prefetches_started, 1);
    let deadline = Instant::now() + WAIT;
    while source.is_armed() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!source.is_armed(), "prefetch never reached the source");

    // Page 4 also maps to slot 1.
    assert_eq!(cache.get(4 * 64 + 5).unwrap().seq, 261);
    let stats = cache.stats();
    assert_eq!(stats.prefetches_cancelled, 1);
    assert_eq!(stats.foreground_fetches, 2);

    open_gate.send(()).unwrap();
    assert!(released.recv_timeout(WAIT).is_ok(), "cancelled fetch kept its subscription");
    thread::sleep(Duration::from_millis(20));

    // The slot still holds the foreground page.
    assert_eq!(cache.get(262).unwrap().seq, 262);
    let stats = cache.stats();
    assert_eq!(stats.foreground_fetches, 2);
    assert_eq!(stats.discarded_writes, 0);
}

#[test]
fn page_misses_are_served_while_the_pool_is_saturated() {
    let session = SessionId::new("saturated");
    let source = populated(&session, 640);
    let pool = Arc::new(WorkerPool::new(
        "paging-e2e",
        &PoolConfig {
            max_workers: 3,
            ..PoolConfig::default()
        },
    ));
    let cache = WindowedMessageCache::open(session, source, Arc::new(AcceptAll), Arc::clone(&pool), small_pages())
        .unwrap();
    assert!(cache.wait_for_size(640, WAIT));

    let (release_tx, release_rx) = bounded::<()>(0);
    let blocker = pool.spawn_now(move || release_rx.recv().is_ok()).unwrap();
    assert_eq!(pool.live_workers(), 3);

    for index in [5usize, 300, 130, 0] {
        assert_eq!(cache.get(index).unwrap().seq, index as u64);
    }

    drop(release_tx);
    assert!(!blocker.join_timeout(WAIT).unwrap());
}
