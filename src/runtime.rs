//! Shared worker pool.
//!
//! Rule evaluations run for the lifetime of a session, so a fixed-size pool
//! would let a handful of live sessions starve every later request. This pool
//! is elastic: a submission either goes to an idle worker or starts a new one,
//! up to `max_workers`. Idle workers exit after `keep_alive`.
//!
//! Two submission modes exist. [`WorkerPool::spawn`] queues the job when every
//! worker is busy, which suits short jobs. [`WorkerPool::spawn_now`] starts the
//! job on a thread of its own or fails with [`ExecutionError::Saturated`]; a job
//! that other jobs wait on must never sit in the queue behind them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::error::ExecutionError;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Run(Job),
    /// Ask one idle worker to exit, freeing its slot.
    Retire,
}

#[derive(Debug, Default)]
struct Counters {
    /// Workers alive, including slots reserved for threads being started.
    live: usize,
    /// Workers blocked waiting for a task.
    idle: usize,
    /// Retire tasks sent and not yet taken.
    retiring: usize,
}

struct PoolShared {
    name: String,
    rx: Receiver<Task>,
    keep_alive: Duration,
    max_workers: usize,
    counters: Mutex<Counters>,
    spawned: AtomicUsize,
}

impl PoolShared {
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Elastic pool of named worker threads fed by a bounded job queue.
///
/// Dropping the pool closes the queue: workers finish the job they are running,
/// drain what is queued, then exit.
pub struct WorkerPool {
    tx: Sender<Task>,
    shared: Arc<PoolShared>,
    queue_capacity: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("live", &self.live_workers())
            .field("idle", &self.idle_workers())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool. No thread is started until the first job arrives.
    pub fn new(name: impl Into<String>, cfg: &PoolConfig) -> Self {
        let queue_capacity = cfg.queue_capacity.max(1);
        let (tx, rx) = bounded::<Task>(queue_capacity);
        Self {
            tx,
            shared: Arc::new(PoolShared {
                name: name.into(),
                rx,
                keep_alive: cfg.keep_alive(),
                max_workers: cfg.max_workers.max(1),
                counters: Mutex::new(Counters::default()),
                spawned: AtomicUsize::new(0),
            }),
            queue_capacity,
        }
    }

    /// The pool name, used as thread-name prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Upper bound on live workers.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    /// Workers currently alive.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.counters().live
    }

    /// Workers currently waiting for work.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.shared.counters().idle
    }

    /// Submit a job and obtain a handle to its result.
    ///
    /// When every worker is busy and the pool is at `max_workers`, the job is
    /// queued until a worker frees up.
    pub fn spawn<F, T>(&self, f: F) -> Result<JobHandle<T>, ExecutionError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = self.package(f);

        let fresh = {
            let mut counters = self.shared.counters();
            if counters.idle > counters.retiring {
                false
            } else if counters.live < self.shared.max_workers {
                counters.live += 1;
                true
            } else {
                warn!(
                    pool = %self.shared.name,
                    max_workers = self.shared.max_workers,
                    "worker pool saturated, job queued until a worker frees up"
                );
                false
            }
        };

        if fresh {
            self.start_worker(job)?;
        } else {
            self.enqueue(Task::Run(job))?;
        }
        Ok(handle)
    }

    /// Submit a job that must start running immediately.
    ///
    /// The job gets a freshly started worker. At `max_workers` an idle worker
    /// is retired to make room; with no idle worker the submission fails with
    /// [`ExecutionError::Saturated`] instead of queueing.
    pub fn spawn_now<F, T>(&self, f: F) -> Result<JobHandle<T>, ExecutionError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = self.package(f);

        let traded = {
            let mut counters = self.shared.counters();
            if counters.live < self.shared.max_workers {
                counters.live += 1;
                false
            } else if counters.idle > counters.retiring {
                counters.live += 1;
                counters.retiring += 1;
                true
            } else {
                return Err(ExecutionError::Saturated {
                    pool: self.shared.name.clone(),
                    max_workers: self.shared.max_workers,
                });
            }
        };

        if traded {
            if let Err(err) = self.enqueue(Task::Retire) {
                let mut counters = self.shared.counters();
                counters.live -= 1;
                counters.retiring -= 1;
                return Err(err);
            }
            debug!(pool = %self.shared.name, "retiring an idle worker for an immediate job");
        }
        self.start_worker(job)?;
        Ok(handle)
    }

    fn package<F, T>(&self, f: F) -> (Job, JobHandle<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded::<T>(1);
        let pool_name = self.shared.name.clone();
        let job: Job = Box::new(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                // The handle may have been dropped; the result is then unwanted.
                let _ = reply_tx.send(value);
            }
            Err(payload) => {
                error!(pool = %pool_name, panic = %panic_message(payload.as_ref()), "job panicked");
            }
        });
        let handle = JobHandle {
            pool: self.shared.name.clone(),
            rx: reply_rx,
        };
        (job, handle)
    }

    fn enqueue(&self, task: Task) -> Result<(), ExecutionError> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                pool: self.shared.name.clone(),
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected {
                pool: self.shared.name.clone(),
            }),
        }
    }

    /// Start a worker on a slot already counted in `live`; it runs `first` before
    /// serving the queue.
    fn start_worker(&self, first: Job) -> Result<(), ExecutionError> {
        let shared = &self.shared;
        let idx = shared.spawned.fetch_add(1, Ordering::Relaxed);
        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-{idx}", shared.name))
            .spawn(move || {
                first();
                worker_loop(&worker_shared);
            });

        if let Err(e) = spawned {
            shared.counters().live -= 1;
            return Err(ExecutionError::SpawnFailed {
                pool: shared.name.clone(),
                reason: e.to_string(),
            });
        }
        debug!(pool = %shared.name, worker = idx, "started worker");
        Ok(())
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        shared.counters().idle += 1;
        let task = shared.rx.recv_timeout(shared.keep_alive);

        let mut counters = shared.counters();
        counters.idle -= 1;
        match task {
            Ok(Task::Run(job)) => {
                drop(counters);
                job();
            }
            Ok(Task::Retire) => {
                counters.retiring = counters.retiring.saturating_sub(1);
                break;
            }
            // Stay if every idle worker is needed to take a pending retire task.
            Err(RecvTimeoutError::Timeout) if counters.idle < counters.retiring => {}
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.counters().live -= 1;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle returned by [`WorkerPool::spawn`] and [`WorkerPool::spawn_now`].
#[derive(Debug)]
pub struct JobHandle<T> {
    pool: String,
    rx: Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Waits for the job to complete.
    pub fn join(self) -> Result<T, ExecutionError> {
        self.rx.recv().map_err(|_| ExecutionError::Panicked { pool: self.pool })
    }

    /// Waits for the job to complete with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, ExecutionError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => ExecutionError::Panicked { pool: self.pool },
        })
    }
}
