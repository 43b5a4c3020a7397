//! One-time-transition observable cell.
//!
//! A [`SingleChangeObservable`] starts at an initial value and moves exactly
//! once to a terminal value, when its [`Transition`] is fired. Listeners see
//! the initial value first (if they register before the transition) and the
//! terminal value exactly once.
//!
//! Ordering across threads: a listener is only published into the pending
//! chain after its initial-value call has returned. If the transition fires
//! while that call is still running, the registering thread notices on its
//! second look at the state and delivers the terminal value itself. The mutex
//! guards the state swap only; no callback runs under it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::error;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Terminal(T),
}

struct Inner<T> {
    initial: T,
    state: Mutex<State<T>>,
    changed: Condvar,
}

/// Cell that transitions once from an initial to a terminal value.
///
/// Cloning yields another handle to the same cell.
pub struct SingleChangeObservable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SingleChangeObservable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug + Clone + Send + Sync + 'static> std::fmt::Debug for SingleChangeObservable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleChangeObservable")
            .field("value", &self.get())
            .field("terminal", &self.is_terminal())
            .finish()
    }
}

/// The one-shot right to move an observable to its terminal value.
///
/// Firing consumes the transition, so a cell can only change once. Dropping it
/// unfired leaves the cell at its initial value forever.
pub struct Transition<T> {
    inner: Arc<Inner<T>>,
}

impl<T> std::fmt::Debug for Transition<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition").finish_non_exhaustive()
    }
}

fn lock<T>(inner: &Inner<T>) -> MutexGuard<'_, State<T>> {
    // The state is swapped in a single assignment, so a poisoned lock still holds a whole value.
    inner.state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn invoke<T>(listener: &Listener<T>, value: &T) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(value))) {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(panic = %reason, "observable listener panicked");
    }
}

impl<T: Clone + Send + Sync + 'static> SingleChangeObservable<T> {
    /// Create a pending cell and the transition that completes it.
    #[must_use]
    pub fn channel(initial: T) -> (Self, Transition<T>) {
        let inner = Arc::new(Inner {
            initial,
            state: Mutex::new(State::Pending(Vec::new())),
            changed: Condvar::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            Transition { inner },
        )
    }

    /// Create a cell that is already terminal.
    #[must_use]
    pub fn terminal(initial: T, terminal: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                initial,
                state: Mutex::new(State::Terminal(terminal)),
                changed: Condvar::new(),
            }),
        }
    }

    /// Current value: the terminal value once transitioned, the initial value before.
    #[must_use]
    pub fn get(&self) -> T {
        match &*lock(&self.inner) {
            State::Terminal(value) => value.clone(),
            State::Pending(_) => self.inner.initial.clone(),
        }
    }

    /// The value the cell started with.
    #[must_use]
    pub fn initial(&self) -> &T {
        &self.inner.initial
    }

    /// Returns true once the transition has happened.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(&*lock(&self.inner), State::Terminal(_))
    }

    /// Blocks until the cell is terminal or `timeout` elapses.
    ///
    /// Returns the terminal value, or `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.inner);
        loop {
            if let State::Terminal(value) = &*guard {
                return Some(value.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            guard = self
                .inner
                .changed
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Register a listener.
    ///
    /// Before the transition: called now with the initial value, then once with
    /// the terminal value. After the transition: called once with the terminal value.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);

        let already_terminal = match &*lock(&self.inner) {
            State::Terminal(value) => Some(value.clone()),
            State::Pending(_) => None,
        };
        if let Some(value) = already_terminal {
            invoke(&listener, &value);
            return;
        }

        invoke(&listener, &self.inner.initial);

        let missed = {
            let mut guard = lock(&self.inner);
            match &mut *guard {
                State::Pending(chain) => {
                    chain.push(Arc::clone(&listener));
                    None
                }
                State::Terminal(value) => Some(value.clone()),
            }
        };
        // The transition ran while the initial call was in flight.
        if let Some(value) = missed {
            invoke(&listener, &value);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Transition<T> {
    /// Move the cell to its terminal value and notify pending listeners.
    pub fn fire(self, value: T) {
        let chain = {
            let mut guard = lock(&self.inner);
            match std::mem::replace(&mut *guard, State::Terminal(value.clone())) {
                State::Pending(chain) => chain,
                State::Terminal(_) => Vec::new(),
            }
        };
        self.inner.changed.notify_all();

        for listener in &chain {
            invoke(listener, &value);
        }
    }
}
