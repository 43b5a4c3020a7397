//! Virtual-time scopes.
//!
//! A [`VirtualTimeScope`] takes one message stream and fans it out to a fixed
//! set of [`Lane`]s that advance in lockstep. Each message is handed over a
//! rendezvous channel to lane 0, then lane 1, and so on; the next message is
//! only admitted once every open lane has taken the current one. Consumers
//! therefore observe the same messages in the same order regardless of how
//! slow each of them is, and the virtual clock is driven by event timestamps,
//! never by wall-clock arrival.
//!
//! Lane 0 is the primary lane: when its consumer drops it, the scope stops
//! admitting input. A follower that drops its lane is simply skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{ExecutionError, SourceError};
use crate::message::{EventTime, Message};
use crate::runtime::{JobHandle, WorkerPool};
use crate::source::MessageStream;

/// A value paired with the virtual time at which it was admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    /// Virtual admission time.
    pub time: EventTime,
    /// The value.
    pub value: T,
}

/// Pairs a message with its event timestamp.
#[must_use]
pub fn attach_timestamp(msg: Message) -> Stamped<Message> {
    Stamped {
        time: msg.timestamp,
        value: msg,
    }
}

/// Monotone virtual clock shared by the lanes of one scope.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock(Arc<AtomicU64>);

impl VirtualClock {
    /// A clock at [`EventTime::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> EventTime {
        EventTime(self.0.load(Ordering::Acquire))
    }

    /// Advance to `time`. Never moves backwards; returns the resulting time.
    pub fn advance_to(&self, time: EventTime) -> EventTime {
        let prev = self.0.fetch_max(time.ticks(), Ordering::AcqRel);
        EventTime(prev.max(time.ticks()))
    }
}

/// Outcome of a deadline-bounded lane receive.
#[derive(Debug, Clone, PartialEq)]
pub enum LaneRecv {
    /// The next admitted message.
    Item(Stamped<Message>),
    /// Nothing was admitted before the deadline.
    Timeout,
    /// The scope has stopped admitting messages to this lane.
    Closed,
}

/// One consumer's view of a scope.
#[derive(Debug)]
pub struct Lane {
    index: usize,
    rx: Receiver<Stamped<Message>>,
    received: u64,
    clock: VirtualClock,
}

impl Lane {
    /// Position of this lane in the hand-off order. Lane 0 is primary.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Messages taken from this lane so far.
    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }

    /// Virtual time of the scope.
    #[must_use]
    pub fn now(&self) -> EventTime {
        self.clock.now()
    }

    /// Take the next message (blocking). `None` once the lane is closed.
    pub fn recv(&mut self) -> Option<Stamped<Message>> {
        let item = self.rx.recv().ok()?;
        self.received += 1;
        Some(item)
    }

    /// Take the next message, giving up at `deadline`.
    pub fn recv_deadline(&mut self, deadline: Instant) -> LaneRecv {
        match self.rx.recv_deadline(deadline) {
            Ok(item) => {
                self.received += 1;
                LaneRecv::Item(item)
            }
            Err(RecvTimeoutError::Timeout) => LaneRecv::Timeout,
            Err(RecvTimeoutError::Disconnected) => LaneRecv::Closed,
        }
    }
}

impl Iterator for Lane {
    type Item = Stamped<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

/// What a scope admitted during its lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeReport {
    /// Messages handed to each lane, by lane index.
    pub admitted: Vec<u64>,
    /// Virtual time of the last admitted message.
    pub last_time: Option<EventTime>,
    /// Error that ended the input stream, if any.
    pub source_error: Option<SourceError>,
}

impl ScopeReport {
    /// Returns true if every lane was handed the same number of messages.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.admitted.windows(2).all(|w| w[0] == w[1])
    }
}

/// A running virtual-time scope.
///
/// Dropping the scope stops admission without waiting. [`Self::exit`] stops
/// admission and waits for the pump to finish; lanes still held by a consumer
/// that never reads them would keep it waiting.
#[derive(Debug)]
pub struct VirtualTimeScope {
    cancel_tx: Option<Sender<()>>,
    pump: Option<JobHandle<ScopeReport>>,
    clock: VirtualClock,
}

impl VirtualTimeScope {
    /// Enter virtual time on `stream` with `lanes` consumers (at least one).
    ///
    /// The pump runs as one job on `pool` and owns the stream; it is dropped,
    /// releasing its upstream subscription, when the scope ends. Lane consumers
    /// wait on the pump, so it is started with [`WorkerPool::spawn_now`] and
    /// entering fails rather than queueing it when the pool is saturated.
    pub fn enter(stream: MessageStream, lanes: usize, pool: &WorkerPool) -> Result<(Self, Vec<Lane>), ExecutionError> {
        let lanes = lanes.max(1);
        let clock = VirtualClock::new();
        let (cancel_tx, cancel_rx) = bounded::<()>(0);

        let mut senders = Vec::with_capacity(lanes);
        let mut receivers = Vec::with_capacity(lanes);
        for index in 0..lanes {
            let (tx, rx) = bounded::<Stamped<Message>>(0);
            senders.push(tx);
            receivers.push(Lane {
                index,
                rx,
                received: 0,
                clock: clock.clone(),
            });
        }

        let pump_clock = clock.clone();
        let pump = pool.spawn_now(move || run_pump(&stream, senders, &cancel_rx, &pump_clock))?;

        Ok((
            Self {
                cancel_tx: Some(cancel_tx),
                pump: Some(pump),
                clock,
            },
            receivers,
        ))
    }

    /// The scope's virtual clock.
    #[must_use]
    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    /// Stop admission and wait for the pump's report.
    pub fn exit(mut self) -> Result<ScopeReport, ExecutionError> {
        self.cancel_tx.take();
        match self.pump.take() {
            Some(pump) => pump.join(),
            None => Ok(ScopeReport::default()),
        }
    }
}

impl Drop for VirtualTimeScope {
    fn drop(&mut self) {
        self.cancel_tx.take();
    }
}

fn run_pump(
    stream: &MessageStream,
    senders: Vec<Sender<Stamped<Message>>>,
    cancel_rx: &Receiver<()>,
    clock: &VirtualClock,
) -> ScopeReport {
    let mut lanes: Vec<Option<Sender<Stamped<Message>>>> = senders.into_iter().map(Some).collect();
    let mut report = ScopeReport {
        admitted: vec![0; lanes.len()],
        ..ScopeReport::default()
    };

    loop {
        let next = select! {
            recv(stream.receiver()) -> item => item.ok(),
            recv(cancel_rx) -> _ => None,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(error = %err, "message stream failed, closing virtual-time scope");
                report.source_error = Some(err);
                break;
            }
            None => break,
        };

        let stamped = attach_timestamp(msg);
        let time = clock.advance_to(stamped.time);
        if time != stamped.time {
            debug!(seq = stamped.value.seq, event_time = %stamped.time, virtual_time = %time, "clamped out-of-order timestamp");
        }
        let stamped = Stamped { time, ..stamped };
        report.last_time = Some(time);

        for (index, slot) in lanes.iter_mut().enumerate() {
            let Some(tx) = slot else {
                continue;
            };
            if tx.send(stamped.clone()).is_ok() {
                report.admitted[index] += 1;
            } else {
                *slot = None;
                if index == 0 {
                    // Followers never see a message the primary did not take.
                    return report;
                }
            }
        }
    }

    report
}
