use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::EvaluationError;
use crate::message::{EventTime, Message};
use crate::observable::{SingleChangeObservable, Transition};

use super::{EvaluationKey, RuleStatus};

struct Outcome {
    status: Transition<RuleStatus>,
    last_messages: Transition<Option<Arc<[Message]>>>,
    stop_time: Transition<Option<EventTime>>,
}

/// State of one (session, rule) evaluation.
///
/// Every cell changes once. The trailing window and stop time become terminal
/// before the status does, so an observer that sees a terminal status can
/// always read them.
pub struct EvaluationEntry {
    key: EvaluationKey,
    started_at: DateTime<Utc>,
    status: SingleChangeObservable<RuleStatus>,
    last_messages: SingleChangeObservable<Option<Arc<[Message]>>>,
    stop_time: SingleChangeObservable<Option<EventTime>>,
    error_cause: SingleChangeObservable<Option<EvaluationError>>,
    outcome: Mutex<Option<Outcome>>,
    cause: Mutex<Option<Transition<Option<EvaluationError>>>>,
}

impl std::fmt::Debug for EvaluationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationEntry")
            .field("key", &self.key)
            .field("status", &self.status.get())
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl EvaluationEntry {
    pub(crate) fn new(key: EvaluationKey) -> Self {
        let (status, status_tx) = SingleChangeObservable::channel(RuleStatus::Running);
        let (last_messages, last_messages_tx) = SingleChangeObservable::channel(None);
        let (stop_time, stop_time_tx) = SingleChangeObservable::channel(None);
        let (error_cause, cause_tx) = SingleChangeObservable::channel(None);
        Self {
            key,
            started_at: Utc::now(),
            status,
            last_messages,
            stop_time,
            error_cause,
            outcome: Mutex::new(Some(Outcome {
                status: status_tx,
                last_messages: last_messages_tx,
                stop_time: stop_time_tx,
            })),
            cause: Mutex::new(Some(cause_tx)),
        }
    }

    /// The evaluation's key.
    #[must_use]
    pub fn key(&self) -> &EvaluationKey {
        &self.key
    }

    /// When the evaluation was requested.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Status cell.
    #[must_use]
    pub fn status(&self) -> SingleChangeObservable<RuleStatus> {
        self.status.clone()
    }

    /// Trailing window cell: `None` until the evaluation ends.
    #[must_use]
    pub fn last_messages(&self) -> SingleChangeObservable<Option<Arc<[Message]>>> {
        self.last_messages.clone()
    }

    /// Stop time cell: virtual time of the last message in the trailing window.
    #[must_use]
    pub fn stop_time(&self) -> SingleChangeObservable<Option<EventTime>> {
        self.stop_time.clone()
    }

    /// Error cause cell.
    #[must_use]
    pub fn error_cause(&self) -> SingleChangeObservable<Option<EvaluationError>> {
        self.error_cause.clone()
    }

    /// Record why the evaluation failed. Only the first cause is kept; returns
    /// false if one was already recorded.
    pub(crate) fn record_error_cause(&self, cause: EvaluationError) -> bool {
        let transition = self.cause.lock().unwrap_or_else(PoisonError::into_inner).take();
        match transition {
            Some(transition) => {
                transition.fire(Some(cause));
                true
            }
            None => false,
        }
    }

    /// Publish the trailing window, then the stop time, then the status.
    /// Returns false if the outcome was already published.
    pub(crate) fn publish(&self, window: Arc<[Message]>, stop_time: Option<EventTime>, status: RuleStatus) -> bool {
        let outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(outcome) = outcome else {
            return false;
        };
        outcome.last_messages.fire(Some(window));
        outcome.stop_time.fire(stop_time);
        outcome.status.fire(status);
        true
    }

    /// Record `cause` and publish a failure with an empty window.
    pub(crate) fn fail(&self, cause: EvaluationError) {
        self.record_error_cause(cause);
        self.publish(Arc::from(Vec::new()), None, RuleStatus::Failure);
    }
}
