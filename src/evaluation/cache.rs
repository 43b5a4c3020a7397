//! Memoized rule evaluation.
//!
//! The first request for a (session, rule) pair creates its entry and starts
//! one evaluation job; every later request returns the same entry. An
//! evaluation subscribes to the session's replay-then-live stream, enters a
//! two-lane virtual-time scope (lane 0 drives the rule, lane 1 tracks the
//! trailing window), and publishes the outcome when the rule terminates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{EvaluationConfig, PoolConfig};
use crate::error::{EvaluationError, ExecutionError, ValidationError};
use crate::message::{EventTime, Message, SessionId};
use crate::observable::SingleChangeObservable;
use crate::runtime::WorkerPool;
use crate::source::MessageSource;
use crate::virtual_time::{ScopeReport, VirtualTimeScope};

use super::entry::EvaluationEntry;
use super::rule::{drive, Rule, RuleInput, Termination};
use super::window::{track, TrailingWindow};
use super::{EvaluationKey, RuleStatus};

/// One line of [`RuleEvaluationCache::evaluations`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationSummary {
    /// The evaluated pair.
    pub key: EvaluationKey,
    /// Status at the time of the snapshot.
    pub status: RuleStatus,
    /// When the evaluation was first requested.
    pub started_at: DateTime<Utc>,
}

/// Per-(session, rule) memoized evaluations.
///
/// Entries live as long as the cache. Accessors never block on an evaluation.
pub struct RuleEvaluationCache {
    source: Arc<dyn MessageSource>,
    pool: Arc<WorkerPool>,
    cfg: EvaluationConfig,
    entries: RwLock<HashMap<EvaluationKey, Arc<EvaluationEntry>>>,
}

impl std::fmt::Debug for RuleEvaluationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEvaluationCache")
            .field("entries", &self.len())
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl RuleEvaluationCache {
    /// Creates an empty cache evaluating rules on `pool`.
    pub fn new(
        source: Arc<dyn MessageSource>,
        pool: Arc<WorkerPool>,
        cfg: EvaluationConfig,
    ) -> Result<Self, ValidationError> {
        cfg.validate()?;
        if pool.max_workers() < PoolConfig::MIN_WORKERS {
            return Err(ValidationError::PoolTooSmall {
                min: PoolConfig::MIN_WORKERS,
                actual: pool.max_workers(),
            });
        }
        Ok(Self {
            source,
            pool,
            cfg,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Status of `rule` on `session`, starting the evaluation on first request.
    pub fn status(&self, session: &SessionId, rule: &Arc<dyn Rule>) -> SingleChangeObservable<RuleStatus> {
        self.entry(session, rule).status()
    }

    /// The trailing window up to the rule's termination.
    pub fn last_messages(
        &self,
        session: &SessionId,
        rule: &Arc<dyn Rule>,
    ) -> SingleChangeObservable<Option<Arc<[Message]>>> {
        self.entry(session, rule).last_messages()
    }

    /// Why the evaluation failed, if it did.
    pub fn error_cause(&self, session: &SessionId, rule: &Arc<dyn Rule>) -> SingleChangeObservable<Option<EvaluationError>> {
        self.entry(session, rule).error_cause()
    }

    /// Virtual time of the last message in the trailing window.
    pub fn stop_time(&self, session: &SessionId, rule: &Arc<dyn Rule>) -> SingleChangeObservable<Option<EventTime>> {
        self.entry(session, rule).stop_time()
    }

    /// Snapshot of every known evaluation, oldest first.
    pub fn evaluations(&self) -> Vec<EvaluationSummary> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<EvaluationSummary> = entries
            .values()
            .map(|entry| EvaluationSummary {
                key: entry.key().clone(),
                status: entry.status().get(),
                started_at: entry.started_at(),
            })
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.to_string().cmp(&b.key.to_string())));
        out
    }

    /// Number of known evaluations.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing has been requested yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, session: &SessionId, rule: &Arc<dyn Rule>) -> Arc<EvaluationEntry> {
        let key = EvaluationKey::new(session.clone(), rule.id());
        if let Some(entry) = self.entries.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return Arc::clone(entry);
        }

        let (entry, unscheduled) = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(&key) {
                return Arc::clone(entry);
            }
            let entry = Arc::new(EvaluationEntry::new(key.clone()));
            entries.insert(key.clone(), Arc::clone(&entry));
            // Starting the job under the write lock keeps it to one per key.
            let unscheduled = self.start(&entry, rule).err();
            (entry, unscheduled)
        };

        if let Some(err) = unscheduled {
            warn!(session = %key.session, rule = %key.rule, error = %err, "could not schedule rule evaluation");
            entry.fail(EvaluationError::Unscheduled {
                session: key.session,
                rule: key.rule,
                source: err,
            });
        }
        entry
    }

    fn start(&self, entry: &Arc<EvaluationEntry>, rule: &Arc<dyn Rule>) -> Result<(), ExecutionError> {
        let job = Evaluation {
            source: Arc::clone(&self.source),
            pool: Arc::clone(&self.pool),
            window: self.cfg.trailing_window,
            entry: Arc::clone(entry),
            rule: Arc::clone(rule),
        };
        debug!(session = %entry.key().session, rule = %entry.key().rule, "starting rule evaluation");
        // Completion is observed through the entry's cells. The job lives as
        // long as the session, so it must not wait in the queue.
        self.pool.spawn_now(move || job.run()).map(drop)
    }
}

struct Evaluation {
    source: Arc<dyn MessageSource>,
    pool: Arc<WorkerPool>,
    window: usize,
    entry: Arc<EvaluationEntry>,
    rule: Arc<dyn Rule>,
}

impl Evaluation {
    fn run(self) {
        let key = self.entry.key().clone();

        let stream = match self.source.replay_then_live(&key.session) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(session = %key.session, rule = %key.rule, error = %err, "could not subscribe to session");
                self.entry.fail(EvaluationError::Source {
                    session: key.session,
                    rule: key.rule,
                    source: err,
                });
                return;
            }
        };

        let (scope, lanes) = match VirtualTimeScope::enter(stream, 2, &self.pool) {
            Ok(entered) => entered,
            Err(err) => return self.unscheduled(err),
        };
        let mut lanes = lanes.into_iter();
        let (Some(rule_lane), Some(window_lane)) = (lanes.next(), lanes.next()) else {
            return self.unscheduled(ExecutionError::Disconnected {
                pool: self.pool.name().to_string(),
            });
        };

        let capacity = self.window;
        let tracker = match self.pool.spawn_now(move || track(window_lane, capacity)) {
            Ok(tracker) => tracker,
            Err(err) => return self.unscheduled(err),
        };

        let consumed = Arc::new(AtomicU64::new(0));
        let termination = drive(self.rule.as_ref(), RuleInput::new(rule_lane, Arc::clone(&consumed)));

        let report = scope.exit().unwrap_or_else(|err| {
            warn!(session = %key.session, rule = %key.rule, error = %err, "virtual-time pump did not report");
            ScopeReport::default()
        });
        let window = tracker.join().unwrap_or_else(|err| {
            warn!(session = %key.session, rule = %key.rule, error = %err, "trailing window tracker did not report");
            TrailingWindow::new(capacity)
        });

        let consumed = consumed.load(Ordering::Acquire);
        if coordination_drift(consumed, window.seen(), &report) {
            warn!(
                session = %key.session,
                rule = %key.rule,
                rule_messages = consumed,
                window_messages = window.seen(),
                admitted = ?report.admitted,
                "coordination drift between rule and trailing window"
            );
        }

        let status = match termination {
            Termination::Completed { emitted } => match report.source_error {
                // The input ended because the source broke, not because the session ended.
                Some(err) => {
                    self.entry.record_error_cause(EvaluationError::Source {
                        session: key.session.clone(),
                        rule: key.rule.clone(),
                        source: err,
                    });
                    RuleStatus::Failure
                }
                None => {
                    debug!(session = %key.session, rule = %key.rule, emitted, "rule output completed");
                    RuleStatus::Success
                }
            },
            Termination::Failed(failure) => {
                self.entry.record_error_cause(EvaluationError::RuleFailed {
                    session: key.session.clone(),
                    rule: key.rule.clone(),
                    reason: failure.reason().to_string(),
                });
                RuleStatus::Failure
            }
            Termination::Violated(detail) => {
                error!(session = %key.session, rule = %key.rule, detail = %detail, "rule violated the termination contract");
                self.entry.record_error_cause(EvaluationError::ContractViolation {
                    session: key.session.clone(),
                    rule: key.rule.clone(),
                    detail,
                });
                RuleStatus::Failure
            }
        };

        let stop_time = window.last_time();
        self.entry.publish(window.into_shared(), stop_time, status);
        info!(
            session = %key.session,
            rule = %key.rule,
            status = %status,
            messages = consumed,
            "rule evaluation finished"
        );
    }

    fn unscheduled(&self, err: ExecutionError) {
        let key = self.entry.key();
        warn!(session = %key.session, rule = %key.rule, error = %err, "could not schedule rule evaluation");
        self.entry.fail(EvaluationError::Unscheduled {
            session: key.session.clone(),
            rule: key.rule.clone(),
            source: err,
        });
    }
}

/// Returns true if the rule and the trailing window saw different traffic in
/// one scope.
fn coordination_drift(rule_messages: u64, window_messages: u64, report: &ScopeReport) -> bool {
    rule_messages != window_messages || !report.is_balanced()
}
