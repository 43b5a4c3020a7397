use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::message::{EventTime, Message, RuleId};
use crate::virtual_time::Lane;

/// A failure reported by a rule through its output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct RuleFailure {
    reason: String,
}

impl RuleFailure {
    /// Creates a failure with a human-readable reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    /// The reported reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// What a rule produces. Only how it ends matters: running out means
/// success, the first `Err` means failure. Emitted messages are ignored.
pub type RuleOutput = Box<dyn Iterator<Item = Result<Message, RuleFailure>> + Send>;

/// Box an iterator as a [`RuleOutput`].
pub fn rule_output<I>(iter: I) -> RuleOutput
where
    I: Iterator<Item = Result<Message, RuleFailure>> + Send + 'static,
{
    Box::new(iter)
}

/// A monitoring rule: a transform over a session's message sequence.
pub trait Rule: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Cache identity.
    ///
    /// Evaluations are memoized per (session, id), so two rules that behave
    /// differently must never report the same id.
    fn id(&self) -> RuleId;

    /// Attach the rule to its input.
    ///
    /// Called once per evaluation. The returned iterator is drained on a
    /// worker thread; it may block on `input` for as long as the session lives.
    fn apply(&self, input: RuleInput) -> RuleOutput;
}

/// Adapts a closure into a [`Rule`].
pub struct FnRule<F> {
    id: RuleId,
    name: String,
    f: F,
}

impl<F> FnRule<F>
where
    F: Fn(RuleInput) -> RuleOutput + Send + Sync,
{
    /// Creates a rule identified by its name.
    ///
    /// The name is the cache identity: give every distinct closure its own
    /// name, or use [`Self::with_id`].
    pub fn new(name: impl Into<String>, f: F) -> Self {
        let name = name.into();
        Self {
            id: RuleId::new(name.as_str()),
            name,
            f,
        }
    }

    /// Creates a rule whose cache identity differs from its display name.
    pub fn with_id(id: RuleId, name: impl Into<String>, f: F) -> Self {
        Self {
            id,
            name: name.into(),
            f,
        }
    }
}

impl<F> std::fmt::Debug for FnRule<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<F> Rule for FnRule<F>
where
    F: Fn(RuleInput) -> RuleOutput + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> RuleId {
        self.id.clone()
    }

    fn apply(&self, input: RuleInput) -> RuleOutput {
        (self.f)(input)
    }
}

/// The message sequence a rule consumes.
///
/// Blocks until the next message is admitted in virtual time; ends when the
/// session ends.
#[derive(Debug)]
pub struct RuleInput {
    lane: Lane,
    consumed: Arc<AtomicU64>,
}

impl RuleInput {
    pub(crate) fn new(lane: Lane, consumed: Arc<AtomicU64>) -> Self {
        Self { lane, consumed }
    }

    /// Virtual time of the most recently admitted message.
    #[must_use]
    pub fn now(&self) -> EventTime {
        self.lane.now()
    }
}

impl Iterator for RuleInput {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        let stamped = self.lane.recv()?;
        self.consumed.fetch_add(1, Ordering::AcqRel);
        Some(stamped.value)
    }
}

/// How driving a rule ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Termination {
    /// The output ran out.
    Completed { emitted: u64 },
    /// The output yielded an error.
    Failed(RuleFailure),
    /// The rule panicked while being applied or drained.
    Violated(String),
}

/// Apply `rule` and drain its output until it ends or fails.
///
/// The output (and with it the input lane) is dropped before returning.
pub(crate) fn drive(rule: &dyn Rule, input: RuleInput) -> Termination {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut output = rule.apply(input);
        let mut emitted = 0u64;
        for item in output.by_ref() {
            match item {
                Ok(_) => emitted += 1,
                Err(failure) => return Termination::Failed(failure),
            }
        }
        Termination::Completed { emitted }
    }));

    outcome.unwrap_or_else(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Termination::Violated(format!("rule panicked: {detail}"))
    })
}
