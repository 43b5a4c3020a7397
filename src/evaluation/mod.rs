//! Rule evaluation: memoized, one evaluation per (session, rule) pair.
//!
//! [`RuleEvaluationCache`] is the entry point. Each accessor returns a
//! [`SingleChangeObservable`](crate::observable::SingleChangeObservable) cell
//! that moves to its terminal value when the evaluation ends.

mod cache;
mod entry;
mod rule;
mod window;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{RuleId, SessionId};

pub use cache::{EvaluationSummary, RuleEvaluationCache};
pub use entry::EvaluationEntry;
pub use rule::{rule_output, FnRule, Rule, RuleFailure, RuleInput, RuleOutput};

/// Outcome of one rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    /// The rule is still consuming messages.
    #[default]
    Running,
    /// The rule's output ended normally.
    Success,
    /// The rule reported a failure, or the evaluation could not complete.
    Failure,
}

impl RuleStatus {
    /// Returns true for `Success` and `Failure`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// Cache key of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvaluationKey {
    /// Session the rule runs on.
    pub session: SessionId,
    /// The rule.
    pub rule: RuleId,
}

impl EvaluationKey {
    /// Creates a key.
    #[must_use]
    pub fn new(session: SessionId, rule: RuleId) -> Self {
        Self { session, rule }
    }
}

impl fmt::Display for EvaluationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.rule)
    }
}
