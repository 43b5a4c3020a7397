//! # Timeline Inspector
//!
//! Attach monitoring rules to a recorded-or-live timeline of messages exchanged
//! between endpoints of a monitored runtime, and observe pass/fail status plus
//! diagnostic context for every (session, rule) pair.
//!
//! ## Core Concepts
//!
//! - **SingleChangeObservable**: a value cell that moves once from an initial to a terminal value
//! - **VirtualTimeScope**: fans one message stream out to consumers that advance in lockstep
//! - **RuleEvaluationCache**: one memoized evaluation per (session, rule) pair
//! - **WindowedMessageCache**: random access over an unbounded filtered message sequence
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use timeline_inspector::{
//!     rule_output, EvaluationConfig, FnRule, InMemoryMessageSource, PoolConfig, Rule, RuleEvaluationCache,
//!     RuleInput, SessionId, WorkerPool,
//! };
//!
//! let source = Arc::new(InMemoryMessageSource::new());
//! let pool = Arc::new(WorkerPool::new("inspector", &PoolConfig::default()));
//! let cache = RuleEvaluationCache::new(source, pool, EvaluationConfig::default())?;
//!
//! let rule: Arc<dyn Rule> = Arc::new(FnRule::new("first-twenty", |input: RuleInput| {
//!     rule_output(input.take(20).map(Ok))
//! }));
//! let status = cache.status(&SessionId::new("run-1"), &rule);
//! status.add_listener(|s| println!("status: {s}"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod logging;
pub mod message;

// Primitives
pub mod observable;
pub mod runtime;
pub mod source;
pub mod virtual_time;

// Services
pub mod evaluation;
pub mod paging;

// Re-export primary types at crate root for convenience
pub use config::{EvaluationConfig, InspectorConfig, PoolConfig, WindowedCacheConfig};
pub use error::{
    CacheError, EvaluationError, ExecutionError, InspectorError, InspectorResult, SourceError, ValidationError,
};
pub use evaluation::{
    rule_output, EvaluationEntry, EvaluationKey, EvaluationSummary, FnRule, Rule, RuleEvaluationCache, RuleFailure,
    RuleInput, RuleOutput, RuleStatus,
};
pub use logging::{init_tracing, try_init_tracing, LogFormat};
pub use message::{EndpointId, EventTime, Message, RuleId, SeqRange, SessionId};
pub use observable::{SingleChangeObservable, Transition};
pub use paging::{AcceptAll, CacheStats, MessageFilter, SizeChange, WindowedMessageCache};
pub use runtime::{JobHandle, WorkerPool};
pub use source::{InMemoryMessageSource, MessageSource, MessageStream, StreamRecv, SubscriptionId};
pub use virtual_time::{Lane, LaneRecv, ScopeReport, Stamped, VirtualClock, VirtualTimeScope};
