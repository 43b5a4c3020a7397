//! Message and identity types.
//!
//! A session is one timeline of messages exchanged between endpoints of the
//! monitored runtime. Messages are immutable and cheap to clone.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Creates an identity from its name.
            #[must_use]
            pub fn new(name: impl AsRef<str>) -> Self {
                Self(Arc::from(name.as_ref()))
            }

            /// Returns the name.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(Arc::from(name))
            }
        }
    };
}

string_id!(
    /// Identity of one message timeline.
    SessionId
);

string_id!(
    /// Identity of a rule. Two rules with the same name share cache entries.
    RuleId
);

string_id!(
    /// A named participant that sends or receives messages.
    EndpointId
);

/// Logical event timestamp carried by a message.
///
/// This is the time the monitored runtime recorded the event, not the time the
/// inspector received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTime(pub u64);

impl EventTime {
    /// The earliest representable time.
    pub const ZERO: Self = Self(0);

    /// Returns the raw tick value.
    #[must_use]
    pub const fn ticks(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// One recorded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic per-session sequence number, starting at 0.
    pub seq: u64,
    /// Sending endpoint.
    pub source: EndpointId,
    /// Receiving endpoint.
    pub destination: EndpointId,
    /// Opaque payload.
    pub payload: Arc<serde_json::Value>,
    /// Logical event timestamp.
    pub timestamp: EventTime,
}

impl Message {
    /// Creates a message.
    #[must_use]
    pub fn new(
        seq: u64,
        source: EndpointId,
        destination: EndpointId,
        payload: serde_json::Value,
        timestamp: EventTime,
    ) -> Self {
        Self {
            seq,
            source,
            destination,
            payload: Arc::new(payload),
            timestamp,
        }
    }
}

/// A half-open range over sequence numbers: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SeqRange {
    /// First sequence number (inclusive).
    pub start: u64,
    /// End (exclusive). `None` means unbounded.
    pub end: Option<u64>,
}

impl SeqRange {
    /// Creates a bounded range.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidRange` if `end < start`.
    pub fn new(start: u64, end: u64) -> Result<Self, ValidationError> {
        if end < start {
            return Err(ValidationError::InvalidRange { start, end });
        }
        Ok(Self { start, end: Some(end) })
    }

    /// The range covering every sequence number.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self { start: 0, end: None }
    }

    /// An open-ended range starting at `start`.
    #[must_use]
    pub const fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Returns true if `seq` lies in the range.
    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.start && self.end.map_or(true, |end| seq < end)
    }

    /// Returns true if no sequence number at or after `seq` can lie in the range.
    #[must_use]
    pub fn is_exhausted_at(&self, seq: u64) -> bool {
        self.end.is_some_and(|end| seq >= end)
    }
}
