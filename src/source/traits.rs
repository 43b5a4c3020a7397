//! The message-source contract.
//!
//! A message source owns the recorded history of every session and the live
//! feed of new messages. The inspector never writes to it.

use crate::error::SourceError;
use crate::message::{SeqRange, SessionId};

use super::stream::MessageStream;

/// Supplies historical and live message streams per session.
///
/// # Ordering
/// Every stream delivers messages in ascending sequence order without gaps
/// within the requested range.
pub trait MessageSource: Send + Sync {
    /// The recorded messages of `session` within `range`. Finite.
    fn replay(&self, session: &SessionId, range: SeqRange) -> Result<MessageStream, SourceError>;

    /// Messages of `session` within `range` that arrive after the call. Ends
    /// when the session ends or the range is exhausted.
    fn live(&self, session: &SessionId, range: SeqRange) -> Result<MessageStream, SourceError>;

    /// All recorded messages followed seamlessly by live ones: no message is
    /// lost or repeated at the seam.
    fn replay_then_live(&self, session: &SessionId) -> Result<MessageStream, SourceError>;

    /// Number of recorded messages.
    fn count(&self, session: &SessionId) -> Result<u64, SourceError>;
}
