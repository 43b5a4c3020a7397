//! Message-source collaborator: the trait the inspector consumes and an
//! in-memory implementation.

mod memory;
mod stream;
mod traits;

pub use memory::{InMemoryMessageSource, SubscriptionId};
pub use stream::{MessageStream, StreamRecv};
pub use traits::MessageSource;
