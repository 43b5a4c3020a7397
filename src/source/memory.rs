//! In-memory message source.
//!
//! Thread-safe reference implementation of [`MessageSource`] for embedded
//! usage and tests. History lives in memory; live subscribers are fed from
//! [`InMemoryMessageSource::publish`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard, Weak};

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;
use uuid::Uuid;

use crate::error::SourceError;
use crate::message::{EndpointId, EventTime, Message, SeqRange, SessionId};

use super::stream::MessageStream;
use super::traits::MessageSource;

/// Identifier of one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct LiveSubscriber {
    tx: Sender<Result<Message, SourceError>>,
    range: SeqRange,
}

#[derive(Debug, Default)]
struct SessionLog {
    messages: Vec<Message>,
    live: HashMap<SubscriptionId, LiveSubscriber>,
    ended: bool,
    failure: Option<SourceError>,
}

impl SessionLog {
    fn check(&self) -> Result<(), SourceError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn snapshot(&self, range: SeqRange) -> impl Iterator<Item = Message> + '_ {
        let len = self.messages.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.map_or(len, |end| end.min(len)).max(range.start.min(len)) as usize;
        self.messages[start..end].iter().cloned()
    }
}

type Sessions = RwLock<HashMap<SessionId, SessionLog>>;

/// In-memory message source.
#[derive(Debug, Default)]
pub struct InMemoryMessageSource {
    sessions: Arc<Sessions>,
}

fn lock_sessions(sessions: &Sessions) -> Result<RwLockWriteGuard<'_, HashMap<SessionId, SessionLog>>, SourceError> {
    sessions.write().map_err(|_| SourceError::Backend {
        message: "poisoned lock: sessions".to_string(),
    })
}

fn unsubscribe(sessions: &Weak<Sessions>, session: &SessionId, id: SubscriptionId) {
    let Some(sessions) = sessions.upgrade() else {
        return;
    };
    let Ok(mut guard) = sessions.write() else {
        return;
    };
    if let Some(log) = guard.get_mut(session) {
        if log.live.remove(&id).is_some() {
            debug!(session = %session, "released live subscription");
        }
    }
}

impl InMemoryMessageSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session without messages. Idempotent.
    pub fn open_session(&self, session: &SessionId) -> Result<(), SourceError> {
        let mut guard = lock_sessions(&self.sessions)?;
        guard.entry(session.clone()).or_default();
        Ok(())
    }

    /// Append a message and push it to live subscribers. Returns its sequence number.
    pub fn publish(
        &self,
        session: &SessionId,
        source: EndpointId,
        destination: EndpointId,
        payload: serde_json::Value,
        timestamp: EventTime,
    ) -> Result<u64, SourceError> {
        let mut guard = lock_sessions(&self.sessions)?;
        let log = guard.entry(session.clone()).or_default();
        if log.ended {
            return Err(SourceError::Disconnected {
                path: format!("session {session} has ended"),
            });
        }

        let seq = log.messages.len() as u64;
        let msg = Message::new(seq, source, destination, payload, timestamp);
        log.messages.push(msg.clone());

        log.live.retain(|_, sub| {
            if sub.range.contains(seq) && sub.tx.send(Ok(msg.clone())).is_err() {
                return false;
            }
            !sub.range.is_exhausted_at(seq + 1)
        });
        Ok(seq)
    }

    /// Mark the session ended: live streams finish after their buffered messages.
    pub fn end_session(&self, session: &SessionId) -> Result<(), SourceError> {
        let mut guard = lock_sessions(&self.sessions)?;
        let log = guard.get_mut(session).ok_or_else(|| SourceError::SessionNotFound {
            session: session.clone(),
        })?;
        log.ended = true;
        log.live.clear();
        Ok(())
    }

    /// Put the session's backend into a failed state: open live streams receive
    /// the error and end, later calls return it.
    pub fn fail_session(&self, session: &SessionId, message: impl Into<String>) -> Result<(), SourceError> {
        let err = SourceError::Backend {
            message: message.into(),
        };
        let mut guard = lock_sessions(&self.sessions)?;
        let log = guard.get_mut(session).ok_or_else(|| SourceError::SessionNotFound {
            session: session.clone(),
        })?;
        for (_, sub) in log.live.drain() {
            let _ = sub.tx.send(Err(err.clone()));
        }
        log.failure = Some(err);
        Ok(())
    }

    /// Clear a failure injected with [`Self::fail_session`].
    pub fn recover_session(&self, session: &SessionId) -> Result<(), SourceError> {
        let mut guard = lock_sessions(&self.sessions)?;
        if let Some(log) = guard.get_mut(session) {
            log.failure = None;
        }
        Ok(())
    }

    /// Number of live subscriptions currently registered for `session`.
    pub fn live_subscribers(&self, session: &SessionId) -> usize {
        self.sessions
            .read()
            .ok()
            .and_then(|guard| guard.get(session).map(|log| log.live.len()))
            .unwrap_or(0)
    }

    fn subscribe(
        &self,
        session: &SessionId,
        range: SeqRange,
        include_history: bool,
    ) -> Result<MessageStream, SourceError> {
        let mut guard = lock_sessions(&self.sessions)?;
        let log = guard.get_mut(session).ok_or_else(|| SourceError::SessionNotFound {
            session: session.clone(),
        })?;
        log.check()?;

        let (tx, rx) = unbounded();
        if include_history {
            for msg in log.snapshot(range) {
                let _ = tx.send(Ok(msg));
            }
        }

        let next_seq = log.messages.len() as u64;
        if log.ended || range.is_exhausted_at(next_seq) {
            return Ok(MessageStream::new(rx));
        }

        let id = SubscriptionId::new();
        log.live.insert(id, LiveSubscriber { tx, range });

        let sessions = Arc::downgrade(&self.sessions);
        let session = session.clone();
        Ok(MessageStream::with_release(rx, move || unsubscribe(&sessions, &session, id)))
    }
}

impl MessageSource for InMemoryMessageSource {
    fn replay(&self, session: &SessionId, range: SeqRange) -> Result<MessageStream, SourceError> {
        let guard = self.sessions.read().map_err(|_| SourceError::Backend {
            message: "poisoned lock: sessions".to_string(),
        })?;
        let log = guard.get(session).ok_or_else(|| SourceError::SessionNotFound {
            session: session.clone(),
        })?;
        log.check()?;
        Ok(MessageStream::from_messages(log.snapshot(range).collect::<Vec<_>>()))
    }

    fn live(&self, session: &SessionId, range: SeqRange) -> Result<MessageStream, SourceError> {
        self.subscribe(session, range, false)
    }

    fn replay_then_live(&self, session: &SessionId) -> Result<MessageStream, SourceError> {
        // History snapshot and live registration happen under one write lock.
        self.subscribe(session, SeqRange::unbounded(), true)
    }

    fn count(&self, session: &SessionId) -> Result<u64, SourceError> {
        let guard = self.sessions.read().map_err(|_| SourceError::Backend {
            message: "poisoned lock: sessions".to_string(),
        })?;
        let log = guard.get(session).ok_or_else(|| SourceError::SessionNotFound {
            session: session.clone(),
        })?;
        log.check()?;
        Ok(log.messages.len() as u64)
    }
}
