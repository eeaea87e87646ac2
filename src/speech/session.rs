//! # Session Table
//!
//! Live backend sessions keyed by id, shared by both strategies.
//!
//! ## Key Features:
//! - **Single writer**: inserts and removals happen under one write lock
//! - **Admission control**: optional cap enforced at reservation time, so a
//!   slot is claimed before the expensive part of session creation starts
//! - **Exactly-once removal**: `remove` hands the session out once; later
//!   calls see `None`
//!
//! A [`SlotReservation`] that is dropped without being committed gives its
//! slot back, which covers creation failing or being cancelled part way.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::speech::error::BackendError;
use crate::speech::SessionId;

/// Fresh opaque session id.
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

struct TableInner<S> {
    sessions: HashMap<SessionId, Arc<S>>,
    pending: usize,
}

pub struct SessionTable<S> {
    inner: Arc<RwLock<TableInner<S>>>,
    max_sessions: Option<usize>,
}

impl<S> SessionTable<S> {
    /// Table without a session cap.
    pub fn unbounded() -> Self {
        Self::build(None)
    }

    /// Table admitting at most `max_sessions` live plus in-flight sessions.
    pub fn bounded(max_sessions: usize) -> Self {
        Self::build(Some(max_sessions))
    }

    fn build(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TableInner {
                sessions: HashMap::new(),
                pending: 0,
            })),
            max_sessions,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TableInner<S>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableInner<S>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim a slot, failing immediately when the cap is reached.
    pub fn try_reserve(&self) -> Result<SlotReservation<S>, BackendError> {
        let mut inner = self.write();

        if let Some(limit) = self.max_sessions {
            if inner.sessions.len() + inner.pending >= limit {
                return Err(BackendError::AdmissionLimitExceeded { limit });
            }
        }

        inner.pending += 1;
        Ok(SlotReservation {
            inner: Arc::clone(&self.inner),
            committed: false,
        })
    }

    /// Insert without admission control.
    pub fn insert(&self, id: SessionId, session: Arc<S>) {
        self.write().sessions.insert(id, session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<S>> {
        self.read().sessions.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<S>> {
        self.write().sessions.remove(id)
    }

    /// Empty the table, returning everything that was in it.
    pub fn drain(&self) -> Vec<(SessionId, Arc<S>)> {
        self.write().sessions.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claimed slot in a [`SessionTable`].
pub struct SlotReservation<S> {
    inner: Arc<RwLock<TableInner<S>>>,
    committed: bool,
}

impl<S> SlotReservation<S> {
    /// Turn the slot into a live session.
    pub fn commit(mut self, id: SessionId, session: Arc<S>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.pending = inner.pending.saturating_sub(1);
        inner.sessions.insert(id, session);
        self.committed = true;
    }
}

impl<S> Drop for SlotReservation<S> {
    fn drop(&mut self) {
        if !self.committed {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.pending = inner.pending.saturating_sub(1);
        }
    }
}

/// FIFO of text tokens waiting for the transcript loop.
#[derive(Debug, Default)]
pub struct TokenBacklog {
    tokens: Mutex<VecDeque<String>>,
}

impl TokenBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, token: String) {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).push_back(token);
    }

    pub fn pop(&self) -> Option<String> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }
}
