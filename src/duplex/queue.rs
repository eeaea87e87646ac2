//! Per-session output queue.
//!
//! Written by the ingest loop, read by the emit loop. Every [`clear`] bumps
//! an epoch so frames produced for audio that preceded an interrupt can be
//! recognised and discarded even if they arrive after the clear.
//!
//! [`clear`]: OutputQueue::clear

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::protocol::frame::BackendFrame;

/// A frame together with the epoch it was queued in.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedFrame {
    pub frame: BackendFrame,
    pub epoch: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<BackendFrame>,
    epoch: u64,
    discarded: u64,
}

#[derive(Debug, Default)]
pub struct OutputQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn push(&self, frame: BackendFrame) {
        self.lock().frames.push_back(frame);
        self.notify.notify_one();
    }

    /// Queue `frame` only if no clear happened since `epoch` was read.
    pub fn push_if_current(&self, frame: BackendFrame, epoch: u64) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch {
            state.discarded += 1;
            return false;
        }
        state.frames.push_back(frame);
        drop(state);
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<QueuedFrame> {
        let mut state = self.lock();
        let epoch = state.epoch;
        state.frames.pop_front().map(|frame| QueuedFrame { frame, epoch })
    }

    /// Pop, waiting up to `timeout` for a frame. Single consumer.
    pub async fn pop_wait(&self, timeout: Duration) -> Option<QueuedFrame> {
        if let Some(queued) = self.pop() {
            return Some(queued);
        }
        // A push between the pop above and this wait leaves a stored permit.
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.pop()
    }

    /// Drop everything queued and start a new epoch. Returns the number dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.frames.len();
        state.frames.clear();
        state.epoch += 1;
        state.discarded += dropped as u64;
        dropped
    }

    /// Whether `epoch` is still the current one.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames dropped by clears or rejected as stale.
    pub fn discarded(&self) -> u64 {
        self.lock().discarded
    }
}
