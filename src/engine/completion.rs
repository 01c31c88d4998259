//! Future-like completion handles for activities
//!
//! A `CompletionHandle` is released exactly once, when its activity reaches a
//! terminal state. Callers may block (`wait`), block with a bound
//! (`wait_timeout`), or poll. The number of currently blocked callers is
//! tracked in an atomic counter that the scheduler priority function reads:
//! a tree someone is synchronously waiting on outranks trees nobody waits
//! for. That feedback is a deliberate feature, not bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::error::ActivityError;
use super::message::ActivityId;
use super::state::StateId;

/// Terminal outcome of an activity
#[derive(Debug, Clone)]
pub struct ActivityResult {
    /// The activity that completed
    pub activity: ActivityId,
    /// Terminal state reached
    pub state: StateId,
    /// Captured failure, if the activity did not complete cleanly
    pub error: Option<ActivityError>,
}

impl ActivityResult {
    /// Whether the activity completed without a captured failure
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One-shot completion primitive with a waiting-count side channel
#[derive(Default)]
pub struct CompletionHandle {
    result: Mutex<Option<ActivityResult>>,
    released: Condvar,
    waiting: AtomicUsize,
}

impl CompletionHandle {
    /// Create an unreleased handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the handle with the given result
    ///
    /// The first call wins; the result is frozen afterwards and later calls
    /// return `false`.
    pub fn complete(&self, result: ActivityResult) -> bool {
        let mut slot = self.result.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        drop(slot);
        self.released.notify_all();
        true
    }

    /// Non-blocking check for the result
    pub fn poll(&self) -> Option<ActivityResult> {
        self.result.lock().clone()
    }

    /// Whether the handle has been released
    pub fn is_complete(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Number of callers currently blocked inside `wait`/`wait_timeout`
    ///
    /// Read by the scheduler priority function.
    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Block until the activity reaches a terminal state
    pub fn wait(&self) -> ActivityResult {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.result.lock();
        let result = loop {
            if let Some(result) = slot.as_ref() {
                break result.clone();
            }
            self.released.wait(&mut slot);
        };
        drop(slot);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Block for at most `timeout`; `None` means "not yet complete"
    ///
    /// A timeout does not affect the underlying activity in any way.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ActivityResult> {
        let deadline = Instant::now() + timeout;
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.result.lock();
        let result = loop {
            if let Some(result) = slot.as_ref() {
                break Some(result.clone());
            }
            if self.released.wait_until(&mut slot, deadline).timed_out() {
                break slot.clone();
            }
        };
        drop(slot);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Cancellation is explicitly unsupported
    ///
    /// The engine has no cancellation semantics; this reports an error
    /// rather than silently doing nothing.
    pub fn cancel(&self) -> Result<(), ActivityError> {
        Err(ActivityError::CancelUnsupported)
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("complete", &self.is_complete())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}
