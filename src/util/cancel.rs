//! Cooperative cancellation of a running job.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Shared cancellation signal with an optional deadline.
///
/// Clones observe the same signal. Waiting on the token blocks only the
/// calling thread and is woken early by [`cancel`](Self::cancel).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Token that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: Some(deadline),
                ..Default::default()
            }),
        }
    }

    /// Token that is cancelled `timeout` from now.
    ///
    /// A timeout too large to be represented never expires.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    pub fn cancel(&self) {
        *self.lock() = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.lock() || self.expired()
    }

    /// Blocks for `duration` unless cancelled first.
    ///
    /// Returns `false` if the token was (or became) cancelled. A duration
    /// too large to be represented waits until cancellation.
    pub fn wait(&self, duration: Duration) -> bool {
        let end = Instant::now().checked_add(duration);
        let mut cancelled = self.lock();
        loop {
            if *cancelled || self.expired() {
                return false;
            }

            let now = Instant::now();
            if end.is_some_and(|end| now >= end) {
                return true;
            }

            let wake_at = match (end, self.inner.deadline) {
                (Some(end), Some(deadline)) => Some(end.min(deadline)),
                (end, deadline) => end.or(deadline),
            };

            cancelled = match wake_at {
                Some(wake_at) => {
                    self.inner
                        .wake
                        .wait_timeout(cancelled, wake_at.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .wake
                    .wait(cancelled)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn expired(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
