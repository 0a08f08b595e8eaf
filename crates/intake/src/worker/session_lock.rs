//! In-process mutual exclusion per exam session.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    TimedOut,
    /// The caller's stop condition became true while waiting.
    Stopped,
}

#[derive(Default)]
pub struct SessionLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl SessionLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `exam_session_id` is free, `timeout` elapses or `stop`
    /// returns true. The lock is released when the guard drops.
    pub fn acquire<F>(
        self: &Arc<Self>,
        exam_session_id: &str,
        timeout: Duration,
        stop: F,
    ) -> Result<SessionGuard, LockWait>
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut held = self.held();

        while held.contains(exam_session_id) {
            if stop() {
                return Err(LockWait::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockWait::TimedOut);
            }
            let wait = POLL_INTERVAL.min(deadline - now);
            held = self
                .released
                .wait_timeout(held, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }

        held.insert(exam_session_id.to_string());
        Ok(SessionGuard {
            locks: Arc::clone(self),
            exam_session_id: exam_session_id.to_string(),
        })
    }

    pub fn is_held(&self, exam_session_id: &str) -> bool {
        self.held().contains(exam_session_id)
    }
}

pub struct SessionGuard {
    locks: Arc<SessionLocks>,
    exam_session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.locks.held().remove(&self.exam_session_id);
        self.locks.released.notify_all();
    }
}
