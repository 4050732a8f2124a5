//! Countdown latch used for the worker readiness handshake.

use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug)]
struct LatchState {
    remaining: usize,
    failure: Option<String>,
}

/// Releases waiters once `count_down` has been called `count` times, or as
/// soon as any party reports a failure.
#[derive(Debug, Clone)]
pub(crate) struct ReadyLatch {
    inner: Arc<(Mutex<LatchState>, Condvar)>,
}

impl ReadyLatch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(LatchState {
                    remaining: count,
                    failure: None,
                }),
                Condvar::new(),
            )),
        }
    }

    pub(crate) fn count_down(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            cvar.notify_all();
        }
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        state.failure.get_or_insert_with(|| reason.into());
        cvar.notify_all();
    }

    /// Block until every party is ready. Returns the first failure instead,
    /// if one was reported.
    pub(crate) fn wait(&self) -> Result<(), String> {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let state = cvar
            .wait_while(guard, |s| s.remaining > 0 && s.failure.is_none())
            .unwrap_or_else(|e| e.into_inner());
        match &state.failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}
