//! Adapter lifecycle state and the lock that guards it.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::MiddlewareError;

/// Lifecycle of an object adapter.
///
/// `Inactive -> Activating -> Active -> Deactivating -> Destroyed`, with
/// `Failed` reachable from any non-destroyed state. `Destroyed` and `Failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    Inactive,
    Activating,
    Active,
    Deactivating,
    Destroyed,
    Failed,
}

impl AdapterState {
    /// `Destroyed` or `Failed`: no operation can succeed any more.
    pub fn is_terminal(self) -> bool {
        matches!(self, AdapterState::Destroyed | AdapterState::Failed)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Inactive => "Inactive",
            AdapterState::Activating => "Activating",
            AdapterState::Active => "Active",
            AdapterState::Deactivating => "Deactivating",
            AdapterState::Destroyed => "Destroyed",
            AdapterState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) struct StateInner {
    pub(crate) state: AdapterState,
    failure: Option<Arc<MiddlewareError>>,
}

/// The state lock. In the fixed lock order it is always taken after the
/// registry lock, never before.
#[derive(Debug)]
pub(crate) struct StateCell {
    adapter: String,
    inner: Mutex<StateInner>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            inner: Mutex::new(StateInner {
                state: AdapterState::Inactive,
                failure: None,
            }),
            changed: Condvar::new(),
        }
    }

    // No servant code runs under this lock, so a poisoned guard still holds
    // a consistent state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, StateInner>,
        condition: impl FnMut(&mut StateInner) -> bool,
    ) -> MutexGuard<'a, StateInner> {
        self.changed
            .wait_while(guard, condition)
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set(&self, guard: &mut StateInner, state: AdapterState) {
        guard.state = state;
        self.changed.notify_all();
    }

    pub(crate) fn current(&self) -> AdapterState {
        self.lock().state
    }

    pub(crate) fn bad_state(&self, label: &str, guard: &StateInner) -> MiddlewareError {
        MiddlewareError::BadState {
            label: label.to_string(),
            state: guard.state,
            adapter: self.adapter.clone(),
            cause: guard.failure.clone(),
        }
    }

    /// Fail with a bad-state error once the adapter is Destroyed or Failed.
    pub(crate) fn ensure_usable(&self, label: &str) -> Result<(), MiddlewareError> {
        let guard = self.lock();
        if guard.state.is_terminal() {
            return Err(self.bad_state(label, &guard));
        }
        Ok(())
    }

    /// Record an infrastructure fault and move to `Failed`.
    ///
    /// Only the first fault is remembered. A destroyed adapter stays
    /// destroyed.
    pub(crate) fn fail(&self, error: MiddlewareError) -> Arc<MiddlewareError> {
        let error = Arc::new(error);
        let mut guard = self.lock();
        if guard.failure.is_none() {
            guard.failure = Some(Arc::clone(&error));
        }
        if guard.state != AdapterState::Destroyed {
            self.set(&mut guard, AdapterState::Failed);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_initial_state() {
        let cell = StateCell::new("testscope");
        assert_eq!(cell.current(), AdapterState::Inactive);
        assert!(cell.ensure_usable("add()").is_ok());
    }

    #[test]
    fn test_terminal_states_reject_use() {
        let cell = StateCell::new("testscope");
        {
            let mut guard = cell.lock();
            cell.set(&mut guard, AdapterState::Destroyed);
        }
        let err = cell.ensure_usable("find()").unwrap_err();
        assert_eq!(
            err.to_string(),
            "find(): Object adapter in Destroyed state (adapter: testscope)"
        );
    }

    #[test]
    fn test_fail_remembers_first_cause() {
        let cell = StateCell::new("testscope");
        cell.fail(MiddlewareError::io("first"));
        cell.fail(MiddlewareError::io("second"));

        let err = cell.ensure_usable("remove()").unwrap_err();
        assert!(err.to_string().contains("Failed state"));
        assert_eq!(err.source().unwrap().to_string(), "IO error: first");
    }

    #[test]
    fn test_fail_does_not_resurrect_destroyed() {
        let cell = StateCell::new("testscope");
        {
            let mut guard = cell.lock();
            cell.set(&mut guard, AdapterState::Destroyed);
        }
        cell.fail(MiddlewareError::io("late"));
        assert_eq!(cell.current(), AdapterState::Destroyed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(AdapterState::Deactivating.to_string(), "Deactivating");
        assert!(AdapterState::Failed.is_terminal());
        assert!(!AdapterState::Active.is_terminal());
    }
}
