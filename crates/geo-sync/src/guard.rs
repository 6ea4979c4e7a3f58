//! Re-entrancy guard for applying remote changes to the local store.
//!
//! Applying a remote change makes the drawing tool report the mutation as if
//! it were local. The guard marks the thread doing the applying, so the
//! bridge can drop those notifications instead of publishing them back to the
//! replicated map. Notifications raised on any other thread are never
//! suppressed.

use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
pub struct RemoteApplyGuard {
    owner: Mutex<Option<ThreadId>>,
}

impl RemoteApplyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the current thread as applying remote changes until the returned
    /// scope is dropped.
    pub fn enter(&self) -> ApplyScope<'_> {
        let previous = self.lock().replace(thread::current().id());
        ApplyScope {
            guard: self,
            previous,
        }
    }

    /// True when called from the thread currently applying remote changes.
    pub fn is_applying(&self) -> bool {
        *self.lock() == Some(thread::current().id())
    }

    fn lock(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.owner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Restores the guard's previous owner on drop, including during unwinding.
#[must_use = "the guard is released as soon as the scope is dropped"]
pub struct ApplyScope<'a> {
    guard: &'a RemoteApplyGuard,
    previous: Option<ThreadId>,
}

impl Drop for ApplyScope<'_> {
    fn drop(&mut self) {
        *self.guard.lock() = self.previous.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_scope_sets_and_clears() {
        let guard = RemoteApplyGuard::new();
        assert!(!guard.is_applying());

        {
            let _scope = guard.enter();
            assert!(guard.is_applying());
        }

        assert!(!guard.is_applying());
    }

    #[test]
    fn test_nested_scopes_restore_outer() {
        let guard = RemoteApplyGuard::new();
        let outer = guard.enter();
        {
            let _inner = guard.enter();
            assert!(guard.is_applying());
        }
        assert!(guard.is_applying());
        drop(outer);
        assert!(!guard.is_applying());
    }

    #[test]
    fn test_other_threads_are_not_applying() {
        let guard = Arc::new(RemoteApplyGuard::new());
        let _scope = guard.enter();

        let guard_clone = Arc::clone(&guard);
        let seen = thread::spawn(move || guard_clone.is_applying())
            .join()
            .unwrap();

        assert!(!seen);
        assert!(guard.is_applying());
    }

    #[test]
    fn test_scope_released_on_panic() {
        let guard = Arc::new(RemoteApplyGuard::new());
        let guard_clone = Arc::clone(&guard);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = guard_clone.enter();
            panic!("boom");
        }));

        assert!(result.is_err());
        assert!(!guard.is_applying());
    }
}
