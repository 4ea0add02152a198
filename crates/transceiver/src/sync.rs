//! Locking helpers shared by the reactor and the transceiver.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// Run `f` with the lock held, tracing acquisition and release.
///
/// A poisoned lock is recovered rather than propagated: every structure
/// guarded this way stays consistent across a panicking callback.
pub(crate) fn with_lock<T, F, R>(name: &str, lock: &Mutex<T>, f: F) -> R
where
    F: FnOnce(MutexGuard<'_, T>) -> R,
{
    tracing::trace!(%name, "taking lock");
    let inner = lock.lock().unwrap_or_else(PoisonError::into_inner);
    let res = f(inner);
    tracing::trace!(%name, "releasing lock");
    res
}

/// Reentrant-aware exclusion for one operation.
///
/// Unlike a mutex, entering a guard that is already held by the *current*
/// thread does not deadlock: the nested attempt is told to skip. This lets
/// `stop_tx`, `stop_rx` and `close` call each other without tripping over
/// their own exclusion, while still serialising the same operation across
/// threads.
#[derive(Debug)]
pub(crate) struct OperationGuard {
    name: &'static str,
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

/// Proof that the current thread is executing the guarded operation.
///
/// Dropping it hands the operation back to waiting threads.
#[must_use]
#[derive(Debug)]
pub(crate) struct Entered<'a> {
    guard: &'a OperationGuard,
}

impl OperationGuard {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Enter the operation.
    ///
    /// Returns `None` when the current thread is already inside it. Waits
    /// while another thread is inside it.
    pub(crate) fn enter(&self) -> Option<Entered<'_>> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match *owner {
                None => {
                    *owner = Some(me);
                    return Some(Entered { guard: self });
                }
                Some(id) if id == me => {
                    tracing::trace!(operation = self.name, "already executing on this thread");
                    return None;
                }
                Some(_) => {
                    tracing::trace!(operation = self.name, "waiting for another thread");
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        let mut owner = self
            .guard
            .owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *owner = None;
        self.guard.released.notify_all();
    }
}
