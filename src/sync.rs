use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, ignoring poisoning.
///
/// Critical sections in this crate never leave the protected state half-updated, so the
/// data behind a poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
