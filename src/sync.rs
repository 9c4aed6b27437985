use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, taking over the data if a previous holder panicked.
/// Every critical section in this crate is a plain field update, so the
/// data is never left half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
