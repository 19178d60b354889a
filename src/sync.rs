//! Lock helpers.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// State behind these mutexes is updated before any callback runs, so a panic in a
/// callback never leaves it half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits on a condition variable while `condition` holds, recovering from poisoning.
pub(crate) fn wait_while<'a, T, F>(
  condvar: &Condvar,
  guard: MutexGuard<'a, T>,
  condition: F,
) -> MutexGuard<'a, T>
where
  F: FnMut(&mut T) -> bool,
{
  condvar
    .wait_while(guard, condition)
    .unwrap_or_else(PoisonError::into_inner)
}
