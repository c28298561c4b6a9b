use std::sync::{Condvar, Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
/// The engine keeps running through worker panics so the plan can still
/// drain and report.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Condvar wait with the same poison recovery as [`lock`].
pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(|e| e.into_inner())
}
