use std::sync::Mutex;
use std::sync::MutexGuard;

/// Lock a mutex, ignoring poisoning.
///
/// User code only ever runs inside `catch_unwind`, so a poisoned lock
/// can only come from a panic in this crate and the data it guards is
/// still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
