//! Spin locks
use core::ops::{Deref, DerefMut};

/// Mutual exclusion lock that busy waits (spins).
///
/// Critical sections under a `SpinLock` must be short and must not block:
/// they model the regions the original kernel runs with interrupts
/// disabled. Holding one across a `SleepLock` acquisition or disk I/O is a
/// bug.
pub struct SpinLock<T> {
    /// Name of lock, for diagnostics.
    name: &'static str,
    inner: spin::Mutex<T>,
}

/// Guards of `SpinLock<T>`.
pub struct SpinLockGuard<'s, T> {
    name: &'static str,
    guard: spin::MutexGuard<'s, T>,
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: spin::Mutex::new(data),
        }
    }

    /// Acquires the lock and returns its guard.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            name: self.name,
            guard: self.inner.lock(),
        }
    }

    /// Returns a mutable reference to the inner data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T> SpinLockGuard<'_, T> {
    /// Name of the lock this guard belongs to.
    pub fn lock_name(&self) -> &'static str {
        self.name
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
