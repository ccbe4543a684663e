//! Sleep locks
use core::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

/// Long-term lock that blocks the acquiring thread instead of spinning.
///
/// Appropriate for sections that themselves suspend, e.g. disk I/O.
pub struct SleepLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

/// Guards of `SleepLock<T>`.
pub struct SleepLockGuard<'s, T> {
    name: &'static str,
    guard: MutexGuard<'s, T>,
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    /// Acquires the lock, blocking until it is available.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        SleepLockGuard {
            name: self.name,
            guard: self
                .inner
                .lock()
                .unwrap_or_else(|_| panic!("sleeplock {} poisoned", self.name)),
        }
    }

    /// Returns a mutable reference to the inner data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        let name = self.name;
        self.inner
            .get_mut()
            .unwrap_or_else(|_| panic!("sleeplock {} poisoned", name))
    }
}

impl<T> SleepLockGuard<'_, T> {
    /// Name of the lock this guard belongs to.
    pub fn lock_name(&self) -> &'static str {
        self.name
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
