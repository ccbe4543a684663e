//! Sleepable locks
use core::ops::{Deref, DerefMut};
use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard};

/// A blocking lock whose guard can wait for a condition over the protected
/// state and signal other waiters.
///
/// This is the waitable tier of the lock module: the condition variable is
/// bound to the lock, so `sleep` atomically releases the lock and suspends,
/// and returns with the lock re-acquired.
pub struct SleepableLock<T> {
    name: &'static str,
    inner: Mutex<T>,
    cond: Condvar,
}

/// Guards of `SleepableLock<T>`. These guards can `sleep()`/`wakeup()`.
pub struct SleepableLockGuard<'s, T> {
    lock: &'s SleepableLock<T>,
    // `None` only transiently inside `sleep`.
    guard: Option<MutexGuard<'s, T>>,
}

impl<T> SleepableLock<T> {
    /// Returns a new `SleepableLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
            cond: Condvar::new(),
        }
    }

    /// Acquires the lock, blocking until it is available.
    pub fn lock(&self) -> SleepableLockGuard<'_, T> {
        SleepableLockGuard {
            lock: self,
            guard: Some(
                self.inner
                    .lock()
                    .unwrap_or_else(|_| panic!("sleepablelock {} poisoned", self.name)),
            ),
        }
    }

    /// Wakes all waiters without holding the lock.
    pub fn wakeup_all(&self) {
        self.cond.notify_all();
    }

    /// Wakes one waiter without holding the lock.
    pub fn wakeup_one(&self) {
        self.cond.notify_one();
    }

    /// Returns a mutable reference to the inner data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        let name = self.name;
        self.inner
            .get_mut()
            .unwrap_or_else(|_| panic!("sleepablelock {} poisoned", name))
    }
}

impl<'s, T> SleepableLockGuard<'s, T> {
    /// Atomically releases the lock and waits until another thread calls
    /// `wakeup`. The lock is held again when this returns.
    pub fn sleep(&mut self) {
        let guard = self.guard.take().expect("sleep: guard gone");
        self.guard = Some(
            self.lock
                .cond
                .wait(guard)
                .unwrap_or_else(|_| panic!("sleepablelock {} poisoned", self.lock.name)),
        );
    }

    /// Like `sleep`, but gives up after `dur`. Returns true if the wait
    /// timed out.
    pub fn sleep_timeout(&mut self, dur: Duration) -> bool {
        let guard = self.guard.take().expect("sleep: guard gone");
        let (guard, timeout) = self
            .lock
            .cond
            .wait_timeout(guard, dur)
            .unwrap_or_else(|_| panic!("sleepablelock {} poisoned", self.lock.name));
        self.guard = Some(guard);
        timeout.timed_out()
    }

    /// Wakes all threads sleeping on this lock.
    pub fn wakeup(&self) {
        self.lock.cond.notify_all();
    }

    /// Name of the lock this guard belongs to.
    pub fn lock_name(&self) -> &'static str {
        self.lock.name
    }
}

impl<T> Deref for SleepableLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard gone")
    }
}

impl<T> DerefMut for SleepableLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard gone")
    }
}
