//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion.
//! Three tiers are distinguished by what a holder is allowed to do:
//!
//! * `SpinLock`: busy-waiting lock for short critical sections. A holder
//!   must not block; these sections stand in for the interrupt-disabled
//!   regions of the scheduler and console.
//! * `SleepLock`: blocking lock for long holds, such as payload I/O.
//! * `SleepableLock`: blocking lock whose guard can wait on and signal a
//!   condition associated with the protected state.

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
