//! A small teaching kernel's storage and memory core, rendered as a
//! hosted crate.
//!
//! Four interacting concurrent state machines make up the interesting
//! part: a write-back buffer cache with read-ahead and write-behind
//! daemons ([`bio`]), a multi-level inode layer with lazy block
//! allocation over it ([`fs`]), a strict-priority scheduler with
//! priority donation and an alternative fixed-point MLFQS mode
//! ([`sched`]), and a demand-paging core with per-process supplementary
//! page tables, a second-chance frame table and a swap pool ([`vm`]),
//! all coordinated by a documented total lock order. The [`syscall`]
//! module is the validated user-facing surface, and [`kernel`] bolts
//! everything together.
//!
//! Block devices and the console are trait-level collaborators in
//! [`hal`]; tests run the whole stack over in-memory disks.

pub mod bio;
pub mod file;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod lock;
pub mod param;
pub mod proc;
pub mod sched;
pub mod syscall;
pub mod util;
pub mod vm;
