//! User processes.
//!
//! A process is a thread record plus user-space state: a page directory,
//! a supplementary page table, a descriptor table, a current directory,
//! memory mappings, and the parent/child bookkeeping behind `exec`,
//! `wait` and `exit`. The process's identity is its thread id.
//!
//! Records are shared as handles: paths that cross processes (frame
//! eviction touching another process's tables) look the victim up in the
//! global table and lock only what the documented lock order allows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::file::File;
use crate::lock::SpinLock;
use crate::param::ROOT_DIR_SECTOR;
use crate::sched::Tid;
use crate::vm::page::Spt;
use crate::vm::pagedir::PageDir;

pub type Pid = Tid;

/// A memory mapping created by `mmap`.
pub struct Mapping {
    pub inode: Arc<crate::fs::inode::Inode>,
    pub base: usize,
    pub pages: usize,
}

/// Mutable process bookkeeping, guarded by the process's `info` lock.
pub struct ProcInfo {
    /// Sector of the current directory.
    pub cwd: u32,
    /// Open descriptors. 0 and 1 are the console and never appear here.
    pub fds: BTreeMap<i32, File>,
    pub next_fd: i32,
    /// Active memory mappings by map id.
    pub mappings: BTreeMap<i32, Mapping>,
    pub next_mapid: i32,
    /// The executable this process runs, kept open with writes denied.
    pub executable: Option<File>,
    /// Live children that have not been waited for.
    pub children: Vec<Pid>,
    /// Saved user stack pointer, consulted by the fault handler when the
    /// fault comes from kernel mode.
    pub user_esp: usize,
}

/// A user process.
pub struct Proc {
    pub tid: Tid,
    pub name: String,
    pub pagedir: Mutex<PageDir>,
    pub spt: Mutex<Spt>,
    pub info: Mutex<ProcInfo>,
}

impl Proc {
    pub fn new(tid: Tid, name: &str) -> Proc {
        Proc {
            tid,
            name: name.to_string(),
            pagedir: Mutex::new(PageDir::new()),
            spt: Mutex::new(Spt::new()),
            info: Mutex::new(ProcInfo {
                cwd: ROOT_DIR_SECTOR,
                fds: BTreeMap::new(),
                next_fd: 2,
                mappings: BTreeMap::new(),
                next_mapid: 1,
                executable: None,
                children: Vec::new(),
                user_esp: 0,
            }),
        }
    }

    pub fn lock_spt(&self) -> MutexGuard<'_, Spt> {
        self.spt.lock().expect("spt poisoned")
    }

    pub fn lock_pagedir(&self) -> MutexGuard<'_, PageDir> {
        self.pagedir.lock().expect("pagedir poisoned")
    }

    pub fn lock_info(&self) -> MutexGuard<'_, ProcInfo> {
        self.info.lock().expect("proc info poisoned")
    }
}

/// The global process table, plus exit statuses of dead processes that
/// have not been reaped by `wait`.
pub struct ProcTable {
    inner: SpinLock<ProcTableInner>,
}

struct ProcTableInner {
    procs: BTreeMap<Pid, Arc<Proc>>,
    zombies: BTreeMap<Pid, i32>,
}

impl ProcTable {
    pub fn new() -> ProcTable {
        ProcTable {
            inner: SpinLock::new(
                "proc_table",
                ProcTableInner {
                    procs: BTreeMap::new(),
                    zombies: BTreeMap::new(),
                },
            ),
        }
    }

    pub fn insert(&self, proc: Arc<Proc>) {
        let mut inner = self.inner.lock();
        inner.procs.insert(proc.tid, proc);
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Proc>> {
        self.inner.lock().procs.get(&pid).cloned()
    }

    /// Removes the record and files its exit status for a later `wait`.
    pub fn retire(&self, pid: Pid, status: i32) {
        let mut inner = self.inner.lock();
        inner.procs.remove(&pid);
        inner.zombies.insert(pid, status);
    }

    /// Takes the exit status of a dead process, if recorded.
    pub fn reap(&self, pid: Pid) -> Option<i32> {
        self.inner.lock().zombies.remove(&pid)
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.inner.lock().procs.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}
