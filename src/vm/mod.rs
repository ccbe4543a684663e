//! Paging core.
//!
//! Demand paging over four cooperating structures: the per-process
//! supplementary page table, the global frame table with second-chance
//! eviction, the swap pool, and the per-process page directories.
//!
//! # Lock order
//!
//! Deadlock between processes sharing memory, file and swap resources is
//! prevented by a total order. Any path's acquisitions must form a
//! subsequence of:
//!
//! 1. the top-of-order gate lock (`tloatol`),
//! 2. the supplementary page table of the current process,
//! 3. the frame table,
//! 4. the supplementary page table of another process,
//! 5. the swap pool,
//! 6. the page directory of another process,
//! 7. the page directory of the current process.
//!
//! The gate is taken by every operation that may evict a frame owned by
//! a different process (page faults needing a frame, unmapping,
//! teardown) and is released inside the subsystem once the holder has
//! descended far enough that inversion is no longer possible. Page
//! directory locks are leaves: nothing else is acquired while one is
//! held. The frame pool is a private allocator below the whole order.

pub mod frame;
pub mod page;
pub mod pagedir;
pub mod swap;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;

use crate::fs::inode::Inode;
use crate::fs::FileSys;
use crate::param::{PG_SIZE, STACK_MAX, USER_TOP};
use crate::proc::{Proc, ProcTable};
use frame::{FrameId, FramePool, FrameTable};
use page::{PageInfo, PageKind, PageStatus, Spt};
use swap::SwapPool;

/// Outcome of a page fault.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultResult {
    /// The page is resident now; retry the access.
    Handled,
    /// User-mode violation: terminate the process.
    Kill,
    /// Kernel-mode probe of a bad user address: the copy path recovers.
    KernelCopyFault,
}

/// The paging subsystem.
pub struct Vm {
    /// The gate lock at the top of the documented order.
    tloatol: Mutex<()>,
    pub frames: Mutex<FrameTable>,
    pub pool: Mutex<FramePool>,
    pub swap: Mutex<SwapPool>,
    faults: AtomicUsize,
}

impl Vm {
    pub fn new(swap_dev: Arc<dyn crate::hal::BlockDevice>, user_frames: usize) -> Vm {
        Vm {
            tloatol: Mutex::new(()),
            frames: Mutex::new(FrameTable::new()),
            pool: Mutex::new(FramePool::new(user_frames)),
            swap: Mutex::new(SwapPool::new(swap_dev)),
            faults: AtomicUsize::new(0),
        }
    }

    /// Page faults handled so far.
    pub fn fault_count(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        trace!("vm: acquire gate");
        self.tloatol.lock().expect("gate poisoned")
    }
}

/// Rounds an address down to its page base.
pub fn page_base(addr: usize) -> usize {
    addr & !(PG_SIZE - 1)
}

/// Handles a page fault at `fault_addr`.
///
/// `write` is the access kind, `user` whether it came from user mode,
/// and `esp` the faulting thread's user stack pointer (the saved one for
/// kernel-mode faults on user addresses).
pub fn handle_fault(
    vm: &Vm,
    fs: &FileSys,
    procs: &ProcTable,
    proc: &Arc<Proc>,
    fault_addr: usize,
    write: bool,
    user: bool,
    esp: usize,
) -> FaultResult {
    let denied = |user: bool| {
        if user {
            FaultResult::Kill
        } else {
            FaultResult::KernelCopyFault
        }
    };

    vm.faults.fetch_add(1, Ordering::Relaxed);
    if fault_addr >= USER_TOP {
        return denied(user);
    }
    let fault_page = page_base(fault_addr);

    // A stack pointer below the stack ceiling is already out of bounds.
    if esp + STACK_MAX < USER_TOP {
        return FaultResult::Kill;
    }

    let gate = vm.gate();
    let mut spt = proc.lock_spt();

    if let Some(info) = spt.get(fault_page) {
        if write && info.kind == PageKind::ReadOnly {
            drop(gate);
            return denied(user);
        }
        if load_page(vm, fs, procs, proc, &mut spt, fault_page, gate) {
            return FaultResult::Handled;
        }
        return denied(user);
    }

    // Not recorded anywhere: is this the stack growing? The push and
    // pusha instructions touch 4 and 32 bytes below the stack pointer
    // before it moves.
    if fault_addr >= esp || fault_addr + 4 == esp || fault_addr + 32 == esp {
        spt.insert(
            fault_page,
            PageInfo {
                status: PageStatus::GrowingStack,
                kind: PageKind::ToSwap,
                writable: true,
                file: None,
                offset: 0,
                read_bytes: 0,
            },
        );
        if load_page(vm, fs, procs, proc, &mut spt, fault_page, gate) {
            return FaultResult::Handled;
        }
        return denied(user);
    }

    drop(gate);
    denied(user)
}

/// Brings the page described by `spt[vpage]` into memory: allocates a
/// frame (evicting somebody's page when the pool is dry), fills it from
/// swap, file, or zeroes, flips the entry to `InMemory`, and installs
/// the translation. The gate lock is consumed and released at the
/// earliest safe point.
fn load_page(
    vm: &Vm,
    fs: &FileSys,
    procs: &ProcTable,
    proc: &Arc<Proc>,
    spt: &mut Spt,
    vpage: usize,
    gate: MutexGuard<'_, ()>,
) -> bool {
    let frame = {
        let free = vm.pool.lock().expect("pool poisoned").alloc();
        match free {
            Some(f) => {
                vm.frames
                    .lock()
                    .expect("frames poisoned")
                    .add(f, proc.tid, vpage);
                drop(gate);
                f
            }
            None => match swap_out(vm, fs, procs, proc, spt, vpage, gate) {
                Some(f) => f,
                None => return false,
            },
        }
    };

    let info = spt.get_mut(vpage).expect("page vanished during load");
    match info.status {
        PageStatus::InMemory => unreachable!("loading a resident page"),
        PageStatus::InSwap => {
            let mut page = Box::new([0u8; PG_SIZE]);
            vm.swap
                .lock()
                .expect("swap poisoned")
                .read_page(info.offset, &mut page);
            let mut pool = vm.pool.lock().expect("pool poisoned");
            pool.bytes_mut(frame).copy_from_slice(&page[..]);
            info.offset = 0;
        }
        PageStatus::InFile => {
            let file = info.file.clone().expect("file-backed page without file");
            let read_bytes = info.read_bytes as usize;
            let mut page = Box::new([0u8; PG_SIZE]);
            if fs.read_at(&file, &mut page[..read_bytes], info.offset as usize) != read_bytes {
                release_frame(vm, frame);
                return false;
            }
            let mut pool = vm.pool.lock().expect("pool poisoned");
            pool.bytes_mut(frame).copy_from_slice(&page[..]);
        }
        PageStatus::GrowingStack => {
            let mut pool = vm.pool.lock().expect("pool poisoned");
            pool.bytes_mut(frame).fill(0);
            info.offset = 0;
        }
    }
    info.status = PageStatus::InMemory;
    let writable = info.writable;

    let mut pagedir = proc.lock_pagedir();
    if !pagedir.set_page(vpage, frame, writable) {
        drop(pagedir);
        release_frame(vm, frame);
        return false;
    }
    true
}

/// Returns a frame to the pool and drops its table record.
fn release_frame(vm: &Vm, frame: FrameId) {
    vm.frames.lock().expect("frames poisoned").remove(frame);
    vm.pool.lock().expect("pool poisoned").free(frame);
}

/// Selects a victim frame by second chance, saves its contents according
/// to the victim page's kind, clears the victim's translation, and hands
/// the frame over to the current process retargeted at `new_vpage`.
/// Called with the gate held and the current SPT locked; the gate is
/// released once the victim's fate no longer allows inversion.
fn swap_out(
    vm: &Vm,
    fs: &FileSys,
    procs: &ProcTable,
    cur: &Proc,
    cur_spt: &mut Spt,
    new_vpage: usize,
    gate: MutexGuard<'_, ()>,
) -> Option<FrameId> {
    let mut frames = vm.frames.lock().expect("frames poisoned");
    let old = loop {
        let cand = frames.candidate();
        let holder = procs
            .get(cand.holder)
            .expect("frame held by unknown process");
        // Second chance: a recently-used page gets its bit cleared and
        // one more trip around the list.
        let mut pagedir = holder.lock_pagedir();
        if pagedir.is_accessed(cand.vpage) {
            pagedir.set_accessed(cand.vpage, false);
            continue;
        }
        drop(pagedir);
        break frames.retarget(cand.frame, cur.tid, new_vpage);
    };

    // The victim's supplementary table; ours is already locked by the
    // caller when the victim is our own page.
    let victim_arc;
    let mut victim_guard;
    let victim_spt: &mut Spt = if old.holder == cur.tid {
        &mut *cur_spt
    } else {
        victim_arc = procs.get(old.holder).expect("victim process vanished");
        victim_guard = victim_arc.lock_spt();
        &mut *victim_guard
    };
    drop(frames);

    let info = victim_spt
        .get_mut(old.vpage)
        .expect("victim page not in its table");
    assert_eq!(info.status, PageStatus::InMemory);

    match info.kind {
        PageKind::ToSwap => {
            let mut swap = vm.swap.lock().expect("swap poisoned");
            drop(gate);
            let slot = match swap.alloc_slot() {
                Some(s) => s,
                None => return None,
            };
            let page = {
                let pool = vm.pool.lock().expect("pool poisoned");
                Box::new(*pool.bytes(old.frame))
            };
            swap.write_page(slot, &page);
            info.status = PageStatus::InSwap;
            info.offset = slot;
        }
        PageKind::ToFile => {
            drop(gate);
            let dirty = {
                let holder = procs.get(old.holder).expect("victim process vanished");
                let d = holder.lock_pagedir().is_dirty(old.vpage);
                d
            };
            if dirty {
                let file = info.file.clone().expect("file-backed page without file");
                let page = {
                    let pool = vm.pool.lock().expect("pool poisoned");
                    Box::new(*pool.bytes(old.frame))
                };
                fs.write_at(&file, &page[..info.read_bytes as usize], info.offset as usize);
            }
            info.status = PageStatus::InFile;
        }
        PageKind::ReadOnly => {
            // Always reloadable from the executable; no I/O.
            drop(gate);
            info.status = PageStatus::InFile;
        }
    }

    let holder = procs.get(old.holder).expect("victim process vanished");
    holder.lock_pagedir().clear_page(old.vpage);
    trace!(
        "vm: evicted page {:#x} of thread {} (frame {})",
        old.vpage,
        old.holder,
        old.frame
    );
    Some(old.frame)
}

/// Maps `pages` pages of `inode` starting at user address `base`, each
/// page recorded file-backed and written back to the file on eviction.
/// Fails when the range is bad or collides with existing pages.
pub fn map_file(proc: &Proc, inode: &Arc<Inode>, base: usize, length: usize) -> Option<usize> {
    if base == 0 || base % PG_SIZE != 0 || length == 0 {
        return None;
    }
    let pages = (length + PG_SIZE - 1) / PG_SIZE;
    if base + pages * PG_SIZE > USER_TOP {
        return None;
    }

    let mut spt = proc.lock_spt();
    for i in 0..pages {
        if spt.contains(base + i * PG_SIZE) {
            return None;
        }
    }
    for i in 0..pages {
        let offset = i * PG_SIZE;
        spt.insert(
            base + offset,
            PageInfo {
                status: PageStatus::InFile,
                kind: PageKind::ToFile,
                writable: true,
                file: Some(inode.clone()),
                offset: offset as u32,
                read_bytes: core::cmp::min(PG_SIZE, length - offset) as u32,
            },
        );
    }
    Some(pages)
}

/// Unmaps `pages` pages starting at `base`: resident dirty pages are
/// written back to the backing file, frames are returned, and the
/// entries disappear from the supplementary table.
pub fn unmap_file(vm: &Vm, fs: &FileSys, proc: &Proc, base: usize, pages: usize) {
    let _gate = vm.gate();
    let mut spt = proc.lock_spt();
    for i in 0..pages {
        let vpage = base + i * PG_SIZE;
        let info = match spt.remove(vpage) {
            Some(info) => info,
            None => continue,
        };
        if info.status != PageStatus::InMemory {
            continue;
        }
        let (frame, dirty) = {
            let mut pagedir = proc.lock_pagedir();
            let pte = pagedir.lookup(vpage).expect("resident page unmapped");
            let dirty = pagedir.is_dirty(vpage);
            pagedir.clear_page(vpage);
            (pte.frame, dirty)
        };
        if dirty {
            let file = info.file.as_ref().expect("mapping without file");
            let page = {
                let pool = vm.pool.lock().expect("pool poisoned");
                Box::new(*pool.bytes(frame))
            };
            fs.write_at(file, &page[..info.read_bytes as usize], info.offset as usize);
        }
        release_frame(vm, frame);
    }
}

/// Tears down all remaining user memory of an exiting process: swap
/// slots are freed and resident frames returned. Mappings must have
/// been unmapped (with write-back) beforehand.
pub fn destroy_user_memory(vm: &Vm, proc: &Proc) {
    let _gate = vm.gate();
    let mut spt = proc.lock_spt();
    for (vpage, info) in spt.take_all() {
        match info.status {
            PageStatus::InSwap => {
                vm.swap.lock().expect("swap poisoned").free_slot(info.offset);
            }
            PageStatus::InMemory => {
                let frame = {
                    let mut pagedir = proc.lock_pagedir();
                    let pte = pagedir.lookup(vpage).expect("resident page unmapped");
                    pagedir.clear_page(vpage);
                    pte.frame
                };
                release_frame(vm, frame);
            }
            PageStatus::InFile | PageStatus::GrowingStack => {}
        }
    }
}
