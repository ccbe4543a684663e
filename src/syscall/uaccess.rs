//! Fault-safe user memory access.
//!
//! The kernel may only touch user addresses through these functions.
//! Each access walks the process's page directory like the MMU would,
//! maintaining the accessed and dirty bits, and routes misses through
//! the page fault handler in kernel mode: a fault the handler cannot
//! satisfy surfaces as `None` here instead of terminating anything, so
//! the syscall layer can fail the call cleanly.

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::param::PG_SIZE;
use crate::proc::Proc;
use crate::vm::pagedir::PteFlags;
use crate::vm::{self, FaultResult};

/// Translates one user address, demand-paging on a miss. Returns the
/// frame and the offset within it.
fn translate(kernel: &Kernel, proc: &Arc<Proc>, addr: usize, write: bool) -> Option<(usize, usize)> {
    // One fault attempt: either the translation exists afterwards or the
    // address is bad.
    for _ in 0..2 {
        {
            let mut pagedir = proc.lock_pagedir();
            let vpage = vm::page_base(addr);
            if let Some(pte) = pagedir.lookup(vpage) {
                if !write || pte.flags.contains(PteFlags::WRITABLE) {
                    pagedir.set_accessed(vpage, true);
                    if write {
                        pagedir.set_dirty(vpage, true);
                    }
                    return Some((pte.frame, addr % PG_SIZE));
                }
            }
        }
        let esp = proc.lock_info().user_esp;
        match vm::handle_fault(
            &kernel.vm,
            &kernel.fs,
            &kernel.procs,
            proc,
            addr,
            write,
            false,
            esp,
        ) {
            FaultResult::Handled => continue,
            _ => return None,
        }
    }
    None
}

/// Reads one byte of user memory.
pub fn read_byte(kernel: &Kernel, proc: &Arc<Proc>, addr: usize) -> Option<u8> {
    let (frame, offset) = translate(kernel, proc, addr, false)?;
    let pool = kernel.vm.pool.lock().expect("pool poisoned");
    Some(pool.bytes(frame)[offset])
}

/// Writes one byte of user memory.
pub fn write_byte(kernel: &Kernel, proc: &Arc<Proc>, addr: usize, value: u8) -> Option<()> {
    let (frame, offset) = translate(kernel, proc, addr, true)?;
    let mut pool = kernel.vm.pool.lock().expect("pool poisoned");
    pool.bytes_mut(frame)[offset] = value;
    Some(())
}

/// Reads a little-endian u32, possibly straddling a page boundary.
pub fn read_u32(kernel: &Kernel, proc: &Arc<Proc>, addr: usize) -> Option<u32> {
    let mut raw = [0u8; 4];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = read_byte(kernel, proc, addr + i)?;
    }
    Some(u32::from_le_bytes(raw))
}

/// Checks that every byte of `[addr, addr + len)` can be accessed with
/// the given intent, paging the range in as a side effect. Validation
/// happens per page; an empty range is fine.
pub fn probe_range(kernel: &Kernel, proc: &Arc<Proc>, addr: usize, len: usize, write: bool) -> bool {
    if len == 0 {
        return true;
    }
    let end = match addr.checked_add(len - 1) {
        Some(e) => e,
        None => return false,
    };
    let mut page = vm::page_base(addr);
    loop {
        if translate(kernel, proc, page.max(addr), write).is_none() {
            return false;
        }
        if page >= vm::page_base(end) {
            return true;
        }
        page += PG_SIZE;
    }
}

/// Copies `len` validated bytes out of user memory.
pub fn copy_in(kernel: &Kernel, proc: &Arc<Proc>, addr: usize, len: usize) -> Option<Vec<u8>> {
    if !probe_range(kernel, proc, addr, len, false) {
        return None;
    }
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        out.push(read_byte(kernel, proc, addr + i)?);
    }
    Some(out)
}

/// Copies bytes into validated user memory.
pub fn copy_out(kernel: &Kernel, proc: &Arc<Proc>, addr: usize, bytes: &[u8]) -> Option<()> {
    if !probe_range(kernel, proc, addr, bytes.len(), true) {
        return None;
    }
    for (i, &b) in bytes.iter().enumerate() {
        write_byte(kernel, proc, addr + i, b)?;
    }
    Some(())
}

/// Reads a NUL-terminated string of at most `max` bytes.
pub fn read_cstr(kernel: &Kernel, proc: &Arc<Proc>, addr: usize, max: usize) -> Option<String> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let b = read_byte(kernel, proc, addr + i)?;
        if b == 0 {
            return String::from_utf8(bytes).ok();
        }
        bytes.push(b);
    }
    None
}
