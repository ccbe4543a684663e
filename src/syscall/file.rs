//! File system calls.
//!
//! Descriptors 0 and 1 are the console; real files start at 2. All
//! user buffers arriving here have not been validated yet: `read`,
//! `write` and `readdir` probe the full range before touching any
//! state, and report `None` when the probe fails so the dispatcher can
//! terminate the process.

use std::sync::Arc;

use crate::file::File;
use crate::kernel::Kernel;
use crate::param::NAME_MAX;
use crate::proc::{Mapping, Proc};
use crate::syscall::uaccess;
use crate::vm;

pub fn create(kernel: &Kernel, proc: &Arc<Proc>, path: &str, size: u32) -> i32 {
    let cwd = proc.lock_info().cwd;
    kernel.fs.create(cwd, path, size) as i32
}

pub fn remove(kernel: &Kernel, proc: &Arc<Proc>, path: &str) -> i32 {
    let cwd = proc.lock_info().cwd;
    kernel.fs.remove(cwd, path) as i32
}

pub fn open(kernel: &Kernel, proc: &Arc<Proc>, path: &str) -> i32 {
    let cwd = proc.lock_info().cwd;
    let file = match File::open(&kernel.fs, cwd, path) {
        Some(f) => f,
        None => return -1,
    };
    let mut info = proc.lock_info();
    let fd = info.next_fd;
    info.next_fd += 1;
    info.fds.insert(fd, file);
    fd
}

pub fn filesize(kernel: &Kernel, proc: &Arc<Proc>, fd: i32) -> i32 {
    let info = proc.lock_info();
    info.fds.get(&fd).map_or(-1, |f| f.len(&kernel.fs))
}

/// `None` = invalid buffer; the caller kills the process.
pub fn read(kernel: &Kernel, proc: &Arc<Proc>, fd: i32, buf: usize, n: usize) -> Option<i32> {
    if !uaccess::probe_range(kernel, proc, buf, n, true) {
        return None;
    }
    if fd == 0 {
        // No console input stream is modelled.
        return Some(0);
    }
    let mut data = vec![0u8; n];
    let got = {
        let mut info = proc.lock_info();
        let file = match info.fds.get_mut(&fd) {
            Some(f) if !f.is_dir() => f,
            _ => return Some(-1),
        };
        file.read(&kernel.fs, &mut data)
    };
    uaccess::copy_out(kernel, proc, buf, &data[..got])?;
    Some(got as i32)
}

/// `None` = invalid buffer; the caller kills the process.
pub fn write(kernel: &Kernel, proc: &Arc<Proc>, fd: i32, buf: usize, n: usize) -> Option<i32> {
    let data = uaccess::copy_in(kernel, proc, buf, n)?;
    if fd == 1 {
        kernel.console.write(&data);
        return Some(n as i32);
    }
    let mut info = proc.lock_info();
    let file = match info.fds.get_mut(&fd) {
        Some(f) if !f.is_dir() => f,
        _ => return Some(-1),
    };
    Some(file.write(&kernel.fs, &data) as i32)
}

pub fn seek(_kernel: &Kernel, proc: &Arc<Proc>, fd: i32, pos: usize) {
    if let Some(file) = proc.lock_info().fds.get_mut(&fd) {
        file.seek(pos);
    }
}

pub fn tell(_kernel: &Kernel, proc: &Arc<Proc>, fd: i32) -> i32 {
    proc.lock_info().fds.get(&fd).map_or(-1, |f| f.tell() as i32)
}

pub fn close(kernel: &Kernel, proc: &Arc<Proc>, fd: i32) {
    let file = proc.lock_info().fds.remove(&fd);
    if let Some(file) = file {
        file.close(&kernel.fs);
    }
}

pub fn mmap(kernel: &Kernel, proc: &Arc<Proc>, fd: i32, addr: usize) -> i32 {
    let (inode, length) = {
        let info = proc.lock_info();
        let file = match info.fds.get(&fd) {
            Some(f) if !f.is_dir() => f,
            _ => return -1,
        };
        let len = file.len(&kernel.fs);
        if len <= 0 {
            return -1;
        }
        (file.inode().clone(), len as usize)
    };
    let inode = match kernel.fs.reopen_inode(&inode) {
        Some(i) => i,
        None => return -1,
    };
    // The reference taken by reopen must not leak if the mapping is
    // refused.
    let inode = scopeguard::guard(inode, |i| kernel.fs.close_inode(i));
    let pages = match vm::map_file(proc, &inode, addr, length) {
        Some(p) => p,
        None => return -1,
    };
    let inode = scopeguard::ScopeGuard::into_inner(inode);
    let mut info = proc.lock_info();
    let mapid = info.next_mapid;
    info.next_mapid += 1;
    info.mappings.insert(
        mapid,
        Mapping {
            inode,
            base: addr,
            pages,
        },
    );
    mapid
}

pub fn munmap(kernel: &Kernel, proc: &Arc<Proc>, mapid: i32) {
    let mapping = proc.lock_info().mappings.remove(&mapid);
    if let Some(m) = mapping {
        vm::unmap_file(&kernel.vm, &kernel.fs, proc, m.base, m.pages);
        kernel.fs.close_inode(m.inode);
    }
}

pub fn chdir(kernel: &Kernel, proc: &Arc<Proc>, path: &str) -> i32 {
    let cwd = proc.lock_info().cwd;
    match kernel.fs.chdir(cwd, path) {
        Some(sector) => {
            proc.lock_info().cwd = sector;
            1
        }
        None => 0,
    }
}

pub fn mkdir(kernel: &Kernel, proc: &Arc<Proc>, path: &str) -> i32 {
    let cwd = proc.lock_info().cwd;
    kernel.fs.mkdir(cwd, path) as i32
}

/// `None` = invalid name buffer; the caller kills the process.
pub fn readdir(kernel: &Kernel, proc: &Arc<Proc>, fd: i32, name_ptr: usize) -> Option<i32> {
    if !uaccess::probe_range(kernel, proc, name_ptr, NAME_MAX + 1, true) {
        return None;
    }
    let entry = {
        let mut info = proc.lock_info();
        let file = match info.fds.get_mut(&fd) {
            Some(f) if f.is_dir() => f,
            _ => return Some(0),
        };
        file.readdir(&kernel.fs)
    };
    match entry {
        Some(name) => {
            let mut bytes = name.into_bytes();
            bytes.push(0);
            uaccess::copy_out(kernel, proc, name_ptr, &bytes)?;
            Some(1)
        }
        None => Some(0),
    }
}

pub fn isdir(_kernel: &Kernel, proc: &Arc<Proc>, fd: i32) -> i32 {
    proc.lock_info().fds.get(&fd).map_or(0, |f| f.is_dir() as i32)
}

pub fn inumber(_kernel: &Kernel, proc: &Arc<Proc>, fd: i32) -> i32 {
    proc.lock_info().fds.get(&fd).map_or(-1, |f| f.inumber() as i32)
}
