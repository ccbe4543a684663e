//! System call surface.
//!
//! Arguments are passed 32-bit at a time on the user stack; the handler
//! fetches the number and each argument with fault-safe loads and
//! validates every pointer, and every byte of every buffer, before any
//! state-changing call. A validation failure terminates the process with
//! status -1 rather than returning an error.

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::param::PG_SIZE;
use crate::proc::Proc;

mod file;
mod proc;
pub mod uaccess;

pub use proc::{do_exit, exec, wait, KERNEL_TERMINATE};

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_MMAP: u32 = 13;
pub const SYS_MUNMAP: u32 = 14;
pub const SYS_CHDIR: u32 = 15;
pub const SYS_MKDIR: u32 = 16;
pub const SYS_READDIR: u32 = 17;
pub const SYS_ISDIR: u32 = 18;
pub const SYS_INUMBER: u32 = 19;

/// Longest accepted string argument (paths and command lines).
const STR_MAX: usize = PG_SIZE;

/// `Ok(value)` is the syscall's return value; `Err(status)` means the
/// process was terminated while handling it.
pub type SysResult = Result<i32, i32>;

/// Dispatches the system call whose number and arguments sit on the
/// user stack at `esp`.
pub fn handle(kernel: &Kernel, proc: &Arc<Proc>, esp: usize) -> SysResult {
    // Remember where the user stack was, for faults taken in kernel
    // mode while probing user buffers.
    proc.lock_info().user_esp = esp;

    macro_rules! take {
        ($e:expr) => {
            match $e {
                Some(v) => v,
                None => return Err(proc::do_exit(kernel, proc, KERNEL_TERMINATE)),
            }
        };
    }

    let nr = take!(uaccess::read_u32(kernel, proc, esp));
    let arg = |i: usize| esp + 4 + 4 * i;

    match nr {
        SYS_HALT => {
            kernel.halt();
            Err(0)
        }
        SYS_EXIT => {
            let status = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            Err(proc::do_exit(kernel, proc, status))
        }
        SYS_EXEC => {
            let ptr = take!(uaccess::read_u32(kernel, proc, arg(0))) as usize;
            let cmdline = take!(uaccess::read_cstr(kernel, proc, ptr, STR_MAX));
            Ok(proc::exec(kernel, proc, &cmdline))
        }
        SYS_WAIT => {
            let pid = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            Ok(proc::wait(kernel, proc, pid))
        }
        SYS_CREATE => {
            let ptr = take!(uaccess::read_u32(kernel, proc, arg(0))) as usize;
            let size = take!(uaccess::read_u32(kernel, proc, arg(1)));
            let path = take!(uaccess::read_cstr(kernel, proc, ptr, STR_MAX));
            Ok(file::create(kernel, proc, &path, size))
        }
        SYS_REMOVE => {
            let ptr = take!(uaccess::read_u32(kernel, proc, arg(0))) as usize;
            let path = take!(uaccess::read_cstr(kernel, proc, ptr, STR_MAX));
            Ok(file::remove(kernel, proc, &path))
        }
        SYS_OPEN => {
            let ptr = take!(uaccess::read_u32(kernel, proc, arg(0))) as usize;
            let path = take!(uaccess::read_cstr(kernel, proc, ptr, STR_MAX));
            Ok(file::open(kernel, proc, &path))
        }
        SYS_FILESIZE => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            Ok(file::filesize(kernel, proc, fd))
        }
        SYS_READ => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            let buf = take!(uaccess::read_u32(kernel, proc, arg(1))) as usize;
            let n = take!(uaccess::read_u32(kernel, proc, arg(2))) as usize;
            match file::read(kernel, proc, fd, buf, n) {
                Some(v) => Ok(v),
                None => Err(proc::do_exit(kernel, proc, KERNEL_TERMINATE)),
            }
        }
        SYS_WRITE => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            let buf = take!(uaccess::read_u32(kernel, proc, arg(1))) as usize;
            let n = take!(uaccess::read_u32(kernel, proc, arg(2))) as usize;
            match file::write(kernel, proc, fd, buf, n) {
                Some(v) => Ok(v),
                None => Err(proc::do_exit(kernel, proc, KERNEL_TERMINATE)),
            }
        }
        SYS_SEEK => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            let pos = take!(uaccess::read_u32(kernel, proc, arg(1))) as usize;
            file::seek(kernel, proc, fd, pos);
            Ok(0)
        }
        SYS_TELL => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            Ok(file::tell(kernel, proc, fd))
        }
        SYS_CLOSE => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            file::close(kernel, proc, fd);
            Ok(0)
        }
        SYS_MMAP => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            let addr = take!(uaccess::read_u32(kernel, proc, arg(1))) as usize;
            Ok(file::mmap(kernel, proc, fd, addr))
        }
        SYS_MUNMAP => {
            let mapid = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            file::munmap(kernel, proc, mapid);
            Ok(0)
        }
        SYS_CHDIR => {
            let ptr = take!(uaccess::read_u32(kernel, proc, arg(0))) as usize;
            let path = take!(uaccess::read_cstr(kernel, proc, ptr, STR_MAX));
            Ok(file::chdir(kernel, proc, &path))
        }
        SYS_MKDIR => {
            let ptr = take!(uaccess::read_u32(kernel, proc, arg(0))) as usize;
            let path = take!(uaccess::read_cstr(kernel, proc, ptr, STR_MAX));
            Ok(file::mkdir(kernel, proc, &path))
        }
        SYS_READDIR => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            let ptr = take!(uaccess::read_u32(kernel, proc, arg(1))) as usize;
            match file::readdir(kernel, proc, fd, ptr) {
                Some(v) => Ok(v),
                None => Err(proc::do_exit(kernel, proc, KERNEL_TERMINATE)),
            }
        }
        SYS_ISDIR => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            Ok(file::isdir(kernel, proc, fd))
        }
        SYS_INUMBER => {
            let fd = take!(uaccess::read_u32(kernel, proc, arg(0))) as i32;
            Ok(file::inumber(kernel, proc, fd))
        }
        _ => Err(proc::do_exit(kernel, proc, KERNEL_TERMINATE)),
    }
}
