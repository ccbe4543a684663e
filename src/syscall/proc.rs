//! Process system calls: exec, wait, exit.

use std::sync::Arc;

use log::debug;

use crate::file::File;
use crate::kernel::Kernel;
use crate::param::{PG_SIZE, USER_CODE_BASE};
use crate::proc::Proc;
use crate::vm;
use crate::vm::page::{PageInfo, PageKind, PageStatus};

/// Exit status of a process killed by the kernel.
pub const KERNEL_TERMINATE: i32 = -1;

/// Terminates `proc` with `status`: prints the exit line, writes dirty
/// mappings back, releases user memory, swap slots and descriptors,
/// re-enables writes to the executable, and retires the record. Returns
/// `status` for the dispatcher.
pub fn do_exit(kernel: &Kernel, proc: &Arc<Proc>, status: i32) -> i32 {
    let line = format!("{}: exit({})\n", proc.name, status);
    kernel.console.write(line.as_bytes());
    debug!("proc {}: exit({})", proc.tid, status);

    let mappings: Vec<_> = {
        let mut info = proc.lock_info();
        core::mem::take(&mut info.mappings).into_values().collect()
    };
    for m in mappings {
        vm::unmap_file(&kernel.vm, &kernel.fs, proc, m.base, m.pages);
        kernel.fs.close_inode(m.inode);
    }
    vm::destroy_user_memory(&kernel.vm, proc);

    let (fds, executable) = {
        let mut info = proc.lock_info();
        (core::mem::take(&mut info.fds), info.executable.take())
    };
    for (_, file) in fds {
        file.close(&kernel.fs);
    }
    if let Some(exe) = executable {
        exe.close(&kernel.fs);
    }

    kernel.procs.retire(proc.tid, status);
    if kernel.sched.current() == proc.tid {
        kernel.sched.exit();
    }
    status
}

/// Spawns a process running the executable named by the first token of
/// `cmdline`. The image is mapped read-only, page by page, and paged in
/// on demand; writes to the file are denied while the process lives.
/// Returns the child pid, or -1.
pub fn exec(kernel: &Kernel, proc: &Arc<Proc>, cmdline: &str) -> i32 {
    let name = match cmdline.split_whitespace().next() {
        Some(n) => n,
        None => return -1,
    };
    let cwd = proc.lock_info().cwd;
    let mut exe = match File::open(&kernel.fs, cwd, name) {
        Some(f) => f,
        None => return -1,
    };
    if exe.is_dir() {
        exe.close(&kernel.fs);
        return -1;
    }
    let length = exe.len(&kernel.fs);
    if length <= 0 {
        exe.close(&kernel.fs);
        return -1;
    }
    exe.deny_write();

    let child = kernel.spawn_process(name);
    {
        let mut spt = child.lock_spt();
        let length = length as usize;
        let pages = (length + PG_SIZE - 1) / PG_SIZE;
        for i in 0..pages {
            let offset = i * PG_SIZE;
            spt.insert(
                USER_CODE_BASE + offset,
                PageInfo {
                    status: PageStatus::InFile,
                    kind: PageKind::ReadOnly,
                    writable: false,
                    file: Some(exe.inode().clone()),
                    offset: offset as u32,
                    read_bytes: core::cmp::min(PG_SIZE, length - offset) as u32,
                },
            );
        }
    }
    child.lock_info().executable = Some(exe);
    proc.lock_info().children.push(child.tid);
    debug!("proc {}: exec '{}' -> {}", proc.tid, name, child.tid);
    child.tid as i32
}

/// Waits for child `pid` to exit and returns its status; -1 when `pid`
/// is not an unwaited child. A child killed by the kernel reports -1.
pub fn wait(kernel: &Kernel, proc: &Arc<Proc>, pid: i32) -> i32 {
    if pid < 0 {
        return -1;
    }
    let pid = pid as usize;
    {
        let mut info = proc.lock_info();
        match info.children.iter().position(|&c| c == pid) {
            Some(pos) => {
                info.children.remove(pos);
            }
            None => return -1,
        }
    }
    if kernel.procs.is_alive(pid) {
        kernel.sched.wait_for_exit(pid);
    }
    kernel.procs.reap(pid).unwrap_or(KERNEL_TERMINATE)
}
