//! Paging scenarios: stack growth, swap pressure, mmap write-back, and
//! the syscall surface over simulated user memory.

use std::sync::Arc;
use std::time::Duration;

use tern_kernel::file::File;
use tern_kernel::hal::MemDisk;
use tern_kernel::kernel::{Kernel, KernelConfig};
use tern_kernel::param::{PG_SIZE, ROOT_DIR_SECTOR, STACK_MAX, USER_TOP};
use tern_kernel::syscall::{self, uaccess};
use tern_kernel::vm::{self, FaultResult};

fn boot(user_frames: usize) -> Kernel {
    let fs_dev = Arc::new(MemDisk::new(2048));
    let swap_dev = Arc::new(MemDisk::new(512));
    let config = KernelConfig {
        format: true,
        user_frames,
        flush_period: Duration::from_secs(60),
        ..KernelConfig::default()
    };
    Kernel::new(fs_dev, swap_dev, config).unwrap()
}

/// A push just below the stack pointer grows the stack by one page; a
/// touch below the 8 MiB ceiling is refused.
#[test]
fn stack_growth_bounds() {
    let kernel = boot(8);
    let proc = kernel.spawn_process("stacky");

    let esp = USER_TOP - PG_SIZE;
    let touch = esp - 4; // what `push` does
    let res = vm::handle_fault(
        &kernel.vm, &kernel.fs, &kernel.procs, &proc, touch, true, true, esp,
    );
    assert_eq!(res, FaultResult::Handled);
    assert_eq!(proc.lock_spt().len(), 1);
    assert_eq!(proc.lock_pagedir().installed(), 1);

    // One byte below the ceiling: terminate.
    let below = USER_TOP - STACK_MAX - 1;
    let res = vm::handle_fault(
        &kernel.vm, &kernel.fs, &kernel.procs, &proc, below, true, true, below,
    );
    assert_eq!(res, FaultResult::Kill);

    // A wild access far from the stack pointer is no growth either.
    let wild = USER_TOP / 2;
    let res = vm::handle_fault(
        &kernel.vm, &kernel.fs, &kernel.procs, &proc, wild, false, true, esp,
    );
    assert_eq!(res, FaultResult::Kill);
    kernel.halt();
}

/// Kernel-space addresses kill user accessors and signal the kernel
/// copy path.
#[test]
fn kernel_addresses_fault() {
    let kernel = boot(4);
    let proc = kernel.spawn_process("probe");
    let res = vm::handle_fault(
        &kernel.vm, &kernel.fs, &kernel.procs, &proc, USER_TOP + 8, false, true, USER_TOP,
    );
    assert_eq!(res, FaultResult::Kill);
    let res = vm::handle_fault(
        &kernel.vm, &kernel.fs, &kernel.procs, &proc, USER_TOP + 8, false, false, USER_TOP,
    );
    assert_eq!(res, FaultResult::KernelCopyFault);
    kernel.halt();
}

/// More stack pages than frames: the overflow is parked in swap and
/// comes back intact, with the swap bitmap agreeing with the
/// supplementary table at every step.
#[test]
fn swap_pressure_round_trip() {
    let kernel = boot(4);
    let proc = kernel.spawn_process("swapper");

    let pages = 6;
    for i in 1..=pages {
        let addr = USER_TOP - i * PG_SIZE;
        proc.lock_info().user_esp = addr;
        assert_eq!(
            uaccess::write_byte(&kernel, &proc, addr, i as u8),
            Some(()),
            "page {}",
            i
        );
    }

    // The pool is saturated and the rest live in swap.
    assert_eq!(kernel.vm.pool.lock().unwrap().in_use(), 4);
    assert_eq!(kernel.vm.frames.lock().unwrap().len(), 4);
    let in_swap = proc.lock_spt().in_swap_count();
    assert_eq!(in_swap, pages - 4);
    assert_eq!(kernel.vm.swap.lock().unwrap().used_slots(), in_swap);

    // Every page still holds its marker, wherever it went.
    for i in 1..=pages {
        let addr = USER_TOP - i * PG_SIZE;
        assert_eq!(uaccess::read_byte(&kernel, &proc, addr), Some(i as u8));
    }

    // The frame table mirrors the installed translations.
    assert_eq!(
        kernel.vm.frames.lock().unwrap().len(),
        proc.lock_pagedir().installed()
    );
    kernel.halt();
}

/// mmap a three-page file, dirty only the middle page, munmap: the file
/// shows the new middle page and the untouched neighbours.
#[test]
fn mmap_dirty_writeback() {
    let kernel = boot(8);
    let proc = kernel.spawn_process("mapper");

    let mut content = vec![0u8; 3 * PG_SIZE];
    for (i, b) in content.iter_mut().enumerate() {
        *b = (i % 199) as u8;
    }
    assert!(kernel.fs.create(ROOT_DIR_SECTOR, "mapped", 0));
    let mut f = File::open(&kernel.fs, ROOT_DIR_SECTOR, "mapped").unwrap();
    assert_eq!(f.write(&kernel.fs, &content), content.len());
    f.close(&kernel.fs);

    let (inode, _) = kernel.fs.open(ROOT_DIR_SECTOR, "mapped").unwrap();
    let base = 0x1000_0000;
    assert_eq!(vm::map_file(&proc, &inode, base, content.len()), Some(3));

    // Touch only page 1.
    let addr = base + PG_SIZE + 123;
    assert_eq!(uaccess::write_byte(&kernel, &proc, addr, 0xee), Some(()));

    vm::unmap_file(&kernel.vm, &kernel.fs, &proc, base, 3);
    kernel.fs.close_inode(inode);

    let mut back = vec![0u8; content.len()];
    let mut f = File::open(&kernel.fs, ROOT_DIR_SECTOR, "mapped").unwrap();
    assert_eq!(f.read(&kernel.fs, &mut back), back.len());
    f.close(&kernel.fs);

    let mut expected = content.clone();
    expected[PG_SIZE + 123] = 0xee;
    assert_eq!(back, expected);
    kernel.halt();
}

/// Overlapping or misaligned mappings are refused.
#[test]
fn mmap_rejects_bad_ranges() {
    let kernel = boot(4);
    let proc = kernel.spawn_process("mapper");

    assert!(kernel.fs.create(ROOT_DIR_SECTOR, "m", 100));
    let (inode, _) = kernel.fs.open(ROOT_DIR_SECTOR, "m").unwrap();

    assert_eq!(vm::map_file(&proc, &inode, 0, 100), None);
    assert_eq!(vm::map_file(&proc, &inode, 0x1000_0010, 100), None);
    assert_eq!(vm::map_file(&proc, &inode, 0x1000_0000, 100), Some(1));
    // Second mapping over the same page collides.
    assert_eq!(vm::map_file(&proc, &inode, 0x1000_0000, 100), None);

    vm::unmap_file(&kernel.vm, &kernel.fs, &proc, 0x1000_0000, 1);
    kernel.fs.close_inode(inode);
    kernel.halt();
}

/// Write a user stack, issue syscalls through the validated dispatcher,
/// and watch a bad pointer terminate the process with the exit line.
#[test]
fn syscall_dispatch_and_kill() {
    let kernel = boot(8);
    let proc = kernel.spawn_process("user");

    // Build a little user stack; the first write faults the page in.
    let esp = USER_TOP - 64;
    proc.lock_info().user_esp = USER_TOP - PG_SIZE;

    // create("notes", 256): the path lives on the stack too.
    let path_addr = esp + 32;
    for (i, &b) in b"notes\0".iter().enumerate() {
        assert_eq!(uaccess::write_byte(&kernel, &proc, path_addr + i, b), Some(()));
    }
    let push = |addr: usize, v: u32| {
        for (i, &b) in v.to_le_bytes().iter().enumerate() {
            uaccess::write_byte(&kernel, &proc, addr + i, b).unwrap();
        }
    };
    push(esp, syscall::SYS_CREATE);
    push(esp + 4, path_addr as u32);
    push(esp + 8, 256);
    assert_eq!(syscall::handle(&kernel, &proc, esp), Ok(1));

    // open + filesize through descriptors.
    push(esp, syscall::SYS_OPEN);
    push(esp + 4, path_addr as u32);
    let fd = syscall::handle(&kernel, &proc, esp).unwrap();
    assert!(fd >= 2);
    push(esp, syscall::SYS_FILESIZE);
    push(esp + 4, fd as u32);
    assert_eq!(syscall::handle(&kernel, &proc, esp), Ok(256));

    // write(fd, kernel_address, len) must kill the process with -1.
    push(esp, syscall::SYS_WRITE);
    push(esp + 4, fd as u32);
    push(esp + 8, (USER_TOP + 4096) as u32);
    push(esp + 12, 16);
    assert_eq!(syscall::handle(&kernel, &proc, esp), Err(-1));

    let console = String::from_utf8(kernel.console.contents()).unwrap();
    assert!(console.contains("user: exit(-1)\n"), "console: {:?}", console);
    assert!(!kernel.procs.is_alive(proc.tid));
    kernel.halt();
}

/// exec starts a child whose executable is write-protected; wait reaps
/// its status.
#[test]
fn exec_wait_round_trip() {
    let kernel = boot(8);
    // Step the boot thread out of the way so the processes get the CPU.
    kernel.sched.set_priority(1);
    let parent = kernel.spawn_process("parent");
    assert_eq!(kernel.sched.current(), parent.tid);

    // An "executable" is any file with bytes in it.
    assert!(kernel.fs.create(ROOT_DIR_SECTOR, "prog", 0));
    let mut f = File::open(&kernel.fs, ROOT_DIR_SECTOR, "prog").unwrap();
    assert_eq!(f.write(&kernel.fs, &[0x90u8; 600]), 600);
    f.close(&kernel.fs);

    let pid = {
        // Drive exec through the dispatcher-level helper.
        let esp = USER_TOP - 64;
        parent.lock_info().user_esp = USER_TOP - PG_SIZE;
        for (i, &b) in b"prog arg\0".iter().enumerate() {
            assert_eq!(uaccess::write_byte(&kernel, &parent, esp + 32 + i, b), Some(()));
        }
        let push = |addr: usize, v: u32| {
            for (i, &b) in v.to_le_bytes().iter().enumerate() {
                uaccess::write_byte(&kernel, &parent, addr + i, b).unwrap();
            }
        };
        push(esp, syscall::SYS_EXEC);
        push(esp + 4, (esp + 32) as u32);
        syscall::handle(&kernel, &parent, esp).unwrap()
    };
    assert!(pid > 0);
    let child = kernel.procs.get(pid as usize).unwrap();

    // Writing to a running executable is denied.
    let mut w = File::open(&kernel.fs, ROOT_DIR_SECTOR, "prog").unwrap();
    assert_eq!(w.write(&kernel.fs, b"overwrite"), 0);
    w.close(&kernel.fs);

    // Let the child run and exit with status 42.
    kernel.sched.yield_now();
    assert_eq!(kernel.sched.current(), child.tid);
    syscall::do_exit(&kernel, &child, 42);
    assert_eq!(kernel.sched.current(), parent.tid);

    assert_eq!(syscall::wait(&kernel, &parent, pid), 42);
    // A second wait on the same child fails.
    assert_eq!(syscall::wait(&kernel, &parent, pid), -1);

    // With the child gone, the executable is writable again.
    let mut w = File::open(&kernel.fs, ROOT_DIR_SECTOR, "prog").unwrap();
    assert_eq!(w.write(&kernel.fs, b"overwrite"), 9);
    w.close(&kernel.fs);

    let console = String::from_utf8(kernel.console.contents()).unwrap();
    assert!(console.contains("prog: exit(42)\n"));
    kernel.halt();
}
