//! Kernel assembly.
//!
//! One `Kernel` value owns every subsystem: the file system (buffer
//! cache, free map, inode table), the scheduler, the paging core, the
//! process table and the console. Construction is the initialisation
//! barrier: by the time `Kernel::new` returns, every subsystem is ready
//! for use from any thread. `halt` is the shutdown barrier and flushes
//! the file system.

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::fs::FileSys;
use crate::hal::{BlockDevice, Console};
use crate::param::{PRI_DEFAULT, USER_FRAMES, USER_TOP, WRITE_BEHIND_MS};
use crate::proc::{Proc, ProcTable};
use crate::sched::Scheduler;
use crate::vm::Vm;

/// Boot options.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// `-o mlfqs`: use the multi-level feedback queue scheduler.
    pub mlfqs: bool,
    /// `format`: format the file system device at boot.
    pub format: bool,
    /// Write-behind flush period.
    pub flush_period: Duration,
    /// Size of the user frame pool.
    pub user_frames: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            mlfqs: false,
            format: false,
            flush_period: Duration::from_millis(WRITE_BEHIND_MS),
            user_frames: USER_FRAMES,
        }
    }
}

impl KernelConfig {
    /// Parses a boot command line, e.g. `"-o mlfqs format"`.
    pub fn parse(cmdline: &str) -> KernelConfig {
        let mut config = KernelConfig::default();
        let mut args = cmdline.split_whitespace().peekable();
        while let Some(arg) = args.next() {
            match arg {
                "-o" => {
                    if args.peek() == Some(&"mlfqs") {
                        args.next();
                        config.mlfqs = true;
                    }
                }
                "format" => config.format = true,
                _ => {}
            }
        }
        config
    }
}

/// The assembled kernel.
pub struct Kernel {
    pub config: KernelConfig,
    pub fs: FileSys,
    pub sched: Scheduler,
    pub vm: Vm,
    pub procs: ProcTable,
    pub console: Console,
}

impl Kernel {
    /// Boots over a file system device and a swap device.
    pub fn new(
        fs_dev: Arc<dyn BlockDevice>,
        swap_dev: Arc<dyn BlockDevice>,
        config: KernelConfig,
    ) -> Result<Kernel, ()> {
        let fs = FileSys::new(fs_dev, config.format, config.flush_period)?;
        let kernel = Kernel {
            sched: Scheduler::new(config.mlfqs),
            vm: Vm::new(swap_dev, config.user_frames),
            procs: ProcTable::new(),
            console: Console::new(),
            fs,
            config,
        };
        info!(
            "kernel: up (mlfqs={}, user frames={})",
            kernel.config.mlfqs, kernel.config.user_frames
        );
        Ok(kernel)
    }

    /// Creates a user process record on a fresh thread and registers it.
    /// The new process starts with an empty address space whose stack
    /// materialises at the first fault under [`USER_TOP`].
    pub fn spawn_process(&self, name: &str) -> Arc<Proc> {
        let tid = self.sched.create(name, PRI_DEFAULT);
        let proc = Arc::new(Proc::new(tid, name));
        proc.lock_info().user_esp = USER_TOP;
        self.procs.insert(proc.clone());
        proc
    }

    /// Shuts the kernel down, flushing all file system state.
    pub fn halt(&self) {
        info!("kernel: halting");
        self.fs.done();
    }
}
