/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector pointers that fit in one sector.
pub const SECTOR_PTRS: usize = SECTOR_SIZE / 4;

/// Direct sector pointers in an on-disk inode.
pub const NDIRECT: usize = 120;

/// Singly-indirect pointers in an on-disk inode.
pub const NSINGLY: usize = 4;

/// Largest file, in sectors: direct + singly + one doubly-indirect tree.
pub const MAXFILE: usize = NDIRECT + NSINGLY * SECTOR_PTRS + SECTOR_PTRS * SECTOR_PTRS;

/// Size of the disk block cache.
pub const NBUF: usize = 64;

/// Sector of the free-map inode. Doubles as the "no next sector"
/// read-ahead sentinel, so it is never prefetched.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Bytes of a directory entry name.
pub const NAME_MAX: usize = 14;

/// Maximum length of a thread name.
pub const THREAD_NAME_MAX: usize = 16;

/// Size of a user page in bytes.
pub const PG_SIZE: usize = 4096;

/// Sectors per user page.
pub const PAGE_SECTORS: usize = PG_SIZE / SECTOR_SIZE;

/// Lowest thread priority.
pub const PRI_MIN: i32 = 0;

/// Default thread priority.
pub const PRI_DEFAULT: i32 = 31;

/// Highest thread priority.
pub const PRI_MAX: i32 = 63;

/// Timer ticks each thread gets before round-robin preemption.
pub const TIME_SLICE: i64 = 4;

/// Timer frequency; the MLFQS second boundary.
pub const TICKS_PER_SEC: i64 = 100;

/// Bound on the length of a priority-donation chain.
pub const DONATION_DEPTH: usize = 8;

/// Locks a single thread may hold at once.
pub const NLOCKHOLD: usize = 16;

/// Top of the user address space.
pub const USER_TOP: usize = 0xc000_0000;

/// Where executable images are mapped.
pub const USER_CODE_BASE: usize = 0x0804_8000;

/// The stack may grow to at most this far below `USER_TOP`.
pub const STACK_MAX: usize = 0x80_0000;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Console writes are split into chunks of this many bytes.
pub const CONSOLE_CHUNK: usize = 1024;

/// Default number of frames in the user pool.
pub const USER_FRAMES: usize = 64;

/// Default write-behind flush period, in milliseconds.
pub const WRITE_BEHIND_MS: u64 = 5000;
