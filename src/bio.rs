//! Buffer cache.
//!
//! The buffer cache is a bounded set of buffers holding cached copies of
//! disk sector contents. Caching sectors in memory reduces the number of
//! disk reads and also provides a synchronization point for sectors used
//! by multiple threads.
//!
//! Interface:
//! * To read part of a sector, call `read`; a non-sentinel `next` hint
//!   schedules an asynchronous prefetch of the following sector.
//! * To write part of a sector, call `write`; the sector becomes dirty in
//!   memory and reaches the disk via write-behind, eviction, or `done`.
//! * When a sector's inode is deleted, call `remove` so the buffer can be
//!   recycled without write-back.
//! * Call `done` exactly once at shutdown; it stops the daemons and
//!   flushes everything dirty.
//!
//! Each buffer carries two independent locks. `meta` guards the
//! identification and state of the buffer (`sector`, `dirty`, `ready`,
//! `removed`, `holders`) and is only ever held briefly; its condition
//! variable announces `ready` flipping true once a disk load completes.
//! The payload lives under a reader-writer lock: in-memory writes and the
//! reload after eviction take it exclusively, while copy-outs and disk
//! write-back take it shared. Holding the payload lock without `meta`
//! lets lookups of other sectors, and concurrent readers of this one,
//! proceed during disk I/O.
//!
//! A buffer with `holders > 0` is pinned: eviction only considers buffers
//! with no holders and a completed load. The only lock nesting in this
//! module is `meta` followed by the payload lock (flush paths); all other
//! uses are sequential, which keeps the module deadlock-free.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};

use crate::hal::BlockDevice;
use crate::lock::{SleepLock, SleepableLock};
use crate::param::{NBUF, SECTOR_SIZE};

/// Read-ahead hint meaning "there is no next sector".
///
/// Sector 0 holds the free-map inode, so it is never a legitimate
/// prefetch target.
pub const EOF_SENTINEL: u32 = 0;

/// Buffer state guarded by the `meta` lock.
struct BufMeta {
    /// Sector currently cached in this buffer.
    sector: u32,
    /// Modified in memory but not yet on disk?
    dirty: bool,
    /// Has the payload been loaded from disk? While false, the payload
    /// must not be observed; waiters sleep on the `meta` condition.
    ready: bool,
    /// Sector belongs to a deleted inode; recycle without write-back.
    removed: bool,
    /// Active readers/writers. Non-zero forbids eviction.
    holders: u32,
}

/// One sector's worth of cached payload.
#[repr(align(4))]
pub struct BufData(pub [u8; SECTOR_SIZE]);

/// A cache buffer: metadata plus payload, separately locked.
struct BufEntry {
    meta: SleepableLock<BufMeta>,
    data: RwLock<BufData>,
}

impl BufEntry {
    fn new(sector: u32, hold: bool) -> Self {
        Self {
            meta: SleepableLock::new(
                "buf_meta",
                BufMeta {
                    sector,
                    dirty: false,
                    ready: false,
                    removed: false,
                    holders: hold as u32,
                },
            ),
            data: RwLock::new(BufData([0; SECTOR_SIZE])),
        }
    }
}

/// The buffer list plus the roving eviction cursor.
struct CacheList {
    entries: Vec<Arc<BufEntry>>,
    cursor: usize,
}

/// Pending read-ahead requests and the daemon shutdown flag.
struct ReadAhead {
    pending: VecDeque<u32>,
    done: bool,
}

/// Shutdown handshake flag for the write-behind and timer daemons.
struct DaemonFlag {
    done: bool,
}

struct Shared {
    disk: Arc<dyn BlockDevice>,
    list: SleepLock<CacheList>,
    read_ahead: SleepableLock<ReadAhead>,
    write_behind: SleepableLock<DaemonFlag>,
    timer: SleepableLock<DaemonFlag>,
    period: Duration,
}

/// A write-back cache of [`NBUF`] sectors over a block device, with
/// read-ahead and write-behind daemons.
pub struct BufferCache {
    shared: Arc<Shared>,
    daemons: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Returns the buffer caching `sector`, loading it from disk on a
    /// miss. With `hold` the buffer's holder count is incremented before
    /// the buffer is returned, pinning it against eviction; callers must
    /// pair that with `epilogue`.
    fn find(&self, sector: u32, hold: bool) -> Arc<BufEntry> {
        let mut i = 0;
        loop {
            let entry = {
                let mut list = self.list.lock();
                if i >= list.entries.len() {
                    // Miss: every buffer has been examined, and additions
                    // only ever append, so nothing was skipped.
                    if list.entries.len() < NBUF {
                        let entry = Arc::new(BufEntry::new(sector, hold));
                        list.entries.push(entry.clone());
                        drop(list);
                        self.load(&entry, sector);
                        return entry;
                    }
                    let entry = self.evict(&mut *list, sector, hold);
                    drop(list);
                    self.load(&entry, sector);
                    return entry;
                }
                list.entries[i].clone()
            };
            let mut meta = entry.meta.lock();
            if meta.sector == sector {
                if hold {
                    meta.holders += 1;
                }
                while !meta.ready {
                    meta.sleep();
                }
                drop(meta);
                return entry;
            }
            drop(meta);
            i += 1;
        }
    }

    /// Picks a victim with the roving cursor, writes its old contents
    /// back if needed, and hands the buffer over retargeted to `sector`
    /// with `ready` still false. Called with the list lock held; the
    /// caller performs the reload.
    fn evict(&self, list: &mut CacheList, sector: u32, hold: bool) -> Arc<BufEntry> {
        loop {
            if list.cursor >= list.entries.len() {
                list.cursor = 0;
            }
            let entry = list.entries[list.cursor].clone();
            list.cursor += 1;

            let mut meta = entry.meta.lock();
            if meta.holders != 0 || !meta.ready {
                continue;
            }
            let old_sector = meta.sector;
            let was_dirty = meta.dirty;
            let was_removed = meta.removed;
            meta.sector = sector;
            meta.ready = false;
            meta.dirty = false;
            meta.removed = false;
            meta.holders = hold as u32;
            if was_removed {
                // The old inode is gone; its bytes are not worth a write.
                drop(meta);
                trace!("bio: recycle removed sector {} for {}", old_sector, sector);
                return entry;
            }
            if was_dirty {
                // Take the payload shared before dropping `meta` so an
                // in-memory writer of the new sector cannot slip in ahead
                // of the snapshot; readers of this buffer are excluded by
                // `ready == false` anyway.
                let data = entry.data.read().expect("buf data poisoned");
                drop(meta);
                trace!("bio: evict dirty {} for {}", old_sector, sector);
                self.disk.write_sector(old_sector, &data.0);
                drop(data);
                return entry;
            }
            drop(meta);
            trace!("bio: evict clean {} for {}", old_sector, sector);
            return entry;
        }
    }

    /// Loads `sector` into a buffer whose `ready` flag is false, then
    /// publishes it to any waiters.
    fn load(&self, entry: &BufEntry, sector: u32) {
        {
            let mut data = entry.data.write().expect("buf data poisoned");
            self.disk.read_sector(sector, &mut data.0);
        }
        let mut meta = entry.meta.lock();
        meta.ready = true;
        meta.wakeup();
    }

    /// Drops one hold on a buffer.
    fn epilogue(&self, entry: &BufEntry) {
        let mut meta = entry.meta.lock();
        assert!(meta.holders > 0, "bio: epilogue without hold");
        meta.holders -= 1;
    }

    /// One write-behind pass: flush every dirty, ready, live buffer,
    /// clearing `dirty` before the I/O so that writers racing with the
    /// flush re-mark the buffer.
    fn flush_pass(&self) {
        let mut i = 0;
        loop {
            let entry = {
                let list = self.list.lock();
                if i >= list.entries.len() {
                    return;
                }
                list.entries[i].clone()
            };
            i += 1;

            let mut meta = entry.meta.lock();
            if meta.ready && meta.dirty && !meta.removed {
                meta.dirty = false;
                let sector = meta.sector;
                let data = entry.data.read().expect("buf data poisoned");
                drop(meta);
                self.disk.write_sector(sector, &data.0);
            }
        }
    }
}

impl BufferCache {
    /// Creates the cache over `disk` and starts the daemons. `period` is
    /// the write-behind flush interval.
    pub fn new(disk: Arc<dyn BlockDevice>, period: Duration) -> Self {
        let shared = Arc::new(Shared {
            disk,
            list: SleepLock::new(
                "buffer_cache",
                CacheList {
                    entries: Vec::new(),
                    cursor: 0,
                },
            ),
            read_ahead: SleepableLock::new(
                "read_ahead",
                ReadAhead {
                    pending: VecDeque::new(),
                    done: false,
                },
            ),
            write_behind: SleepableLock::new("write_behind", DaemonFlag { done: false }),
            timer: SleepableLock::new("flush_timer", DaemonFlag { done: false }),
            period,
        });

        let mut daemons = Vec::new();
        let s = shared.clone();
        daemons.push(
            thread::Builder::new()
                .name("read-ahead".into())
                .spawn(move || read_ahead_daemon(&s))
                .expect("spawn read-ahead"),
        );
        let s = shared.clone();
        daemons.push(
            thread::Builder::new()
                .name("write-behind".into())
                .spawn(move || write_behind_daemon(&s))
                .expect("spawn write-behind"),
        );
        let s = shared.clone();
        daemons.push(
            thread::Builder::new()
                .name("flush-timer".into())
                .spawn(move || timer_daemon(&s))
                .expect("spawn flush-timer"),
        );

        Self {
            shared,
            daemons: Mutex::new(daemons),
        }
    }

    /// Copies `length` bytes at `offset` within `sector` into `dst`.
    /// When `next` is not [`EOF_SENTINEL`], the following sector is
    /// queued for read-ahead after the copy.
    pub fn read(&self, sector: u32, next: u32, offset: usize, length: usize, dst: &mut [u8]) -> bool {
        assert!(offset + length <= SECTOR_SIZE);
        let entry = self.shared.find(sector, true);
        {
            let data = entry.data.read().expect("buf data poisoned");
            dst[..length].copy_from_slice(&data.0[offset..offset + length]);
        }
        self.shared.epilogue(&entry);

        if next != EOF_SENTINEL {
            let mut ra = self.shared.read_ahead.lock();
            if !ra.done {
                ra.pending.push_back(next);
                ra.wakeup();
            }
        }
        true
    }

    /// Copies `length` bytes of `src` into `sector` at `offset` and marks
    /// the buffer dirty. With `zero_tail`, the rest of the sector past
    /// `offset + length` is cleared in the same hold; first-touch block
    /// allocation uses this with a zero length to blank a whole sector.
    pub fn write(&self, sector: u32, offset: usize, length: usize, src: &[u8], zero_tail: bool) -> bool {
        assert!(offset + length <= SECTOR_SIZE);
        let entry = self.shared.find(sector, true);
        {
            let mut meta = entry.meta.lock();
            meta.dirty = true;
        }
        {
            let mut data = entry.data.write().expect("buf data poisoned");
            data.0[offset..offset + length].copy_from_slice(&src[..length]);
            if zero_tail {
                data.0[offset + length..].fill(0);
            }
        }
        self.shared.epilogue(&entry);
        true
    }

    /// Marks a resident `sector` as deleted: the buffer may be recycled
    /// without writing its contents back.
    pub fn remove(&self, sector: u32) {
        let mut i = 0;
        loop {
            let entry = {
                let list = self.shared.list.lock();
                if i >= list.entries.len() {
                    return;
                }
                list.entries[i].clone()
            };
            i += 1;

            let mut meta = entry.meta.lock();
            if meta.sector == sector {
                meta.removed = true;
                return;
            }
        }
    }

    /// Stops the daemons and flushes every dirty buffer. Read-ahead is
    /// retired first so no new loads appear behind the final flush.
    pub fn done(&self) {
        let daemons: Vec<_> = self.daemons.lock().expect("daemon list poisoned").drain(..).collect();

        {
            let mut ra = self.shared.read_ahead.lock();
            ra.done = true;
            ra.wakeup();
        }
        {
            let mut t = self.shared.timer.lock();
            t.done = true;
            t.wakeup();
        }
        {
            let mut wb = self.shared.write_behind.lock();
            wb.done = true;
            wb.wakeup();
        }
        for handle in daemons {
            let _ = handle.join();
        }
        self.shared.read_ahead.lock().pending.clear();

        self.shared.flush_pass();
        debug!("bio: shut down, {} buffers resident", self.len());
    }

    /// Number of resident buffers.
    pub fn len(&self) -> usize {
        self.shared.list.lock().entries.len()
    }

    /// True when no buffers are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buffers currently dirty.
    pub fn dirty_count(&self) -> usize {
        let entries: Vec<_> = self.shared.list.lock().entries.clone();
        entries.iter().filter(|e| e.meta.lock().dirty).count()
    }

    /// The sectors currently resident, for invariant checks.
    pub fn resident_sectors(&self) -> Vec<u32> {
        let entries: Vec<_> = self.shared.list.lock().entries.clone();
        entries.iter().map(|e| e.meta.lock().sector).collect()
    }
}

fn read_ahead_daemon(shared: &Arc<Shared>) {
    let mut ra = shared.read_ahead.lock();
    loop {
        while ra.pending.is_empty() && !ra.done {
            ra.sleep();
        }
        if ra.done {
            break;
        }
        // Signals are edge-triggered: drain everything queued, not just
        // one entry per wakeup.
        while let Some(sector) = ra.pending.pop_front() {
            drop(ra);
            shared.find(sector, false);
            ra = shared.read_ahead.lock();
            if ra.done {
                return;
            }
        }
    }
}

fn write_behind_daemon(shared: &Arc<Shared>) {
    let mut wb = shared.write_behind.lock();
    loop {
        if wb.done {
            break;
        }
        drop(wb);
        shared.flush_pass();
        wb = shared.write_behind.lock();
        if wb.done {
            break;
        }
        wb.sleep();
    }
}

fn timer_daemon(shared: &Arc<Shared>) {
    let mut t = shared.timer.lock();
    while !t.done {
        let timed_out = t.sleep_timeout(shared.period);
        if t.done {
            break;
        }
        if timed_out {
            shared.write_behind.lock().wakeup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemDisk;

    fn cache_over(sectors: u32) -> (Arc<MemDisk>, BufferCache) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = BufferCache::new(disk.clone(), Duration::from_millis(50));
        (disk, cache)
    }

    #[test]
    fn write_then_read_hits_cache() {
        let (_disk, cache) = cache_over(16);
        let payload = [0x42u8; 16];
        assert!(cache.write(3, 8, 16, &payload, false));

        let mut back = [0u8; 16];
        assert!(cache.read(3, EOF_SENTINEL, 8, 16, &mut back));
        assert_eq!(back, payload);
        assert_eq!(cache.len(), 1);
        cache.done();
    }

    #[test]
    fn zero_tail_clears_rest_of_sector() {
        let (disk, cache) = cache_over(16);
        // Dirty the whole sector first, then overwrite with a zeroed tail.
        assert!(cache.write(5, 0, SECTOR_SIZE, &[0xffu8; SECTOR_SIZE], false));
        assert!(cache.write(5, 0, 4, &[1, 2, 3, 4], true));
        cache.done();

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sector(5, &mut sector);
        assert_eq!(&sector[..4], &[1, 2, 3, 4]);
        assert!(sector[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn done_flushes_dirty_buffers() {
        let (disk, cache) = cache_over(16);
        let payload = [0x77u8; SECTOR_SIZE];
        assert!(cache.write(7, 0, SECTOR_SIZE, &payload, false));
        assert_eq!(cache.dirty_count(), 1);
        cache.done();
        assert_eq!(cache.dirty_count(), 0);

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sector(7, &mut sector);
        assert_eq!(sector, payload);
    }

    #[test]
    fn removed_buffer_is_not_written_back() {
        let (disk, cache) = cache_over(16);
        assert!(cache.write(9, 0, SECTOR_SIZE, &[0xaau8; SECTOR_SIZE], false));
        cache.remove(9);
        cache.done();

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sector(9, &mut sector);
        assert!(sector.iter().all(|&b| b == 0));
    }

    #[test]
    fn eviction_keeps_contents() {
        let (_disk, cache) = cache_over(NBUF as u32 * 2 + 2);
        // Touch twice the cache limit of distinct sectors.
        for s in 0..(NBUF as u32 * 2) {
            assert!(cache.write(s + 1, 0, 1, &[s as u8], true));
        }
        assert_eq!(cache.len(), NBUF);
        for s in 0..(NBUF as u32 * 2) {
            let mut b = [0u8; 1];
            assert!(cache.read(s + 1, EOF_SENTINEL, 0, 1, &mut b));
            assert_eq!(b[0], s as u8, "sector {}", s + 1);
        }
        cache.done();
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn at_most_one_buffer_per_sector() {
        let (_disk, cache) = cache_over(64);
        for s in 1..40u32 {
            cache.write(s, 0, 1, &[1], false);
            cache.read(s, EOF_SENTINEL, 0, 1, &mut [0u8; 1]);
        }
        let mut sectors = cache.resident_sectors();
        sectors.sort_unstable();
        let before = sectors.len();
        sectors.dedup();
        assert_eq!(before, sectors.len());
        cache.done();
    }
}
