//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! inode occupies exactly one sector and holds the type, the byte length
//! and the block-mapping tree: 120 direct sector pointers, 4 singly
//! indirect pointers and 1 doubly indirect pointer, 128 pointers per
//! indirection sector. A pointer value of 0 means "not yet allocated";
//! data sectors materialise lazily on first write (or first read inside
//! the recorded length) and are zero-filled on allocation.
//!
//! All persistent inode state (type, length, pointers) is read and
//! written through the buffer cache, never from a stale in-memory copy.
//! The in-memory `Inode` only carries identification and open-state
//! bookkeeping: the open count, the removed flag and the deny-write
//! count, guarded by the inode's `meta` lock.
//!
//! The kernel keeps an open-set of in-use inodes so that two opens of the
//! same sector share one `Inode`. The set is guarded by a single lock;
//! `open` dedupes by sector and `reopen` refuses inodes already marked
//! removed. On the last close of a removed inode, its data and pointer
//! sectors are returned to the free map and dropped from the cache
//! without write-back, and finally the inode sector itself is freed.
//!
//! The free-map inode at sector [`FREE_MAP_SECTOR`] is special-cased
//! throughout: its data run is contiguous, so byte offsets map to
//! `start + offset / SECTOR_SIZE` with no pointer tree.

use std::sync::Arc;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::{BufferCache, EOF_SENTINEL};
use crate::fs::freemap::FreeMap;
use crate::lock::SleepLock;
use crate::param::{FREE_MAP_SECTOR, MAXFILE, NDIRECT, NSINGLY, SECTOR_PTRS, SECTOR_SIZE};

/// Identifies an ordinary inode sector.
const INODE_MAGIC: u32 = 0x494e_4f44;

/// Byte offset of the `length` field, shared by both inode layouts.
const LENGTH_OFFSET: usize = 4;

/// Byte offset of the first direct pointer.
const PTRS_OFFSET: usize = 8;

/// What an inode holds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum InodeType {
    File = 0,
    Dir = 1,
    /// Unreadable type field, or an inode marked for deletion.
    Error = 2,
}

impl InodeType {
    fn from_raw(raw: u32) -> InodeType {
        match raw {
            0 => InodeType::File,
            1 => InodeType::Dir,
            _ => InodeType::Error,
        }
    }
}

/// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct DiskInode {
    /// File type (`InodeType` as u32).
    typ: u32,
    /// File size in bytes.
    length: i32,
    /// Direct data sector pointers.
    direct: [u32; NDIRECT],
    /// Singly indirect pointer sectors.
    singly: [u32; NSINGLY],
    /// Doubly indirect pointer sector.
    doubly: u32,
    /// Magic number.
    magic: u32,
}

const_assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

/// Open-state of an in-memory inode, guarded by its `meta` lock.
struct InodeMeta {
    /// Number of openers.
    open_cnt: u32,
    /// True once deletion has been requested; blocks reopen.
    removed: bool,
    /// 0: writes ok, >0: writes denied (executable loaded).
    deny_write_cnt: u32,
}

/// In-memory inode.
pub struct Inode {
    /// Sector number of the on-disk inode.
    sector: u32,
    meta: SleepLock<InodeMeta>,
}

impl Inode {
    /// The inode's number, which is its sector.
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    /// True while anyone else also has this inode open.
    pub fn is_shared(&self) -> bool {
        self.meta.lock().open_cnt != 1
    }

    /// Disables writes to this inode's content.
    /// May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut meta = self.meta.lock();
        meta.deny_write_cnt += 1;
        assert!(meta.deny_write_cnt <= meta.open_cnt);
    }

    /// Re-enables writes; pairs with `deny_write`.
    pub fn allow_write(&self) {
        let mut meta = self.meta.lock();
        assert!(meta.deny_write_cnt > 0);
        assert!(meta.deny_write_cnt <= meta.open_cnt);
        meta.deny_write_cnt -= 1;
    }
}

/// Set of open inodes, deduped by sector.
pub struct Itable {
    inner: SleepLock<Vec<Arc<Inode>>>,
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            inner: SleepLock::new("itable", Vec::new()),
        }
    }

    /// Returns the in-memory inode for `sector`, sharing an existing one
    /// when the sector is already open. Fails if the inode is marked
    /// removed.
    pub fn open(&self, sector: u32) -> Option<Arc<Inode>> {
        let mut list = self.inner.lock();
        if let Some(inode) = list.iter().find(|i| i.sector == sector) {
            let inode = inode.clone();
            drop(list);
            return Self::reopen(&inode);
        }
        let inode = Arc::new(Inode {
            sector,
            meta: SleepLock::new(
                "inode",
                InodeMeta {
                    open_cnt: 1,
                    removed: false,
                    deny_write_cnt: 0,
                },
            ),
        });
        list.push(inode.clone());
        Some(inode)
    }

    /// Takes another reference to an open inode; refuses removed ones.
    pub fn reopen(inode: &Arc<Inode>) -> Option<Arc<Inode>> {
        let mut meta = inode.meta.lock();
        if meta.removed {
            return None;
        }
        meta.open_cnt += 1;
        Some(inode.clone())
    }

    /// Drops one reference. On the last close of a removed inode, frees
    /// its sectors (data, pointer blocks, then the inode itself), telling
    /// the cache not to write any of them back.
    pub fn close(&self, cache: &BufferCache, freemap: &SleepLock<FreeMap>, inode: Arc<Inode>) {
        let mut list = self.inner.lock();
        let mut meta = inode.meta.lock();
        meta.open_cnt -= 1;
        if meta.open_cnt > 0 {
            return;
        }
        list.retain(|i| !Arc::ptr_eq(i, &inode));
        drop(list);

        if meta.removed {
            free_blocks(cache, freemap, inode.sector);
            cache.remove(inode.sector);
            freemap.lock().release(inode.sector, 1);
        }
    }

    /// Marks `inode` for deletion at its last close. The on-disk type is
    /// stamped `Error` so late readers see a dead inode.
    pub fn remove(cache: &BufferCache, inode: &Inode) {
        let mut meta = inode.meta.lock();
        meta.removed = true;
        set_type(cache, inode.sector, InodeType::Error);
    }
}

impl Default for Itable {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialises sector `sector` as an inode of `typ` with `length` bytes.
/// Content sectors are lazily allocated later. Returns false if the cache
/// write fails.
pub fn create(cache: &BufferCache, sector: u32, length: u32, typ: InodeType) -> bool {
    assert_ne!(sector, FREE_MAP_SECTOR);
    let node = DiskInode {
        typ: typ as u32,
        length: length as i32,
        direct: [0; NDIRECT],
        singly: [0; NSINGLY],
        doubly: 0,
        magic: INODE_MAGIC,
    };
    cache.write(sector, 0, SECTOR_SIZE, node.as_bytes(), false)
}

/// Reads the type of the inode at `sector`.
pub fn get_type(cache: &BufferCache, sector: u32) -> InodeType {
    let mut raw = [0u8; 4];
    if !cache.read(sector, EOF_SENTINEL, 0, 4, &mut raw) {
        return InodeType::Error;
    }
    InodeType::from_raw(u32::from_le_bytes(raw))
}

fn set_type(cache: &BufferCache, sector: u32, typ: InodeType) {
    cache.write(sector, 0, 4, &(typ as u32).to_le_bytes(), false);
}

/// Reads the byte length of the inode at `sector`; -1 on error. The
/// length field sits at the same offset in both inode layouts.
pub fn length(cache: &BufferCache, sector: u32) -> i32 {
    let mut raw = [0u8; 4];
    if !cache.read(sector, EOF_SENTINEL, LENGTH_OFFSET, 4, &mut raw) {
        return -1;
    }
    i32::from_le_bytes(raw)
}

fn set_length(cache: &BufferCache, sector: u32, length: i32) -> bool {
    cache.write(sector, LENGTH_OFFSET, 4, &length.to_le_bytes(), false)
}

/// Reads the 4-byte sector pointer at `offset` within `sector`.
fn read_ptr(cache: &BufferCache, sector: u32, offset: usize) -> Result<u32, ()> {
    let mut raw = [0u8; 4];
    if !cache.read(sector, EOF_SENTINEL, offset, 4, &mut raw) {
        return Err(());
    }
    Ok(u32::from_le_bytes(raw))
}

/// Follows the pointer slot at (`sector`, `offset`). An empty slot is
/// `Ok(None)` without `alloc`; with `alloc` a fresh zeroed sector is
/// claimed from the free map and written into the slot.
fn lookup_ptr(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    sector: u32,
    offset: usize,
    alloc: bool,
) -> Result<Option<u32>, ()> {
    let found = read_ptr(cache, sector, offset)?;
    if found > 0 {
        return Ok(Some(found));
    }
    if !alloc {
        return Ok(None);
    }
    let fresh = freemap.lock().allocate(1).ok_or(())?;
    if !cache.write(sector, offset, 4, &fresh.to_le_bytes(), false) {
        return Err(());
    }
    // First touch: blank the whole new sector in one cache operation.
    if !cache.write(fresh, 0, 0, &[], true) {
        return Err(());
    }
    Ok(Some(fresh))
}

/// Returns the disk sector that contains byte offset `pos` within the
/// inode at `inode_sector`, descending direct, singly and doubly
/// indirect levels as needed. `Ok(None)` when the sector is unallocated
/// and `alloc` is false; `Err` on cache failure, allocation failure, or a
/// file too large for the mapping tree.
pub fn byte_to_sector(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    inode_sector: u32,
    pos: usize,
    alloc: bool,
) -> Result<Option<u32>, ()> {
    if inode_sector == FREE_MAP_SECTOR {
        let header = crate::fs::freemap::read_header(cache).ok_or(())?;
        if (pos as i64) < header.length as i64 {
            return Ok(Some(header.start + (pos / SECTOR_SIZE) as u32));
        }
        return if alloc { Err(()) } else { Ok(None) };
    }

    let mut index = pos / SECTOR_SIZE;
    if index >= MAXFILE {
        return if alloc { Err(()) } else { Ok(None) };
    }

    if index < NDIRECT {
        return lookup_ptr(cache, freemap, inode_sector, PTRS_OFFSET + 4 * index, alloc);
    }
    index -= NDIRECT;
    let sub = index % SECTOR_PTRS;
    index /= SECTOR_PTRS;

    if index < NSINGLY {
        let offset = PTRS_OFFSET + 4 * (NDIRECT + index);
        let ptr = match lookup_ptr(cache, freemap, inode_sector, offset, alloc)? {
            Some(p) => p,
            None => return Ok(None),
        };
        return lookup_ptr(cache, freemap, ptr, 4 * sub, alloc);
    }
    index -= NSINGLY;

    let offset = PTRS_OFFSET + 4 * (NDIRECT + NSINGLY);
    let doubly = match lookup_ptr(cache, freemap, inode_sector, offset, alloc)? {
        Some(p) => p,
        None => return Ok(None),
    };
    let singly = match lookup_ptr(cache, freemap, doubly, 4 * index, alloc)? {
        Some(p) => p,
        None => return Ok(None),
    };
    lookup_ptr(cache, freemap, singly, 4 * sub, alloc)
}

/// Reads up to `buf.len()` bytes from the inode starting at `offset`.
/// Returns the number of bytes read, which is short at end of file or on
/// error. Length clamping and sector resolution happen under the inode's
/// `meta` lock; the copy itself does not.
pub fn read_at(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    inode: &Inode,
    buf: &mut [u8],
    mut offset: usize,
) -> usize {
    let mut read = 0;
    while read < buf.len() {
        let sector_ofs = offset % SECTOR_SIZE;
        let sector_left = SECTOR_SIZE - sector_ofs;

        let meta = inode.meta.lock();
        let len = length(cache, inode.sector);
        if len < 0 {
            break;
        }
        let inode_left = (len as usize).saturating_sub(offset);
        let chunk = buf.len() - read;
        let chunk = chunk.min(sector_left).min(inode_left);
        if chunk == 0 {
            break;
        }
        let sector = match byte_to_sector(cache, freemap, inode.sector, offset, true) {
            Ok(Some(s)) => s,
            _ => break,
        };
        // Prefetch hint: the sector holding the next file page, or the
        // sentinel at end of allocation.
        let next = match byte_to_sector(cache, freemap, inode.sector, offset + SECTOR_SIZE, false) {
            Ok(Some(s)) => s,
            Ok(None) => EOF_SENTINEL,
            Err(()) => break,
        };
        drop(meta);

        if !cache.read(sector, next, sector_ofs, chunk, &mut buf[read..read + chunk]) {
            break;
        }
        read += chunk;
        offset += chunk;
    }
    read
}

/// Writes `buf` into the inode starting at `offset`, allocating sectors
/// as needed and extending the recorded length when the write ends past
/// it. Returns the number of bytes written; zero while writes are denied.
pub fn write_at(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    inode: &Inode,
    buf: &[u8],
    mut offset: usize,
) -> usize {
    {
        let meta = inode.meta.lock();
        if meta.deny_write_cnt > 0 {
            return 0;
        }
        if length(cache, inode.sector) < 0 {
            return 0;
        }
    }

    let mut written = 0;
    while written < buf.len() {
        let meta = inode.meta.lock();
        let sector = match byte_to_sector(cache, freemap, inode.sector, offset, true) {
            Ok(Some(s)) => s,
            _ => break,
        };
        drop(meta);

        let sector_ofs = offset % SECTOR_SIZE;
        let chunk = (buf.len() - written).min(SECTOR_SIZE - sector_ofs);
        if !cache.write(sector, sector_ofs, chunk, &buf[written..written + chunk], false) {
            break;
        }
        written += chunk;
        offset += chunk;

        let meta = inode.meta.lock();
        if (length(cache, inode.sector) as usize) < offset {
            set_length(cache, inode.sector, offset as i32);
        }
        drop(meta);
    }
    written
}

/// Returns every allocated sector (data and pointer blocks) of the inode
/// at `sector` to the free map, dropping each from the cache without
/// write-back. Runs at the last close of a removed inode.
fn free_blocks(cache: &BufferCache, freemap: &SleepLock<FreeMap>, sector: u32) {
    let mut free_one = |s: u32| {
        cache.remove(s);
        freemap.lock().release(s, 1);
    };
    let free_singly = |free_one: &mut dyn FnMut(u32), singly: u32| {
        for sub in 0..SECTOR_PTRS {
            if let Ok(s) = read_ptr(cache, singly, 4 * sub) {
                if s > 0 {
                    free_one(s);
                }
            }
        }
        free_one(singly);
    };

    for i in 0..NDIRECT {
        if let Ok(s) = read_ptr(cache, sector, PTRS_OFFSET + 4 * i) {
            if s > 0 {
                free_one(s);
            }
        }
    }
    for i in 0..NSINGLY {
        if let Ok(p) = read_ptr(cache, sector, PTRS_OFFSET + 4 * (NDIRECT + i)) {
            if p > 0 {
                free_singly(&mut free_one, p);
            }
        }
    }
    if let Ok(doubly) = read_ptr(cache, sector, PTRS_OFFSET + 4 * (NDIRECT + NSINGLY)) {
        if doubly > 0 {
            for i in 0..SECTOR_PTRS {
                if let Ok(p) = read_ptr(cache, doubly, 4 * i) {
                    if p > 0 {
                        free_singly(&mut free_one, p);
                    }
                }
            }
            free_one(doubly);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemDisk;
    use std::time::Duration;

    fn fixture(sectors: u32) -> (BufferCache, SleepLock<FreeMap>) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = BufferCache::new(disk, Duration::from_secs(60));
        let map = FreeMap::create(&cache, sectors);
        (cache, SleepLock::new("freemap", map))
    }

    #[test]
    fn direct_mapping_allocates_lazily() {
        let (cache, fm) = fixture(256);
        let sector = fm.lock().allocate(1).unwrap();
        assert!(create(&cache, sector, 0, InodeType::File));

        assert_eq!(byte_to_sector(&cache, &fm, sector, 0, false), Ok(None));
        let a = byte_to_sector(&cache, &fm, sector, 0, true).unwrap().unwrap();
        // Same offset resolves to the same sector afterwards.
        assert_eq!(byte_to_sector(&cache, &fm, sector, 10, false), Ok(Some(a)));
        cache.done();
    }

    #[test]
    fn singly_indirect_boundary() {
        let (cache, fm) = fixture(2048);
        let sector = fm.lock().allocate(1).unwrap();
        assert!(create(&cache, sector, 0, InodeType::File));

        let last_direct = NDIRECT * SECTOR_SIZE - 1;
        let first_indirect = NDIRECT * SECTOR_SIZE;
        let a = byte_to_sector(&cache, &fm, sector, last_direct, true).unwrap().unwrap();
        let b = byte_to_sector(&cache, &fm, sector, first_indirect, true).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(
            byte_to_sector(&cache, &fm, sector, first_indirect, false),
            Ok(Some(b))
        );
        cache.done();
    }

    #[test]
    fn read_write_round_trip_with_growth() {
        let (cache, fm) = fixture(1024);
        let sector = fm.lock().allocate(1).unwrap();
        assert!(create(&cache, sector, 0, InodeType::File));
        let itable = Itable::new();
        let inode = itable.open(sector).unwrap();

        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(write_at(&cache, &fm, &inode, &data, 100), data.len());
        assert_eq!(length(&cache, sector), 3100);

        let mut back = vec![0u8; data.len()];
        assert_eq!(read_at(&cache, &fm, &inode, &mut back, 100), data.len());
        assert_eq!(back, data);

        // Reads past the end are short.
        let mut tail = [0u8; 64];
        assert_eq!(read_at(&cache, &fm, &inode, &mut tail, 3100), 0);
        itable.close(&cache, &fm, inode);
        cache.done();
    }

    #[test]
    fn deny_write_short_circuits() {
        let (cache, fm) = fixture(256);
        let sector = fm.lock().allocate(1).unwrap();
        assert!(create(&cache, sector, 0, InodeType::File));
        let itable = Itable::new();
        let inode = itable.open(sector).unwrap();

        inode.deny_write();
        assert_eq!(write_at(&cache, &fm, &inode, b"nope", 0), 0);
        inode.allow_write();
        assert_eq!(write_at(&cache, &fm, &inode, b"yes!", 0), 4);
        itable.close(&cache, &fm, inode);
        cache.done();
    }

    #[test]
    fn removed_inode_frees_sectors_on_last_close() {
        let (cache, fm) = fixture(1024);
        let before = fm.lock().count_allocated();
        let sector = fm.lock().allocate(1).unwrap();
        assert!(create(&cache, sector, 0, InodeType::File));
        let itable = Itable::new();
        let inode = itable.open(sector).unwrap();

        let data = vec![9u8; SECTOR_SIZE * 3];
        assert_eq!(write_at(&cache, &fm, &inode, &data, 0), data.len());

        Itable::remove(&cache, &inode);
        // A removed inode refuses new openers.
        assert!(itable.open(sector).is_none());
        itable.close(&cache, &fm, inode);
        assert_eq!(fm.lock().count_allocated(), before);
        cache.done();
    }

    #[test]
    fn two_opens_share_one_inode() {
        let (cache, fm) = fixture(256);
        let sector = fm.lock().allocate(1).unwrap();
        assert!(create(&cache, sector, 0, InodeType::File));
        let itable = Itable::new();
        let a = itable.open(sector).unwrap();
        let b = itable.open(sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_shared());
        itable.close(&cache, &fm, b);
        assert!(!a.is_shared());
        itable.close(&cache, &fm, a);
        cache.done();
    }
}
