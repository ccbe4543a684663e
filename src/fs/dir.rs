//! Directories.
//!
//! A directory is a file whose content is a sequence of fixed-size
//! entries. Each entry records the target's inode sector, a name of at
//! most [`NAME_MAX`] bytes, whether the slot is live, and whether the
//! target is itself a directory (so lookups can answer both questions
//! with one read). Every directory begins with `.` and `..`.

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::BufferCache;
use crate::fs::freemap::FreeMap;
use crate::fs::inode::{self, Inode, InodeType, Itable};
use crate::lock::SleepLock;
use crate::param::NAME_MAX;

/// One directory entry.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct DirEntry {
    /// Inode sector of the target.
    sector: u32,
    /// Name, NUL-padded.
    name: [u8; NAME_MAX],
    /// 0 = vacant slot.
    in_use: u8,
    /// Target is a directory.
    is_dir: u8,
}

pub const DIR_ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();
const_assert!(DIR_ENTRY_SIZE == 20);

impl DirEntry {
    fn new(sector: u32, name: &str, is_dir: bool) -> DirEntry {
        let mut entry = DirEntry {
            sector,
            name: [0; NAME_MAX],
            in_use: 1,
            is_dir: is_dir as u8,
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }

    fn name_matches(&self, name: &str) -> bool {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len] == name.as_bytes()
    }

    fn name_string(&self) -> String {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }
}

fn entry_at(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    dir: &Inode,
    off: usize,
) -> Option<DirEntry> {
    let mut entry = DirEntry {
        sector: 0,
        name: [0; NAME_MAX],
        in_use: 0,
        is_dir: 0,
    };
    if inode::read_at(cache, freemap, dir, entry.as_bytes_mut(), off) != DIR_ENTRY_SIZE {
        return None;
    }
    Some(entry)
}

fn write_entry(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    dir: &Inode,
    entry: &DirEntry,
    off: usize,
) -> bool {
    inode::write_at(cache, freemap, dir, entry.as_bytes(), off) == DIR_ENTRY_SIZE
}

/// Initialises `sector` as a directory containing `.` and `..`.
pub fn create(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    itable: &Itable,
    sector: u32,
    parent: u32,
) -> bool {
    if !inode::create(cache, sector, 0, InodeType::Dir) {
        return false;
    }
    let dir = match itable.open(sector) {
        Some(d) => d,
        None => return false,
    };
    let ok = write_entry(cache, freemap, &dir, &DirEntry::new(sector, ".", true), 0)
        && write_entry(
            cache,
            freemap,
            &dir,
            &DirEntry::new(parent, "..", true),
            DIR_ENTRY_SIZE,
        );
    itable.close(cache, freemap, dir);
    ok
}

/// Looks `name` up in `dir`. Returns the target's inode sector and
/// whether it is a directory.
pub fn lookup(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    dir: &Inode,
    name: &str,
) -> Option<(u32, bool)> {
    let len = inode::length(cache, dir.inumber());
    if len < 0 {
        return None;
    }
    let mut off = 0;
    while off + DIR_ENTRY_SIZE <= len as usize {
        let entry = entry_at(cache, freemap, dir, off)?;
        if entry.in_use != 0 && entry.name_matches(name) {
            return Some((entry.sector, entry.is_dir != 0));
        }
        off += DIR_ENTRY_SIZE;
    }
    None
}

/// Adds an entry for `name` to `dir`, reusing a vacant slot when one
/// exists. Fails on a duplicate name or one longer than [`NAME_MAX`].
pub fn add(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    dir: &Inode,
    name: &str,
    is_dir: bool,
    sector: u32,
) -> bool {
    if name.is_empty() || name.len() > NAME_MAX {
        return false;
    }
    if lookup(cache, freemap, dir, name).is_some() {
        return false;
    }

    let len = inode::length(cache, dir.inumber());
    if len < 0 {
        return false;
    }
    let mut off = 0;
    while off + DIR_ENTRY_SIZE <= len as usize {
        match entry_at(cache, freemap, dir, off) {
            Some(entry) if entry.in_use == 0 => break,
            Some(_) => off += DIR_ENTRY_SIZE,
            None => return false,
        }
    }
    write_entry(cache, freemap, dir, &DirEntry::new(sector, name, is_dir), off)
}

/// True when `dir` holds nothing besides `.` and `..`.
pub fn is_empty(cache: &BufferCache, freemap: &SleepLock<FreeMap>, dir: &Inode) -> bool {
    let len = inode::length(cache, dir.inumber());
    if len < 0 {
        return false;
    }
    let mut off = 2 * DIR_ENTRY_SIZE;
    while off + DIR_ENTRY_SIZE <= len as usize {
        match entry_at(cache, freemap, dir, off) {
            Some(entry) if entry.in_use != 0 => return false,
            Some(_) => off += DIR_ENTRY_SIZE,
            None => return false,
        }
    }
    true
}

/// Removes `name` from `dir` and marks the target inode for deletion.
/// A directory target must be empty and not open anywhere else.
pub fn remove(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    itable: &Itable,
    dir: &Inode,
    name: &str,
) -> bool {
    if name == "." || name == ".." {
        return false;
    }
    let len = inode::length(cache, dir.inumber());
    if len < 0 {
        return false;
    }

    let mut off = 0;
    while off + DIR_ENTRY_SIZE <= len as usize {
        let mut entry = match entry_at(cache, freemap, dir, off) {
            Some(e) => e,
            None => return false,
        };
        if entry.in_use != 0 && entry.name_matches(name) {
            let target = match itable.open(entry.sector) {
                Some(t) => t,
                None => return false,
            };
            if entry.is_dir != 0
                && (target.is_shared() || !is_empty(cache, freemap, &target))
            {
                itable.close(cache, freemap, target);
                return false;
            }
            entry.in_use = 0;
            if !write_entry(cache, freemap, dir, &entry, off) {
                itable.close(cache, freemap, target);
                return false;
            }
            Itable::remove(cache, &target);
            itable.close(cache, freemap, target);
            return true;
        }
        off += DIR_ENTRY_SIZE;
    }
    false
}

/// Reads the next live entry name at or after `*pos`, skipping `.` and
/// `..`, advancing `*pos` past the returned entry.
pub fn read_entry(
    cache: &BufferCache,
    freemap: &SleepLock<FreeMap>,
    dir: &Inode,
    pos: &mut usize,
) -> Option<String> {
    let len = inode::length(cache, dir.inumber());
    if len < 0 {
        return None;
    }
    while *pos + DIR_ENTRY_SIZE <= len as usize {
        let entry = entry_at(cache, freemap, dir, *pos)?;
        *pos += DIR_ENTRY_SIZE;
        if entry.in_use != 0 {
            let name = entry.name_string();
            if name != "." && name != ".." {
                return Some(name);
            }
        }
    }
    None
}
