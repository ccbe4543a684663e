//! File system.
//!
//! The facade over the buffer cache, the free map, the inode layer and
//! directories: path resolution plus create/open/remove/mkdir/chdir.
//! Paths are tokenised on `/` and walked component by component from the
//! root (absolute) or from the caller's current directory sector
//! (relative); the final component is handed to the operation itself.

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::bio::BufferCache;
use crate::hal::BlockDevice;
use crate::lock::SleepLock;
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

pub mod dir;
pub mod freemap;
pub mod inode;
pub mod path;

use freemap::FreeMap;
use inode::{Inode, InodeType, Itable};

/// The mounted file system.
pub struct FileSys {
    cache: BufferCache,
    itable: Itable,
    freemap: SleepLock<FreeMap>,
}

impl FileSys {
    /// Mounts the file system on `disk`, formatting it first when
    /// `format` is set. `flush_period` is handed to the cache's
    /// write-behind timer.
    pub fn new(disk: Arc<dyn BlockDevice>, format: bool, flush_period: Duration) -> Result<FileSys, ()> {
        let sectors = disk.size();
        let cache = BufferCache::new(disk, flush_period);
        let freemap = if format {
            SleepLock::new("freemap", FreeMap::create(&cache, sectors))
        } else {
            SleepLock::new("freemap", FreeMap::open(&cache)?)
        };
        let fs = FileSys {
            cache,
            itable: Itable::new(),
            freemap,
        };
        if format {
            if !dir::create(
                &fs.cache,
                &fs.freemap,
                &fs.itable,
                ROOT_DIR_SECTOR,
                ROOT_DIR_SECTOR,
            ) {
                return Err(());
            }
            info!("filesys: formatted, root at sector {}", ROOT_DIR_SECTOR);
        }
        Ok(fs)
    }

    /// Flushes everything and stops the cache daemons.
    pub fn done(&self) {
        let _ = self.freemap.lock().close(&self.cache);
        self.cache.done();
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    pub fn freemap(&self) -> &SleepLock<FreeMap> {
        &self.freemap
    }

    fn start_dir(&self, cwd: u32, p: &str) -> u32 {
        if path::is_absolute(p) {
            ROOT_DIR_SECTOR
        } else {
            cwd
        }
    }

    /// Resolves `p` fully. Returns the target inode and whether it is a
    /// directory.
    pub fn find(&self, cwd: u32, p: &str) -> Option<(Arc<Inode>, bool)> {
        if !path::check(p) {
            return None;
        }
        let mut inode = self.itable.open(self.start_dir(cwd, p))?;
        let mut is_dir = true;
        for comp in path::components(p) {
            if !is_dir {
                self.close_inode(inode);
                return None;
            }
            let next = dir::lookup(&self.cache, &self.freemap, &inode, comp);
            self.close_inode(inode);
            let (sector, next_is_dir) = next?;
            inode = self.itable.open(sector)?;
            is_dir = next_is_dir;
        }
        Some((inode, is_dir))
    }

    /// Walks to the directory that should contain the final component of
    /// `p`, returning it with that component's name. Fails on malformed
    /// paths, missing intermediate directories, or a final name that is
    /// too long.
    fn walk_parent<'p>(&self, cwd: u32, p: &'p str) -> Option<(Arc<Inode>, &'p str)> {
        if !path::check(p) {
            return None;
        }
        let comps: Vec<&str> = path::components(p).collect();
        let (&name, parents) = comps.split_last()?;
        if name.len() > NAME_MAX {
            return None;
        }
        let mut inode = self.itable.open(self.start_dir(cwd, p))?;
        for comp in parents {
            let next = dir::lookup(&self.cache, &self.freemap, &inode, comp);
            self.close_inode(inode);
            let (sector, is_dir) = next?;
            if !is_dir {
                return None;
            }
            inode = self.itable.open(sector)?;
        }
        Some((inode, name))
    }

    /// Creates an ordinary file of `initial_size` bytes at `p`.
    pub fn create(&self, cwd: u32, p: &str, initial_size: u32) -> bool {
        let (parent, name) = match self.walk_parent(cwd, p) {
            Some(x) => x,
            None => return false,
        };
        let sector = match self.freemap.lock().allocate(1) {
            Some(s) => s,
            None => {
                self.close_inode(parent);
                return false;
            }
        };
        let ok = inode::create(&self.cache, sector, initial_size, InodeType::File)
            && dir::add(&self.cache, &self.freemap, &parent, name, false, sector);
        if !ok {
            self.cache.remove(sector);
            self.freemap.lock().release(sector, 1);
        }
        self.close_inode(parent);
        ok
    }

    /// Opens the inode named by `p`.
    pub fn open(&self, cwd: u32, p: &str) -> Option<(Arc<Inode>, bool)> {
        self.find(cwd, p)
    }

    /// Deletes the entry named by `p`. The target's storage is released
    /// when its last opener closes it.
    pub fn remove(&self, cwd: u32, p: &str) -> bool {
        let (parent, name) = match self.walk_parent(cwd, p) {
            Some(x) => x,
            None => return false,
        };
        let ok = dir::remove(&self.cache, &self.freemap, &self.itable, &parent, name);
        self.close_inode(parent);
        ok
    }

    /// Creates a directory at `p`.
    pub fn mkdir(&self, cwd: u32, p: &str) -> bool {
        let (parent, name) = match self.walk_parent(cwd, p) {
            Some(x) => x,
            None => return false,
        };
        let sector = match self.freemap.lock().allocate(1) {
            Some(s) => s,
            None => {
                self.close_inode(parent);
                return false;
            }
        };
        let ok = dir::create(
            &self.cache,
            &self.freemap,
            &self.itable,
            sector,
            parent.inumber(),
        ) && dir::add(&self.cache, &self.freemap, &parent, name, true, sector);
        if !ok {
            self.cache.remove(sector);
            self.freemap.lock().release(sector, 1);
        }
        self.close_inode(parent);
        ok
    }

    /// Changes directory: returns the new directory sector when `p`
    /// names a directory.
    pub fn chdir(&self, cwd: u32, p: &str) -> Option<u32> {
        let (inode, is_dir) = self.find(cwd, p)?;
        let sector = inode.inumber();
        self.close_inode(inode);
        if is_dir {
            Some(sector)
        } else {
            None
        }
    }

    /// Reads from an inode's content.
    pub fn read_at(&self, inode: &Inode, buf: &mut [u8], offset: usize) -> usize {
        inode::read_at(&self.cache, &self.freemap, inode, buf, offset)
    }

    /// Writes to an inode's content.
    pub fn write_at(&self, inode: &Inode, buf: &[u8], offset: usize) -> usize {
        inode::write_at(&self.cache, &self.freemap, inode, buf, offset)
    }

    /// Byte length of an inode's content.
    pub fn length_of(&self, inode: &Inode) -> i32 {
        inode::length(&self.cache, inode.inumber())
    }

    /// Next directory entry for `readdir`, advancing `pos`.
    pub fn read_dir_entry(&self, dirnode: &Inode, pos: &mut usize) -> Option<String> {
        dir::read_entry(&self.cache, &self.freemap, dirnode, pos)
    }

    /// Takes another reference to an open inode.
    pub fn reopen_inode(&self, inode: &Arc<Inode>) -> Option<Arc<Inode>> {
        Itable::reopen(inode)
    }

    /// Drops a reference to an open inode.
    pub fn close_inode(&self, inode: Arc<Inode>) {
        self.itable.close(&self.cache, &self.freemap, inode)
    }
}
