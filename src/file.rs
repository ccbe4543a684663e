//! File objects.
//!
//! A `File` is an open inode plus a seek position. Directories open into
//! the same type with `is_dir` set; their position then counts directory
//! entries for `readdir` instead of bytes.

use std::sync::Arc;

use crate::fs::inode::Inode;
use crate::fs::FileSys;

/// An open file or directory.
pub struct File {
    inode: Arc<Inode>,
    pos: usize,
    is_dir: bool,
    denied_write: bool,
}

impl File {
    /// Opens the file or directory at `path`.
    pub fn open(fs: &FileSys, cwd: u32, path: &str) -> Option<File> {
        let (inode, is_dir) = fs.open(cwd, path)?;
        Some(File {
            inode,
            pos: 0,
            is_dir,
            denied_write: false,
        })
    }

    /// Wraps an already-referenced inode.
    pub fn from_inode(inode: Arc<Inode>, is_dir: bool) -> File {
        File {
            inode,
            pos: 0,
            is_dir,
            denied_write: false,
        }
    }

    /// A second, independently-positioned handle to the same inode.
    pub fn reopen(&self, fs: &FileSys) -> Option<File> {
        let inode = fs.reopen_inode(&self.inode)?;
        Some(File {
            inode,
            pos: 0,
            is_dir: self.is_dir,
            denied_write: false,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Byte length of the underlying inode.
    pub fn len(&self, fs: &FileSys) -> i32 {
        fs.length_of(&self.inode)
    }

    pub fn is_empty(&self, fs: &FileSys) -> bool {
        self.len(fs) <= 0
    }

    /// Reads from the current position, advancing it.
    pub fn read(&mut self, fs: &FileSys, buf: &mut [u8]) -> usize {
        let n = fs.read_at(&self.inode, buf, self.pos);
        self.pos += n;
        n
    }

    /// Writes at the current position, advancing it.
    pub fn write(&mut self, fs: &FileSys, buf: &[u8]) -> usize {
        let n = fs.write_at(&self.inode, buf, self.pos);
        self.pos += n;
        n
    }

    /// Positioned read; does not move the file position.
    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], offset: usize) -> usize {
        fs.read_at(&self.inode, buf, offset)
    }

    /// Positioned write; does not move the file position.
    pub fn write_at(&self, fs: &FileSys, buf: &[u8], offset: usize) -> usize {
        fs.write_at(&self.inode, buf, offset)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Next directory entry name, for open directories.
    pub fn readdir(&mut self, fs: &FileSys) -> Option<String> {
        if !self.is_dir {
            return None;
        }
        fs.read_dir_entry(&self.inode, &mut self.pos)
    }

    /// Blocks content writes through any handle until `close` (used while
    /// the file is mapped as an executable).
    pub fn deny_write(&mut self) {
        if !self.denied_write {
            self.denied_write = true;
            self.inode.deny_write();
        }
    }

    /// Closes the handle, re-enabling writes it had denied.
    pub fn close(self, fs: &FileSys) {
        if self.denied_write {
            self.inode.allow_write();
        }
        fs.close_inode(self.inode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemDisk;
    use crate::param::ROOT_DIR_SECTOR;
    use std::time::Duration;

    fn mount() -> FileSys {
        let disk = Arc::new(MemDisk::new(1024));
        FileSys::new(disk, true, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn sequential_read_write_and_seek() {
        let fs = mount();
        assert!(fs.create(ROOT_DIR_SECTOR, "f", 0));
        let mut f = File::open(&fs, ROOT_DIR_SECTOR, "f").unwrap();
        assert_eq!(f.write(&fs, b"abcdef"), 6);
        assert_eq!(f.tell(), 6);

        f.seek(2);
        let mut buf = [0u8; 3];
        assert_eq!(f.read(&fs, &mut buf), 3);
        assert_eq!(&buf, b"cde");
        assert_eq!(f.tell(), 5);
        f.close(&fs);
        fs.done();
    }

    #[test]
    fn deny_write_released_on_close() {
        let fs = mount();
        assert!(fs.create(ROOT_DIR_SECTOR, "exe", 0));
        let mut exe = File::open(&fs, ROOT_DIR_SECTOR, "exe").unwrap();
        exe.deny_write();

        let mut other = File::open(&fs, ROOT_DIR_SECTOR, "exe").unwrap();
        assert_eq!(other.write(&fs, b"patch"), 0);
        exe.close(&fs);
        assert_eq!(other.write(&fs, b"patch"), 5);
        other.close(&fs);
        fs.done();
    }
}
