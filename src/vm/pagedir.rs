//! Simulated page directory.
//!
//! Maps user virtual pages to frames with the hardware-maintained bits
//! the paging core depends on: writable, accessed, dirty. The simulated
//! MMU in the user-access path sets the accessed and dirty bits exactly
//! where real hardware would, which is what second-chance eviction and
//! mmap write-back observe.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::vm::frame::FrameId;

bitflags! {
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY    = 1 << 2;
    }
}

/// One installed translation.
#[derive(Clone, Copy)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: PteFlags,
}

/// A per-process page directory.
pub struct PageDir {
    entries: BTreeMap<usize, Pte>,
}

impl PageDir {
    pub fn new() -> PageDir {
        PageDir {
            entries: BTreeMap::new(),
        }
    }

    /// Installs a translation for `vpage`. Replaces nothing: installing
    /// over a present page is a bug in the caller.
    pub fn set_page(&mut self, vpage: usize, frame: FrameId, writable: bool) -> bool {
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(vpage, Pte { frame, flags }).is_none()
    }

    /// Drops the translation for `vpage`, if present.
    pub fn clear_page(&mut self, vpage: usize) {
        self.entries.remove(&vpage);
    }

    /// The translation for `vpage`.
    pub fn lookup(&self, vpage: usize) -> Option<Pte> {
        self.entries.get(&vpage).copied()
    }

    pub fn is_accessed(&self, vpage: usize) -> bool {
        self.entries
            .get(&vpage)
            .map_or(false, |pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    pub fn set_accessed(&mut self, vpage: usize, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&vpage) {
            pte.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    pub fn is_dirty(&self, vpage: usize) -> bool {
        self.entries
            .get(&vpage)
            .map_or(false, |pte| pte.flags.contains(PteFlags::DIRTY))
    }

    pub fn set_dirty(&mut self, vpage: usize, dirty: bool) {
        if let Some(pte) = self.entries.get_mut(&vpage) {
            pte.flags.set(PteFlags::DIRTY, dirty);
        }
    }

    /// Number of installed pages.
    pub fn installed(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over `(vpage, pte)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.entries.iter().map(|(&v, &p)| (v, p))
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}
