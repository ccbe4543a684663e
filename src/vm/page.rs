//! Supplementary page table.
//!
//! The hardware page directory only knows about resident pages. The
//! supplementary table is the per-process source of truth for every user
//! page: where its contents currently live (memory, swap, a file, or
//! nowhere yet for fresh stack), what happens to it on eviction, and
//! whether it may be written.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fs::inode::Inode;

/// Where the page's contents currently are.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageStatus {
    InMemory,
    InSwap,
    InFile,
    /// Fresh stack page: zero-filled on first touch.
    GrowingStack,
}

/// What eviction does with the page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    /// Reloadable from the executable; never written anywhere.
    ReadOnly,
    /// Cached in a swap slot when evicted.
    ToSwap,
    /// Written back to its backing file when evicted dirty.
    ToFile,
}

/// Backing description of one user page.
pub struct PageInfo {
    pub status: PageStatus,
    pub kind: PageKind,
    pub writable: bool,
    /// Backing file for file-backed pages.
    pub file: Option<Arc<Inode>>,
    /// Meaning depends on `status`: file offset, swap slot index, or
    /// nothing.
    pub offset: u32,
    /// Bytes to read from the file; the rest of the page is zeroed.
    pub read_bytes: u32,
}

/// A per-process map from user virtual page to backing description.
pub struct Spt {
    map: BTreeMap<usize, PageInfo>,
}

impl Spt {
    pub fn new() -> Spt {
        Spt {
            map: BTreeMap::new(),
        }
    }

    /// Inserts a page description. At most one entry may exist per
    /// virtual page; a collision is a kernel bug.
    pub fn insert(&mut self, vpage: usize, info: PageInfo) {
        let prev = self.map.insert(vpage, info);
        assert!(prev.is_none(), "duplicate page at {:#x}", vpage);
    }

    pub fn get(&self, vpage: usize) -> Option<&PageInfo> {
        self.map.get(&vpage)
    }

    pub fn get_mut(&mut self, vpage: usize) -> Option<&mut PageInfo> {
        self.map.get_mut(&vpage)
    }

    pub fn remove(&mut self, vpage: usize) -> Option<PageInfo> {
        self.map.remove(&vpage)
    }

    pub fn contains(&self, vpage: usize) -> bool {
        self.map.contains_key(&vpage)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PageInfo)> {
        self.map.iter().map(|(&v, i)| (v, i))
    }

    /// Drains every entry, for teardown.
    pub fn take_all(&mut self) -> Vec<(usize, PageInfo)> {
        core::mem::take(&mut self.map).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries currently recorded as swapped out, for invariant checks.
    pub fn in_swap_count(&self) -> usize {
        self.map
            .values()
            .filter(|i| i.status == PageStatus::InSwap)
            .count()
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}
