// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process Sv39 address space: page table, ASID and heap break.
//!
//! The heap break is the process's size boundary: `[USER_BASE, brk)` is its valid
//! allocated range. Private pages are home-owned frames; alias pages are installed by
//! the shared mapper with [`PageFlags::SHARED`] and never own their frame.

extern crate alloc;

use alloc::vec::Vec;

use super::frame::{FrameError, FrameTable};
use super::page_table::{Leaf, MapError, PageFlags, PageTable, PAGE_SIZE};
use super::USER_BASE;
use crate::types::{Asid, FrameNumber};

/// Maximum ASIDs made available by the allocator.
const MAX_ASIDS: usize = 256;
const WORD_BITS: usize = core::mem::size_of::<u64>() * 8;
const BITMAP_WORDS: usize = (MAX_ASIDS + WORD_BITS - 1) / WORD_BITS;

/// Flags for private heap pages.
pub const PRIVATE_FLAGS: PageFlags = PageFlags::VALID
    .union(PageFlags::READ)
    .union(PageFlags::WRITE)
    .union(PageFlags::USER);
/// Flags for shared-alias pages: user, writable, non-home.
pub const ALIAS_FLAGS: PageFlags = PRIVATE_FLAGS.union(PageFlags::SHARED);

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// Provided process handle was not recognised.
    InvalidHandle,
    /// No more ASIDs are available.
    AsidExhausted,
    /// Range still holds shared aliases.
    InUse,
    /// Underlying map operation failed.
    Mapping(MapError),
    /// Frame registry refused the operation.
    Frame(FrameError),
    /// Arguments supplied by the caller were invalid.
    InvalidArgs,
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

impl From<FrameError> for AddressSpaceError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}

/// Tracks the state of a single Sv39 address space.
pub struct AddressSpace {
    page_table: PageTable,
    asid: Asid,
    brk: usize,
    limit: usize,
    retired: bool,
}

impl AddressSpace {
    /// Creates an empty space whose heap starts at [`USER_BASE`].
    pub fn new(asid: Asid, limit: usize) -> Self {
        Self { page_table: PageTable::new(), asid, brk: USER_BASE, limit, retired: false }
    }

    /// Returns the hardware ASID backing this address space.
    pub fn asid(&self) -> Asid {
        self.asid
    }

    /// Current heap break.
    pub fn brk(&self) -> usize {
        self.brk
    }

    /// Exclusive upper bound for user mappings.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// True once teardown started; no new mappings may target the space.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    /// Resolves the page containing `va`.
    pub fn resolve(&self, va: usize) -> Option<Leaf> {
        self.page_table.translate(va)
    }

    /// Moves the break by `delta` bytes and returns the previous break.
    pub fn sbrk(&mut self, frames: &FrameTable, delta: isize) -> Result<usize, AddressSpaceError> {
        let old = self.brk;
        let new = old.checked_add_signed(delta).ok_or(AddressSpaceError::InvalidArgs)?;
        if new < USER_BASE || new > self.limit {
            return Err(AddressSpaceError::InvalidArgs);
        }
        if new > old {
            self.grow(frames, new)?;
        } else if new < old {
            self.shrink(frames, new)?;
        }
        Ok(old)
    }

    /// Maps fresh private pages up to `new_brk`; rolls back on failure.
    fn grow(&mut self, frames: &FrameTable, new_brk: usize) -> Result<(), AddressSpaceError> {
        let start = align_up(self.brk);
        let end = align_up(new_brk);
        let mut installed: Vec<usize> = Vec::new();
        let mut va = start;
        while va < end {
            if let Err(err) = self.map_private(frames, va) {
                for done in installed {
                    if let Ok(leaf) = self.page_table.unmap(done) {
                        let _ = frames.disown(leaf.frame);
                    }
                }
                return Err(err);
            }
            installed.push(va);
            va += PAGE_SIZE;
        }
        self.brk = new_brk;
        Ok(())
    }

    fn map_private(&mut self, frames: &FrameTable, va: usize) -> Result<(), AddressSpaceError> {
        let frame = frames.allocate()?;
        if let Err(err) = self.page_table.map(va, frame.base(), PRIVATE_FLAGS) {
            let _ = frames.disown(frame);
            return Err(err.into());
        }
        Ok(())
    }

    /// Drops private pages above `new_brk`. Refuses to cut through an alias.
    fn shrink(&mut self, frames: &FrameTable, new_brk: usize) -> Result<(), AddressSpaceError> {
        let start = align_up(new_brk);
        let end = align_up(self.brk);
        let pages = (start..end).step_by(PAGE_SIZE);
        if pages.clone().any(|va| self.resolve(va).map_or(false, |leaf| leaf.is_shared())) {
            return Err(AddressSpaceError::InUse);
        }
        for va in pages {
            // Holes left by unmapped aliases are skipped.
            if let Ok(leaf) = self.page_table.unmap(va) {
                frames.disown(leaf.frame)?;
            }
        }
        self.brk = new_brk;
        Ok(())
    }

    /// First page-aligned gap of `size` bytes at or above the break.
    pub fn find_gap(&self, size: usize) -> Option<usize> {
        let mut base = align_up(self.brk);
        loop {
            let end = base.checked_add(size)?;
            if end > self.limit {
                return None;
            }
            match (base..end).step_by(PAGE_SIZE).find(|va| self.page_table.is_mapped(*va)) {
                None => return Some(base),
                Some(taken) => base = taken + PAGE_SIZE,
            }
        }
    }

    /// Installs a shared-alias entry at `va` for `frame`.
    pub fn install_alias(&mut self, va: usize, frame: FrameNumber) -> Result<(), MapError> {
        self.page_table.map(va, frame.base(), ALIAS_FLAGS)
    }

    /// Removes the alias entry at `va` and returns its frame.
    ///
    /// Private entries are left untouched.
    pub fn remove_alias(&mut self, va: usize) -> Result<FrameNumber, MapError> {
        match self.page_table.translate(va) {
            None => Err(MapError::NotMapped),
            Some(leaf) if !leaf.is_shared() => Err(MapError::PermissionDenied),
            Some(_) => self.page_table.unmap(va).map(|leaf| leaf.frame),
        }
    }

    /// Raises the break so it covers `end`; returns the break it replaced.
    pub fn cover(&mut self, end: usize) -> usize {
        let previous = self.brk;
        if end > self.brk {
            self.brk = end;
        }
        previous
    }

    /// Lowers the break after `[addr, end)` was unmapped at the top of the heap.
    ///
    /// Keeps walking down past pages that are no longer mapped. `before` is the break
    /// [`cover`](Self::cover) replaced; when the walk stops on its page it is restored
    /// exactly, sub-page offset included.
    pub fn trim_after_unmap(&mut self, addr: usize, end: usize, before: usize) {
        if end < align_up(self.brk) {
            return;
        }
        let mut brk = addr.max(USER_BASE);
        while brk > USER_BASE && !self.page_table.is_mapped(brk - PAGE_SIZE) {
            brk -= PAGE_SIZE;
        }
        self.brk = if align_up(before) == brk { before } else { brk };
    }

    /// Tears down every remaining leaf.
    ///
    /// Private frames are disowned, leftover aliases released; neither frees memory that
    /// another space still references. Returns the number of pages dropped.
    pub fn release_all(&mut self, frames: &FrameTable) -> usize {
        let leaves = self.page_table.leaves();
        let count = leaves.len();
        for (va, leaf) in leaves {
            let _ = self.page_table.unmap(va);
            let res = if leaf.is_shared() { frames.release(leaf.frame) } else { frames.disown(leaf.frame) };
            if let Err(err) = res {
                log_error!(target: "mm", "AS-TEARDOWN: {:?} at {:#x} ({})", err, va, leaf.frame);
            }
        }
        self.brk = USER_BASE;
        count
    }
}

/// Hands out hardware ASIDs; ASID 0 stays with the kernel.
pub struct AsidAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
}

impl AsidAllocator {
    pub const fn new() -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        // Reserve ASID 0 for the kernel/global mappings.
        bitmap[0] |= 1;
        Self { bitmap, next: 1 }
    }

    pub fn allocate(&mut self) -> Option<Asid> {
        for _ in 0..MAX_ASIDS {
            let index = self.next % MAX_ASIDS;
            let word = index / WORD_BITS;
            let bit = index % WORD_BITS;
            self.next = (index + 1) % MAX_ASIDS;
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Some(Asid::from_raw(index as u16));
            }
        }
        None
    }

    pub fn free(&mut self, asid: Asid) {
        let index = asid.as_raw() as usize;
        if index != 0 && index < MAX_ASIDS {
            let word = index / WORD_BITS;
            let bit = index % WORD_BITS;
            self.bitmap[word] &= !(1 << bit);
        }
    }
}

impl Default for AsidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
pub(crate) fn align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

#[inline]
pub(crate) fn align_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_unique_asids() {
        let mut alloc = AsidAllocator::new();
        let a = alloc.allocate().expect("asid");
        let b = alloc.allocate().expect("asid");
        assert_ne!(a, b);
        assert_ne!(a, Asid::KERNEL);
        alloc.free(a);
        alloc.free(Asid::KERNEL);
        assert_eq!((1..MAX_ASIDS).filter_map(|_| alloc.allocate()).count(), MAX_ASIDS - 2);
    }

    #[test]
    fn sbrk_maps_and_unmaps_private_pages() {
        let frames = FrameTable::new(8);
        let mut space = AddressSpace::new(Asid::from_raw(1), 0x10_0000);
        assert_eq!(space.sbrk(&frames, 100), Ok(USER_BASE));
        assert_eq!(space.brk(), USER_BASE + 100);
        assert!(space.resolve(USER_BASE + 99).is_some());
        assert_eq!(frames.free_frames(), 7);

        assert_eq!(space.sbrk(&frames, 2 * PAGE_SIZE as isize), Ok(USER_BASE + 100));
        assert_eq!(frames.free_frames(), 5);
        assert_eq!(space.sbrk(&frames, -(2 * PAGE_SIZE as isize) - 100), Ok(USER_BASE + 100 + 2 * PAGE_SIZE));
        assert_eq!(space.brk(), USER_BASE);
        assert_eq!(frames.free_frames(), 8);
    }

    #[test]
    fn sbrk_rejects_out_of_bounds_breaks() {
        let frames = FrameTable::new(4);
        let mut space = AddressSpace::new(Asid::from_raw(1), USER_BASE + 2 * PAGE_SIZE);
        assert_eq!(space.sbrk(&frames, -1), Err(AddressSpaceError::InvalidArgs));
        assert_eq!(space.sbrk(&frames, 3 * PAGE_SIZE as isize), Err(AddressSpaceError::InvalidArgs));
    }

    #[test]
    fn failed_growth_rolls_back() {
        let frames = FrameTable::new(2);
        let mut space = AddressSpace::new(Asid::from_raw(1), 0x10_0000);
        assert_eq!(
            space.sbrk(&frames, 3 * PAGE_SIZE as isize),
            Err(AddressSpaceError::Frame(FrameError::OutOfFrames))
        );
        assert_eq!(space.brk(), USER_BASE);
        assert_eq!(frames.free_frames(), 2);
        assert!(space.page_table().leaves().is_empty());
    }

    #[test]
    fn shrink_refuses_to_cut_aliases() {
        let frames = FrameTable::new(4);
        let mut space = AddressSpace::new(Asid::from_raw(1), 0x10_0000);
        let foreign = frames.allocate().expect("frame");
        frames.retain(foreign).expect("retain");
        space.install_alias(USER_BASE, foreign).expect("alias");
        space.cover(USER_BASE + PAGE_SIZE);
        assert_eq!(space.sbrk(&frames, -(PAGE_SIZE as isize)), Err(AddressSpaceError::InUse));
        assert_eq!(space.remove_alias(USER_BASE), Ok(foreign));
    }

    #[test]
    fn trim_restores_a_sub_page_break() {
        let frames = FrameTable::new(4);
        let mut space = AddressSpace::new(Asid::from_raw(1), 0x10_0000);
        space.sbrk(&frames, (PAGE_SIZE / 2) as isize).expect("grow");
        let half = USER_BASE + PAGE_SIZE / 2;
        let alias_va = space.find_gap(PAGE_SIZE).expect("gap");
        assert_eq!(alias_va, USER_BASE + PAGE_SIZE);
        let foreign = frames.allocate().expect("frame");
        frames.retain(foreign).expect("retain");
        space.install_alias(alias_va, foreign).expect("alias");
        assert_eq!(space.cover(alias_va + PAGE_SIZE), half);

        space.remove_alias(alias_va).expect("remove");
        space.trim_after_unmap(alias_va, alias_va + PAGE_SIZE, half);
        assert_eq!(space.brk(), half);
    }

    #[test]
    fn gap_search_starts_at_break() {
        let frames = FrameTable::new(4);
        let mut space = AddressSpace::new(Asid::from_raw(1), USER_BASE + 4 * PAGE_SIZE);
        space.sbrk(&frames, 10).expect("grow");
        assert_eq!(space.find_gap(PAGE_SIZE), Some(USER_BASE + PAGE_SIZE));
        assert_eq!(space.find_gap(3 * PAGE_SIZE), Some(USER_BASE + PAGE_SIZE));
        assert_eq!(space.find_gap(4 * PAGE_SIZE), None);
    }

    #[test]
    fn remove_alias_leaves_private_pages() {
        let frames = FrameTable::new(2);
        let mut space = AddressSpace::new(Asid::from_raw(1), 0x10_0000);
        space.sbrk(&frames, PAGE_SIZE as isize).expect("grow");
        assert_eq!(space.remove_alias(USER_BASE), Err(MapError::PermissionDenied));
        assert_eq!(space.remove_alias(USER_BASE + PAGE_SIZE), Err(MapError::NotMapped));
        assert!(space.resolve(USER_BASE).is_some());
    }

    #[test]
    fn align_helpers_round_to_pages() {
        assert_eq!(align_down(PAGE_SIZE + 1), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE + 1), 2 * PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE), PAGE_SIZE);
    }
}
