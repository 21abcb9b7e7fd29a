// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! Table pages live in a per-table arena; a non-leaf entry stores the arena index of
//! the next level where hardware would store its PPN. Leaf entries keep the Sv39
//! encoding `(ppn << 10) | flags`, with bit 8 (RSW) marking shared-alias entries.

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::types::FrameNumber;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
/// Low PTE bits holding flags (hardware bits 0-7 plus the two RSW bits).
const FLAG_MASK: usize = 0x3ff;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software bit: entry aliases a frame owned by another mapping.
        const SHARED = 1 << 8;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    OutOfRange,
    /// Mapping violates the W^X policy.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// No leaf entry is installed at the address.
    NotMapped,
}

#[repr(align(4096))]
struct PageTablePage {
    entries: [usize; PT_ENTRIES],
}

const_assert_eq!(core::mem::size_of::<PageTablePage>(), PAGE_SIZE);

impl PageTablePage {
    const fn new() -> Self {
        Self { entries: [0; PT_ENTRIES] }
    }
}

/// Decoded leaf entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub frame: FrameNumber,
    pub flags: PageFlags,
}

impl Leaf {
    fn decode(entry: usize) -> Self {
        Self {
            frame: FrameNumber::from_raw((entry >> 10) as u32),
            flags: PageFlags::from_bits_truncate(entry & FLAG_MASK),
        }
    }

    /// Returns true when the entry is an alias installed by the shared mapper.
    pub fn is_shared(&self) -> bool {
        self.flags.contains(PageFlags::SHARED)
    }
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
pub struct PageTable {
    nodes: Vec<Box<PageTablePage>>,
}

impl PageTable {
    /// Creates an empty Sv39 page table with a fresh root page.
    pub fn new() -> Self {
        Self { nodes: vec![Box::new(PageTablePage::new())] }
    }

    /// Looks up the raw entry mapped at `va` if it exists.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        let (node, index) = self.leaf_slot(va)?;
        let entry = self.nodes[node].entries[index];
        if entry & PageFlags::VALID.bits() == 0 {
            None
        } else {
            Some(entry)
        }
    }

    /// Resolves the page containing `va` to its backing frame and flags.
    pub fn translate(&self, va: usize) -> Option<Leaf> {
        self.lookup(va & !(PAGE_SIZE - 1)).map(Leaf::decode)
    }

    /// Returns true when a leaf is installed at the page-aligned `va`.
    pub fn is_mapped(&self, va: usize) -> bool {
        self.lookup(va).is_some()
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    pub fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }

        let indices = vpn_indices(va);
        let mut node = 0;
        for (level, index) in indices.iter().enumerate() {
            let entry = self.nodes[node].entries[*index];
            if level == indices.len() - 1 {
                if entry & PageFlags::VALID.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                let ppn = pa / PAGE_SIZE;
                self.nodes[node].entries[*index] = (ppn << 10) | flags.bits();
                return Ok(());
            }

            if entry & PageFlags::VALID.bits() != 0 {
                if entry & LEAF_PERMS.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                node = entry >> 10;
                continue;
            }

            let next = self.nodes.len();
            self.nodes.push(Box::new(PageTablePage::new()));
            self.nodes[node].entries[*index] = (next << 10) | PageFlags::VALID.bits();
            node = next;
        }
        Ok(())
    }

    /// Removes the leaf at `va` and returns what it mapped.
    ///
    /// Intermediate levels stay allocated until the table is dropped.
    pub fn unmap(&mut self, va: usize) -> Result<Leaf, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        let (node, index) = self.leaf_slot(va).ok_or(MapError::NotMapped)?;
        let entry = self.nodes[node].entries[index];
        if entry & PageFlags::VALID.bits() == 0 {
            return Err(MapError::NotMapped);
        }
        self.nodes[node].entries[index] = 0;
        Ok(Leaf::decode(entry))
    }

    /// Collects every installed leaf as `(va, leaf)` in ascending address order.
    pub fn leaves(&self) -> Vec<(usize, Leaf)> {
        let mut out = Vec::new();
        for (i2, &top) in self.nodes[0].entries.iter().enumerate() {
            if !is_table(top) {
                continue;
            }
            for (i1, &mid) in self.nodes[top >> 10].entries.iter().enumerate() {
                if !is_table(mid) {
                    continue;
                }
                for (i0, &entry) in self.nodes[mid >> 10].entries.iter().enumerate() {
                    if entry & PageFlags::VALID.bits() != 0 {
                        out.push((compose_va(i2, i1, i0), Leaf::decode(entry)));
                    }
                }
            }
        }
        out
    }

    /// Walks the intermediate levels without allocating.
    fn leaf_slot(&self, va: usize) -> Option<(usize, usize)> {
        let [vpn2, vpn1, vpn0] = vpn_indices(va);
        let mut node = 0;
        for index in [vpn2, vpn1] {
            let entry = self.nodes[node].entries[index];
            if !is_table(entry) {
                return None;
            }
            node = entry >> 10;
        }
        Some((node, vpn0))
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

fn is_table(entry: usize) -> bool {
    entry & PageFlags::VALID.bits() != 0 && entry & LEAF_PERMS.bits() == 0
}

fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn2, vpn1, vpn0]
}

fn compose_va(vpn2: usize, vpn1: usize, vpn0: usize) -> usize {
    let va = (vpn2 << 30) | (vpn1 << 21) | (vpn0 << 12);
    if va & (1 << 38) != 0 {
        va | !((1usize << 39) - 1)
    } else {
        va
    }
}

pub(crate) fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
