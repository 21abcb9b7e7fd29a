// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the page table and frame registry
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Page-table lookup agrees with the set of installed leaves
//!   - Retain/release sequences never free a frame that is still referenced
//!
//! TEST_SCENARIOS:
//!   - leaves_match_installed_pages(): map a random page set, unmap a subset, compare walks
//!   - refcount_tracks_outstanding_aliases(): interleaved retain/release keep count = 1 + aliases

use std::collections::BTreeSet;

use super::frame::FrameTable;
use super::page_table::{PageFlags, PageTable, PAGE_SIZE};
use crate::types::FrameNumber;
use proptest::prelude::*;

fn arb_pages() -> impl Strategy<Value = BTreeSet<usize>> {
    proptest::collection::btree_set(1usize..0x4_0000, 1..48)
}

proptest! {
    #[test]
    fn leaves_match_installed_pages(pages in arb_pages(), drop_mask in any::<u64>()) {
        let mut table = PageTable::new();
        let flags = PageFlags::VALID | PageFlags::READ | PageFlags::USER;
        for (i, page) in pages.iter().enumerate() {
            table.map(page * PAGE_SIZE, (i + 1) * PAGE_SIZE, flags).unwrap();
        }
        let mut kept = BTreeSet::new();
        for (i, page) in pages.iter().enumerate() {
            if drop_mask & (1 << (i % 64)) != 0 {
                let leaf = table.unmap(page * PAGE_SIZE).unwrap();
                prop_assert_eq!(leaf.frame, FrameNumber::from_raw(i as u32 + 1));
            } else {
                kept.insert(page * PAGE_SIZE);
            }
        }
        let walked: BTreeSet<usize> = table.leaves().into_iter().map(|(va, _)| va).collect();
        prop_assert_eq!(&walked, &kept);
        for page in pages {
            let va = page * PAGE_SIZE;
            prop_assert_eq!(table.translate(va).is_some(), kept.contains(&va));
        }
    }

    #[test]
    fn refcount_tracks_outstanding_aliases(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
        let table = FrameTable::new(1);
        let frame = table.allocate().unwrap();
        let mut aliases = 0u32;
        for retain in ops {
            if retain {
                table.retain(frame).unwrap();
                aliases += 1;
            } else if aliases > 0 {
                prop_assert_eq!(table.release(frame), Ok(false));
                aliases -= 1;
            }
            prop_assert_eq!(table.refcount(frame), Some(1 + aliases));
        }
        prop_assert_eq!(table.disown(frame), Ok(aliases == 0));
        for _ in 0..aliases {
            table.release(frame).unwrap();
        }
        prop_assert_eq!(table.free_frames(), 1);
    }
}
