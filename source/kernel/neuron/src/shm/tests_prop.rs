// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for shared mappings
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Map followed by unmap leaves frame counts, records and the break as they were
//!   - Arbitrary map requests either succeed completely or change nothing
//!
//! TEST_SCENARIOS:
//!   - map_unmap_round_trip_restores_state(): random window of a random heap
//!   - rejected_maps_change_nothing(): random (possibly invalid) va/size pairs

use proptest::prelude::*;

use crate::mm::{PAGE_SIZE, USER_BASE};
use crate::types::{FrameNumber, Pid};
use crate::{Kernel, KernelConfig};

fn setup(heap_pages: usize) -> (Kernel, Pid, Pid, Vec<FrameNumber>) {
    let kernel = Kernel::new(KernelConfig { frames: 64, ..KernelConfig::default() });
    let parent = kernel.spawn(None).unwrap();
    let child = kernel.spawn(Some(parent)).unwrap();
    kernel.sbrk(parent, (heap_pages * PAGE_SIZE) as isize).unwrap();
    let frames = {
        let process = kernel.find_process_by_pid(parent).unwrap();
        let space = process.space().lock();
        (0..heap_pages)
            .map(|i| space.resolve(USER_BASE + i * PAGE_SIZE).unwrap().frame)
            .collect()
    };
    (kernel, parent, child, frames)
}

fn child_brk(kernel: &Kernel, child: Pid) -> usize {
    kernel.find_process_by_pid(child).unwrap().space().lock().brk()
}

fn arb_window() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..16).prop_flat_map(|heap| (Just(heap), 0..heap)).prop_flat_map(|(heap, first)| {
        (Just(heap), Just(first), 1..=heap - first)
    })
}

proptest! {
    #[test]
    fn map_unmap_round_trip_restores_state((heap, first, pages) in arb_window(), child_heap in 0usize..4) {
        let (kernel, parent, child, frames) = setup(heap);
        if child_heap > 0 {
            kernel.sbrk(child, (child_heap * PAGE_SIZE) as isize).unwrap();
        }
        let brk_before = child_brk(&kernel, child);
        let free_before = kernel.frames().free_frames();

        let src_va = USER_BASE + first * PAGE_SIZE;
        let dst = kernel.map_shared_pages(parent, child, src_va, pages * PAGE_SIZE).unwrap();
        prop_assert_eq!(dst, brk_before);
        for (i, frame) in frames.iter().enumerate() {
            let expected = if i >= first && i < first + pages { 2 } else { 1 };
            prop_assert_eq!(kernel.frames().refcount(*frame), Some(expected));
        }

        kernel.unmap_shared_pages(child, dst, pages * PAGE_SIZE).unwrap();
        for frame in &frames {
            prop_assert_eq!(kernel.frames().refcount(*frame), Some(1));
        }
        prop_assert_eq!(child_brk(&kernel, child), brk_before);
        prop_assert_eq!(kernel.frames().free_frames(), free_before);
        prop_assert!(kernel.mappings().is_empty());
    }

    #[test]
    fn rejected_maps_change_nothing(heap in 1usize..8, va in 0usize..0x2_0000, size in 0usize..0x2_0000) {
        let (kernel, parent, child, frames) = setup(heap);
        let brk_before = child_brk(&kernel, child);
        if kernel.map_shared_pages(parent, child, va, size).is_err() {
            for frame in &frames {
                prop_assert_eq!(kernel.frames().refcount(*frame), Some(1));
            }
            prop_assert_eq!(child_brk(&kernel, child), brk_before);
            prop_assert!(kernel.mappings().is_empty());
        } else {
            prop_assert_eq!(kernel.mappings().len(), 1);
            prop_assert_eq!(child_brk(&kernel, child), brk_before + size);
        }
    }
}
