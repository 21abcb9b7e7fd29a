// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for Sv39: page tables, frames and address spaces.

pub mod address_space;
pub mod frame;
pub mod page_table;

pub use address_space::{AddressSpace, AddressSpaceError, AsidAllocator};
pub use frame::{FrameError, FrameTable};
pub use page_table::{Leaf, MapError, PageFlags, PageTable, PAGE_SIZE};

use static_assertions::const_assert;

/// Lowest user address; page 0 stays unmapped as a null guard.
pub const USER_BASE: usize = PAGE_SIZE;
/// Exclusive upper bound for user mappings.
pub const USER_VA_LIMIT: usize = 0x4000_0000;

const_assert!(USER_VA_LIMIT % PAGE_SIZE == 0);
const_assert!(USER_BASE < USER_VA_LIMIT);

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use core::sync::atomic::{AtomicUsize, Ordering};

    const DISARMED: usize = usize::MAX;

    /// Per-kernel fault injection for the shared mapper.
    pub struct Failpoints {
        fail_alias_at: AtomicUsize,
    }

    impl Failpoints {
        pub const fn new() -> Self {
            Self { fail_alias_at: AtomicUsize::new(DISARMED) }
        }

        /// Forces the alias install of page `page` (0-based) in the next map to fail
        /// with [`MapError::PermissionDenied`](super::MapError::PermissionDenied).
        pub fn fail_alias_install_at(&self, page: usize) {
            self.fail_alias_at.store(page, Ordering::SeqCst);
        }

        pub fn disarm(&self) {
            self.fail_alias_at.store(DISARMED, Ordering::SeqCst);
        }

        /// Consumes the armed failure if it targets `page`.
        pub(crate) fn take_alias_failure(&self, page: usize) -> bool {
            self.fail_alias_at
                .compare_exchange(page, DISARMED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        }
    }

    impl Default for Failpoints {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(test)]
mod tests_prop;
