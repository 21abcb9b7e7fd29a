// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! [`LogRegion`] over a kernel-backed shared window.
//!
//! Every word access is translated through the owning process's page table, so a
//! producer whose alias was unmapped sees [`RegionFault`] instead of stale memory.

use neuron_shm::ulib::SharedWindow;

use crate::region::{LogRegion, RegionFault};

impl LogRegion for SharedWindow<'_> {
    fn len(&self) -> usize {
        SharedWindow::len(self) & !3
    }

    fn load_word(&self, offset: usize) -> Result<u32, RegionFault> {
        self.load_u32(offset).map_err(|_| RegionFault { offset })
    }

    fn store_word(&self, offset: usize, value: u32) -> Result<(), RegionFault> {
        self.store_u32(offset, value).map_err(|_| RegionFault { offset })
    }

    fn compare_exchange_word(&self, offset: usize, current: u32, new: u32) -> Result<Result<u32, u32>, RegionFault> {
        self.compare_exchange_u32(offset, current, new).map_err(|_| RegionFault { offset })
    }
}
