// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel instance wiring frames, processes and shared-mapping records
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: shm/tests.rs, syscall/tests.rs, tests/shm_e2e
//! PUBLIC API: Kernel, KernelConfig
//! DEPENDS_ON: mm::FrameTable, task::ProcessTable, shm::{mapper, unwinder}
//! INVARIANTS: No global singleton; every registry hangs off one Kernel value

extern crate alloc;

use alloc::sync::Arc;

use crate::mm::{AddressSpaceError, FrameTable, USER_VA_LIMIT};
use crate::shm::{mapper, unwinder, SharedMappingTable, ShmError};
use crate::task::{Process, ProcessTable, SpawnError};
use crate::types::Pid;
use crate::uaccess::UserAccess;

/// Runtime configuration for a kernel instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of physical frames in the pool.
    pub frames: u32,
    /// Exclusive upper bound for user mappings (page aligned).
    pub user_va_limit: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { frames: 1024, user_va_limit: USER_VA_LIMIT }
    }
}

/// Hosted kernel core: frame registry, process table and shared-mapping records.
pub struct Kernel {
    config: KernelConfig,
    frames: FrameTable,
    processes: ProcessTable,
    mappings: SharedMappingTable,
    #[cfg(feature = "failpoints")]
    failpoints: crate::mm::failpoints::Failpoints,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        log_info!(target: "kernel", "neuron-shm: {} frames, user limit {:#x}", config.frames, config.user_va_limit);
        Self {
            config,
            frames: FrameTable::new(config.frames),
            processes: ProcessTable::new(),
            mappings: SharedMappingTable::new(),
            #[cfg(feature = "failpoints")]
            failpoints: crate::mm::failpoints::Failpoints::new(),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn mappings(&self) -> &SharedMappingTable {
        &self.mappings
    }

    #[cfg(feature = "failpoints")]
    pub fn failpoints(&self) -> &crate::mm::failpoints::Failpoints {
        &self.failpoints
    }

    /// Creates a process with an empty heap.
    pub fn spawn(&self, parent: Option<Pid>) -> Result<Pid, SpawnError> {
        self.processes.spawn(parent, self.config.user_va_limit)
    }

    /// Resolves a PID; retired (exiting) processes are still returned.
    pub fn find_process_by_pid(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes.find_process_by_pid(pid)
    }

    /// Moves `pid`'s heap break by `delta` and returns the previous break.
    pub fn sbrk(&self, pid: Pid, delta: isize) -> Result<usize, AddressSpaceError> {
        let process = self.find_process_by_pid(pid).ok_or(AddressSpaceError::InvalidHandle)?;
        let mut space = process.space().lock();
        if space.is_retired() {
            return Err(AddressSpaceError::InvalidHandle);
        }
        space.sbrk(&self.frames, delta)
    }

    /// Aliases `[src_va, src_va+size)` of `src` into `dst`; returns the destination base.
    pub fn map_shared_pages(&self, src: Pid, dst: Pid, src_va: usize, size: usize) -> Result<usize, ShmError> {
        mapper::map(self, src, src_va, dst, size)
    }

    /// Removes the alias range `[addr, addr+size)` previously mapped into `pid`.
    pub fn unmap_shared_pages(&self, pid: Pid, addr: usize, size: usize) -> Result<(), ShmError> {
        unwinder::unmap(self, pid, addr, size)
    }

    /// Tears the process down: shared mappings first, then its private frames.
    pub fn exit(&self, pid: Pid) -> Result<(), ShmError> {
        unwinder::teardown_process(self, pid)
    }

    /// User-memory accessor acting as `pid`.
    pub fn user(&self, pid: Pid) -> Option<UserAccess<'_>> {
        self.find_process_by_pid(pid).map(|process| UserAccess::new(self, process))
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}
