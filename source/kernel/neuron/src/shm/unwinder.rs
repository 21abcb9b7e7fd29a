// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping unwinder (exact-match unmap and exit-time teardown)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: shm/tests.rs (exact match, teardown, frame return), tests/shm_e2e
//! PUBLIC API: unmap(kernel, pid, addr, size), teardown_process(kernel, pid)
//! DEPENDS_ON: shm::SharedMappingTable, mm::{AddressSpace, FrameTable}
//! INVARIANTS:
//!   - A failed unmap leaves page tables and records untouched
//!   - Each alias leaf is released exactly once (unmap, teardown, or destination exit)
//!   - Exit retires the space before draining records so no new mapping can slip in

use super::{release_frames, SharedMapping, ShmError};
use crate::kernel::Kernel;
use crate::mm::{AddressSpace, FrameTable, MapError, PAGE_SIZE};
use crate::types::Pid;

/// Removes the alias range `[addr, addr+size)` recorded for `pid`.
pub fn unmap(kernel: &Kernel, pid: Pid, addr: usize, size: usize) -> Result<(), ShmError> {
    let result = unmap_inner(kernel, pid, addr, size);
    match result {
        Ok(()) => log_info!(target: "shm", "unmap {}:{:#x} ({} pages)", pid, addr, size / PAGE_SIZE),
        Err(err) => log_warn!(target: "shm", "unmap {}:{:#x}+{:#x} failed: {}", pid, addr, size, err),
    }
    result
}

fn unmap_inner(kernel: &Kernel, pid: Pid, addr: usize, size: usize) -> Result<(), ShmError> {
    if addr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 || size == 0 {
        return Err(ShmError::Unaligned);
    }
    let process = kernel.find_process_by_pid(pid).ok_or(ShmError::NoSuchProcess)?;
    let mut space = process.space().lock();
    if space.is_retired() {
        return Err(ShmError::NoSuchProcess);
    }
    let record = kernel.mappings().remove_exact(pid, addr, size).ok_or(ShmError::NoSuchMapping)?;
    unwind_pages(kernel.frames(), &mut space, &record);
    space.trim_after_unmap(record.dst_va, record.dst_va + record.size, record.dst_brk_before);
    Ok(())
}

/// Exit path: unwinds every mapping `pid` takes part in, then drops its private pages.
///
/// Mappings where `pid` is the source are revoked in their destination as well, so no
/// record outlives either endpoint.
pub fn teardown_process(kernel: &Kernel, pid: Pid) -> Result<(), ShmError> {
    let process = kernel.find_process_by_pid(pid).ok_or(ShmError::NoSuchProcess)?;
    {
        let mut space = process.space().lock();
        if space.is_retired() {
            return Err(ShmError::NoSuchProcess);
        }
        space.retire();
    }

    let records = kernel.mappings().take_involving(pid);
    for record in &records {
        // Destination already gone: its own teardown released the leftover aliases.
        let Some(owner) = kernel.find_process_by_pid(record.dst_pid) else {
            continue;
        };
        let mut space = owner.space().lock();
        unwind_pages(kernel.frames(), &mut space, record);
        if record.dst_pid != pid {
            space.trim_after_unmap(record.dst_va, record.dst_va + record.size, record.dst_brk_before);
        }
    }

    let pages = process.space().lock().release_all(kernel.frames());
    kernel.processes().remove(pid);
    log_info!(
        target: "shm",
        "exit pid={} unwound {} mappings, dropped {} pages",
        pid, records.len(), pages
    );
    Ok(())
}

/// Removes the record's alias leaves from `space` and releases their frames.
fn unwind_pages(frames: &FrameTable, space: &mut AddressSpace, record: &SharedMapping) -> usize {
    let mut released = 0;
    for va in (record.dst_va..record.dst_va + record.size).step_by(PAGE_SIZE) {
        match space.remove_alias(va) {
            Ok(frame) => {
                release_frames(frames, &[frame]);
                released += 1;
            }
            // A retired destination may already have dropped its leaves.
            Err(MapError::NotMapped) if space.is_retired() => {}
            Err(err) => log_error!(target: "shm", "unwind {}:{:#x}: {:?}", record.dst_pid, va, err),
        }
    }
    released
}
