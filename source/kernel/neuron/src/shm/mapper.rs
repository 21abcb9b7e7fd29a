// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared page mapper (alias a source VA range into a destination space)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: shm/tests.rs (rollback, placement, errors), shm/tests_prop.rs
//! PUBLIC API: map(kernel, src, src_va, dst, size)
//! DEPENDS_ON: mm::{AddressSpace, FrameTable}, shm::SharedMappingTable
//! INVARIANTS:
//!   - All-or-nothing: on error no alias stays installed and no retain stays outstanding
//!   - The source page table is never written
//!   - Destination base is the first gap at or above the destination break

extern crate alloc;

use alloc::vec::Vec;

use spin::MutexGuard;

use super::{release_frames, SharedMapping, ShmError};
use crate::kernel::Kernel;
use crate::mm::address_space::align_up;
use crate::mm::{AddressSpace, FrameTable, MapError, PageFlags, PAGE_SIZE, USER_BASE};
use crate::task::Process;
use crate::types::{FrameNumber, Pid};

/// Establishes a shared mapping and returns the destination base address.
pub fn map(kernel: &Kernel, src: Pid, src_va: usize, dst: Pid, size: usize) -> Result<usize, ShmError> {
    let result = map_inner(kernel, src, src_va, dst, size);
    match result {
        Ok(dst_va) => log_info!(
            target: "shm",
            "map {}:{:#x} -> {}:{:#x} ({} pages)",
            src, src_va, dst, dst_va, size / PAGE_SIZE
        ),
        Err(err) => log_warn!(target: "shm", "map {}:{:#x}+{:#x} -> {} failed: {}", src, src_va, size, dst, err),
    }
    result
}

fn map_inner(kernel: &Kernel, src_pid: Pid, src_va: usize, dst_pid: Pid, size: usize) -> Result<usize, ShmError> {
    if src_va % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 || size == 0 {
        return Err(ShmError::Unaligned);
    }
    let src_end = src_va.checked_add(size).ok_or(ShmError::InvalidRange)?;

    let src = kernel.find_process_by_pid(src_pid).ok_or(ShmError::NoSuchProcess)?;
    let dst = kernel.find_process_by_pid(dst_pid).ok_or(ShmError::NoSuchProcess)?;
    let mut spaces = Spaces::lock(&src, &dst);
    if spaces.src().is_retired() || spaces.dst().is_retired() {
        return Err(ShmError::NoSuchProcess);
    }
    if src_va < USER_BASE || src_end > align_up(spaces.src().brk()) {
        return Err(ShmError::InvalidRange);
    }

    let frames = resolve_and_retain(kernel.frames(), spaces.src(), src_va, size)?;

    let dst_va = match spaces.dst().find_gap(size) {
        Some(va) => va,
        None => {
            release_frames(kernel.frames(), &frames);
            return Err(ShmError::OutOfSpace);
        }
    };
    if let Err(err) = install(kernel, spaces.dst(), dst_va, &frames) {
        release_frames(kernel.frames(), &frames);
        return Err(err);
    }
    let dst_brk_before = spaces.dst().cover(dst_va + size);

    // Recorded before the space locks drop so a concurrent exit cannot miss it.
    kernel.mappings().insert(SharedMapping { src_pid, src_va, dst_pid, dst_va, size, dst_brk_before });
    Ok(dst_va)
}

/// Resolves every source page, then takes one reference per page.
fn resolve_and_retain(
    frames: &FrameTable,
    src: &AddressSpace,
    src_va: usize,
    size: usize,
) -> Result<Vec<FrameNumber>, ShmError> {
    let mut resolved = Vec::with_capacity(size / PAGE_SIZE);
    for va in (src_va..src_va + size).step_by(PAGE_SIZE) {
        let leaf = src
            .resolve(va)
            .filter(|leaf| leaf.flags.contains(PageFlags::USER))
            .ok_or(ShmError::UnmappedPage)?;
        resolved.push(leaf.frame);
    }
    for (index, frame) in resolved.iter().enumerate() {
        if let Err(err) = frames.retain(*frame) {
            release_frames(frames, &resolved[..index]);
            return Err(err.into());
        }
    }
    Ok(resolved)
}

/// Installs one alias per frame; removes the ones already installed on failure.
fn install(kernel: &Kernel, dst: &mut AddressSpace, dst_va: usize, frames: &[FrameNumber]) -> Result<(), ShmError> {
    for (page, frame) in frames.iter().enumerate() {
        let va = dst_va + page * PAGE_SIZE;
        let res = if injected_failure(kernel, page) {
            Err(MapError::PermissionDenied)
        } else {
            dst.install_alias(va, *frame)
        };
        if let Err(err) = res {
            for undo in 0..page {
                let _ = dst.remove_alias(dst_va + undo * PAGE_SIZE);
            }
            return Err(err.into());
        }
    }
    Ok(())
}

#[cfg(feature = "failpoints")]
fn injected_failure(kernel: &Kernel, page: usize) -> bool {
    kernel.failpoints().take_alias_failure(page)
}

#[cfg(not(feature = "failpoints"))]
fn injected_failure(_kernel: &Kernel, _page: usize) -> bool {
    false
}

/// Address-space locks for one map call, taken in ascending PID order.
enum Spaces<'a> {
    Same(MutexGuard<'a, AddressSpace>),
    Pair { src: MutexGuard<'a, AddressSpace>, dst: MutexGuard<'a, AddressSpace> },
}

impl<'a> Spaces<'a> {
    fn lock(src: &'a Process, dst: &'a Process) -> Self {
        if src.pid() == dst.pid() {
            return Spaces::Same(src.space().lock());
        }
        if src.pid() < dst.pid() {
            let src = src.space().lock();
            let dst = dst.space().lock();
            Spaces::Pair { src, dst }
        } else {
            let dst = dst.space().lock();
            let src = src.space().lock();
            Spaces::Pair { src, dst }
        }
    }

    fn src(&self) -> &AddressSpace {
        match self {
            Spaces::Same(space) => &**space,
            Spaces::Pair { src, .. } => &**src,
        }
    }

    fn dst(&mut self) -> &mut AddressSpace {
        match self {
            Spaces::Same(space) => &mut **space,
            Spaces::Pair { dst, .. } => &mut **dst,
        }
    }
}
