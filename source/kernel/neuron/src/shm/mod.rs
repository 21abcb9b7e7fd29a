// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-address-space shared page mapping (records, mapper, unwinder)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: shm/tests.rs (unit), shm/tests_prop.rs (proptest), tests/shm_e2e (host e2e)
//! PUBLIC API: ShmError, SharedMapping, SharedMappingTable
//! DEPENDS_ON: mm::{FrameTable, AddressSpace}, task::ProcessTable, spin::Mutex
//! INVARIANTS:
//!   - One record per live alias range, keyed by (destination pid, destination va)
//!   - Records are inserted and removed while the destination space lock is held
//!   - Lock order: process table -> spaces (ascending PID) -> record table -> frame pool

extern crate alloc;

use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;

use spin::Mutex;

use crate::mm::{FrameError, FrameTable, MapError};
use crate::types::{FrameNumber, Pid};

pub mod mapper;
pub mod unwinder;

#[cfg(test)]
mod tests_prop;

/// Failure kinds reported by `map_shared_pages` / `unmap_shared_pages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum ShmError {
    /// Address or size is not page aligned (a zero size counts as unaligned).
    Unaligned,
    /// Source range lies outside the source's allocated range.
    InvalidRange,
    /// A page in the source range has no backing frame.
    UnmappedPage,
    /// Unmap target does not match a recorded mapping exactly.
    NoSuchMapping,
    /// Destination has no free region large enough below its VA limit.
    OutOfSpace,
    /// PID does not name a live process.
    NoSuchProcess,
    /// Alias installation failed in the destination page table.
    Mapping(MapError),
    /// Frame registry refused a retain/release.
    Frame(FrameError),
}

impl From<MapError> for ShmError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

impl From<FrameError> for ShmError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Kernel-owned record of one established alias range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedMapping {
    pub src_pid: Pid,
    pub src_va: usize,
    pub dst_pid: Pid,
    pub dst_va: usize,
    pub size: usize,
    /// Destination break before the alias raised it.
    pub dst_brk_before: usize,
}

impl SharedMapping {
    /// True when `pid` is either endpoint of the mapping.
    pub fn involves(&self, pid: Pid) -> bool {
        self.src_pid == pid || self.dst_pid == pid
    }
}

/// Table of live shared mappings indexed by `(destination pid, destination va)`.
pub struct SharedMappingTable {
    records: Mutex<BTreeMap<(Pid, usize), SharedMapping>>,
}

impl SharedMappingTable {
    pub fn new() -> Self {
        Self { records: Mutex::new(BTreeMap::new()) }
    }

    pub(crate) fn insert(&self, record: SharedMapping) {
        self.records.lock().insert((record.dst_pid, record.dst_va), record);
    }

    /// Removes the record for `pid` only if it covers exactly `[addr, addr+size)`.
    pub(crate) fn remove_exact(&self, pid: Pid, addr: usize, size: usize) -> Option<SharedMapping> {
        let mut records = self.records.lock();
        match records.get(&(pid, addr)) {
            Some(record) if record.size == size => records.remove(&(pid, addr)),
            _ => None,
        }
    }

    /// Drains every record where `pid` is source or destination.
    pub(crate) fn take_involving(&self, pid: Pid) -> Vec<SharedMapping> {
        let mut records = self.records.lock();
        let keys: Vec<(Pid, usize)> =
            records.iter().filter(|(_, r)| r.involves(pid)).map(|(k, _)| *k).collect();
        keys.into_iter().filter_map(|key| records.remove(&key)).collect()
    }

    /// Looks up the record installed at `(pid, addr)`.
    pub fn get(&self, pid: Pid, addr: usize) -> Option<SharedMapping> {
        self.records.lock().get(&(pid, addr)).copied()
    }

    /// Snapshot of all records where `pid` is an endpoint.
    pub fn involving(&self, pid: Pid) -> Vec<SharedMapping> {
        self.records.lock().values().filter(|r| r.involves(pid)).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SharedMappingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops one alias reference per frame.
pub(crate) fn release_frames(frames: &FrameTable, list: &[FrameNumber]) {
    for frame in list {
        if let Err(err) = frames.release(*frame) {
            log_error!(target: "shm", "release {} failed: {:?}", frame, err);
        }
    }
}
