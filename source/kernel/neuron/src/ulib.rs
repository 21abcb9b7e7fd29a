// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hosted user-side syscall stubs (what a process links against)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; apps/shm-selftest and tests/shm_e2e drive it end to end
//! PUBLIC API: UserProcess (getpid/sbrk/map_shared_pages/unmap_shared_pages/exit), SharedWindow
//! DEPENDS_ON: syscall::SyscallTable, uaccess::UserAccess
//! INVARIANTS: Every call goes through the dispatch table; failures surface as SYSCALL_FAILED

use crate::kernel::Kernel;
use crate::syscall::api::Context;
use crate::syscall::{
    to_user_return, Args, SyscallTable, SYSCALL_EXIT, SYSCALL_GETPID, SYSCALL_MAP_SHARED_PAGES,
    SYSCALL_SBRK, SYSCALL_UNMAP_SHARED_PAGES,
};
use crate::task::SpawnError;
use crate::types::Pid;
use crate::uaccess::{AccessError, UserAccess};

/// Handle a hosted process uses to trap into the kernel.
#[derive(Clone, Copy)]
pub struct UserProcess<'k> {
    kernel: &'k Kernel,
    table: &'k SyscallTable,
    pid: Pid,
}

impl<'k> UserProcess<'k> {
    pub fn new(kernel: &'k Kernel, table: &'k SyscallTable, pid: Pid) -> Self {
        Self { kernel, table, pid }
    }

    /// Spawns a fresh root process.
    pub fn spawn(kernel: &'k Kernel, table: &'k SyscallTable) -> Result<Self, SpawnError> {
        Ok(Self::new(kernel, table, kernel.spawn(None)?))
    }

    /// Spawns a child of this process with an empty heap.
    pub fn spawn_child(&self) -> Result<Self, SpawnError> {
        Ok(Self::new(self.kernel, self.table, self.kernel.spawn(Some(self.pid))?))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Raw trap: dispatches `number` with registers a0-a5 and returns a0.
    pub fn syscall(&self, number: usize, regs: [usize; 6]) -> usize {
        let mut ctx = Context::new(self.kernel, self.pid);
        to_user_return(self.table.dispatch(number, &mut ctx, &Args::new(regs)))
    }

    pub fn getpid(&self) -> usize {
        self.syscall(SYSCALL_GETPID, [0; 6])
    }

    /// Returns the previous break, or `SYSCALL_FAILED`.
    pub fn sbrk(&self, delta: isize) -> usize {
        self.syscall(SYSCALL_SBRK, [delta as usize, 0, 0, 0, 0, 0])
    }

    /// Maps `size` bytes at `src_va` of `src` into this process.
    pub fn map_shared_pages(&self, src: Pid, src_va: usize, size: usize) -> usize {
        let regs = [src.as_raw() as usize, self.pid.as_raw() as usize, src_va, size, 0, 0];
        self.syscall(SYSCALL_MAP_SHARED_PAGES, regs)
    }

    pub fn unmap_shared_pages(&self, addr: usize, size: usize) -> usize {
        self.syscall(SYSCALL_UNMAP_SHARED_PAGES, [self.pid.as_raw() as usize, addr, size, 0, 0, 0])
    }

    pub fn exit(&self, status: i32) -> usize {
        self.syscall(SYSCALL_EXIT, [status as usize, 0, 0, 0, 0, 0])
    }

    /// Loads and stores as this process; `None` once it has exited.
    pub fn memory(&self) -> Option<UserAccess<'k>> {
        self.kernel.user(self.pid)
    }

    /// Word window over `[base, base+len)` of this process.
    pub fn window(&self, base: usize, len: usize) -> Option<SharedWindow<'k>> {
        self.memory().map(|access| SharedWindow::new(access, base, len))
    }
}

/// Offset-relative view over a shared region in one process.
pub struct SharedWindow<'k> {
    access: UserAccess<'k>,
    base: usize,
    len: usize,
}

impl<'k> SharedWindow<'k> {
    pub fn new(access: UserAccess<'k>, base: usize, len: usize) -> Self {
        Self { access, base, len }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn load_u32(&self, offset: usize) -> Result<u32, AccessError> {
        self.access.load_u32(self.word_va(offset)?)
    }

    pub fn store_u32(&self, offset: usize, value: u32) -> Result<(), AccessError> {
        self.access.store_u32(self.word_va(offset)?, value)
    }

    pub fn compare_exchange_u32(&self, offset: usize, current: u32, new: u32) -> Result<Result<u32, u32>, AccessError> {
        self.access.compare_exchange_u32(self.word_va(offset)?, current, new)
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), AccessError> {
        self.check(offset, buf.len())?;
        self.access.read_bytes(self.base + offset, buf)
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<(), AccessError> {
        self.check(offset, bytes.len())?;
        self.access.write_bytes(self.base + offset, bytes)
    }

    fn word_va(&self, offset: usize) -> Result<usize, AccessError> {
        self.check(offset, 4)?;
        Ok(self.base + offset)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), AccessError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(AccessError::PageFault { va: self.base.wrapping_add(offset) }),
        }
    }
}
