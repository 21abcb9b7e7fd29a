// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Register-level entry to the shared-mapping core (dispatch table, error sentinel)
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs, to_user_return
//! DEPENDS_ON: mm, shm, task, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline;
//!             userspace sees `usize::MAX` (-1) for every failure

pub mod api;


use core::fmt;

use crate::{mm, shm};

/// Size of the dispatch window; numbers at or above it are rejected.
const MAX_SYSCALL: usize = 8;

/// Value returned to userspace for any failed syscall.
pub const SYSCALL_FAILED: usize = usize::MAX;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Raw a0-a5 as the trap frame delivered them.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

pub const SYSCALL_GETPID: usize = 0;
/// Moves the heap break by a signed delta (a0) and returns the previous break.
pub const SYSCALL_SBRK: usize = 1;
pub const SYSCALL_EXIT: usize = 2;
/// Aliases `size` bytes at `src_va` of `src_pid` into `dst_pid` (a0..a3).
pub const SYSCALL_MAP_SHARED_PAGES: usize = 3;
/// Removes the alias range `[addr, addr+size)` from `pid` (a0..a2).
pub const SYSCALL_UNMAP_SHARED_PAGES: usize = 4;

/// Failure of a dispatched call; collapsed to `SYSCALL_FAILED` at the user boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No handler at this number.
    InvalidSyscall,
    /// Shared mapping operation failed.
    Shm(shm::ShmError),
    /// Address-space operation (heap growth) failed.
    AddressSpace(mm::AddressSpaceError),
    /// Caller exited; there is no return value to deliver.
    TaskExit,
}

impl From<shm::ShmError> for Error {
    fn from(value: shm::ShmError) -> Self {
        Self::Shm(value)
    }
}

impl From<mm::AddressSpaceError> for Error {
    fn from(value: mm::AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Collapses a handler result into the register value userspace observes.
pub fn to_user_return(result: SysResult<usize>) -> usize {
    match result {
        Ok(value) => value,
        Err(_) => SYSCALL_FAILED,
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Handlers indexed by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Creates a table with every handler from [`api::install_handlers`].
    pub fn with_default_handlers() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }

    /// Installs `handler` at `number`; out-of-window numbers are ignored.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Runs the handler for `number` on behalf of `ctx.current`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
