// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context, Args, SysResult
//! DEPENDS_ON: Kernel (process table, shm mapper/unwinder, address spaces)
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; PIDs resolved via find_process_by_pid

use crate::kernel::Kernel;
use crate::mm::PAGE_SIZE;
use crate::shm::ShmError;
use crate::types::{PageLen, Pid, VirtAddr};

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_EXIT, SYSCALL_GETPID, SYSCALL_MAP_SHARED_PAGES,
    SYSCALL_SBRK, SYSCALL_UNMAP_SHARED_PAGES,
};

// Typed decoders for seL4-style Decode→Check→Execute

#[derive(Copy, Clone)]
struct MapSharedArgsTyped {
    src: Pid,
    dst: Pid,
    src_va: VirtAddr,
    len: PageLen,
}

impl MapSharedArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            src: decode_pid(args.get(0))?,
            dst: decode_pid(args.get(1))?,
            src_va: decode_page_va(args.get(2), ShmError::InvalidRange)?,
            len: decode_len(args.get(3))?,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.src_va.end(self.len).ok_or(ShmError::InvalidRange)?;
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct UnmapSharedArgsTyped {
    pid: Pid,
    addr: VirtAddr,
    len: PageLen,
}

impl UnmapSharedArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            pid: decode_pid(args.get(0))?,
            addr: decode_page_va(args.get(1), ShmError::NoSuchMapping)?,
            len: decode_len(args.get(2))?,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.addr.end(self.len).ok_or(ShmError::NoSuchMapping)?;
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct SbrkArgsTyped {
    delta: isize,
}

impl SbrkArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { delta: args.get(0) as isize })
    }
}

fn decode_pid(raw: usize) -> Result<Pid, Error> {
    u32::try_from(raw)
        .ok()
        .filter(|raw| *raw != Pid::KERNEL.as_raw())
        .map(Pid::from_raw)
        .ok_or(Error::Shm(ShmError::NoSuchProcess))
}

/// Alignment is checked first so misaligned input always reports `Unaligned`.
fn decode_page_va(raw: usize, non_canonical: ShmError) -> Result<VirtAddr, Error> {
    if raw % PAGE_SIZE != 0 {
        return Err(ShmError::Unaligned.into());
    }
    VirtAddr::canonical(raw).ok_or(Error::Shm(non_canonical))
}

fn decode_len(raw: usize) -> Result<PageLen, Error> {
    PageLen::new(raw).ok_or(Error::Shm(ShmError::Unaligned))
}

/// Execution context handed to every handler: the kernel and the calling process.
pub struct Context<'a> {
    pub kernel: &'a Kernel,
    pub current: Pid,
}

impl<'a> Context<'a> {
    /// Creates a new context for the current task.
    pub fn new(kernel: &'a Kernel, current: Pid) -> Self {
        Self { kernel, current }
    }
}

/// Registers every handler of this increment.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_GETPID, sys_getpid);
    table.register(SYSCALL_SBRK, sys_sbrk);
    table.register(SYSCALL_EXIT, sys_exit);
    table.register(SYSCALL_MAP_SHARED_PAGES, sys_map_shared_pages);
    table.register(SYSCALL_UNMAP_SHARED_PAGES, sys_unmap_shared_pages);
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.current.as_raw() as usize)
}

fn sys_sbrk(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SbrkArgsTyped::decode(args)?;
    Ok(ctx.kernel.sbrk(ctx.current, typed.delta)?)
}

fn sys_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let status = args.get(0) as i32;
    ctx.kernel.exit(ctx.current)?;
    log_debug!(target: "syscall", "exit pid={} status={}", ctx.current, status);
    Err(Error::TaskExit)
}

fn sys_map_shared_pages(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MapSharedArgsTyped::decode(args)?;
    typed.check()?;
    let dst_va =
        ctx.kernel.map_shared_pages(typed.src, typed.dst, typed.src_va.raw(), typed.len.raw())?;
    Ok(dst_va)
}

fn sys_unmap_shared_pages(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = UnmapSharedArgsTyped::decode(args)?;
    typed.check()?;
    ctx.kernel.unmap_shared_pages(typed.pid, typed.addr.raw(), typed.len.raw())?;
    Ok(0)
}
