// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identity and address newtypes shared by the mapper, frame registry and syscalls
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PageLen, Pid, FrameNumber, Asid
//! DEPENDS_ON: mm::page_table::is_canonical_sv39, PAGE_SIZE
//! INVARIANTS: A VirtAddr is canonical Sv39; a PageLen is a non-zero page multiple

use core::fmt;

use crate::mm::{page_table::is_canonical_sv39, PAGE_SIZE};

/// Canonical user virtual address as decoded from a register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub fn canonical(addr: usize) -> Option<Self> {
        is_canonical_sv39(addr).then_some(Self(addr))
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    /// Exclusive end of `[self, self+len)`, if it does not wrap.
    pub fn end(self, len: PageLen) -> Option<usize> {
        self.0.checked_add(len.0)
    }
}

/// Length of a shared range: whole pages, never zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageLen(usize);

impl PageLen {
    pub fn new(bytes: usize) -> Option<Self> {
        (bytes != 0 && bytes % PAGE_SIZE == 0).then_some(Self(bytes))
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }
}

/// Process identifier (PID).
///
/// Handed out by `ProcessTable` only; 0 is the kernel and is rejected at the syscall boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const KERNEL: Self = Self(0);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Physical frame number (physical address divided by `PAGE_SIZE`).
///
/// **Ownership**: Only `FrameTable` hands out frame numbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameNumber(u32);

impl FrameNumber {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Physical base address of the frame.
    #[inline]
    pub const fn base(self) -> usize {
        self.0 as usize * PAGE_SIZE
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{:#x}", self.0)
    }
}

/// Address space identifier, one per live process; 0 stays with the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Asid(u16);

impl Asid {
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    /// Kernel ASID (reserved).
    pub const KERNEL: Self = Self(0);
}
