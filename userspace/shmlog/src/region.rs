// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Word-granular access to the shared region.
//!
//! The log only ever touches aligned 32-bit words. Every access is fallible so a
//! region backed by a kernel alias can report an unmapped page instead of panicking.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Access to a word outside the region or through a vanished mapping.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("region fault at offset {offset:#x}")]
pub struct RegionFault {
    pub offset: usize,
}

/// Shared memory the log lives in. Offsets are byte offsets, always 4-aligned.
///
/// Implementations must make each operation a sequentially consistent atomic access
/// to the same memory every other participant sees.
pub trait LogRegion {
    /// Region size in bytes (a multiple of four).
    fn len(&self) -> usize;

    fn load_word(&self, offset: usize) -> Result<u32, RegionFault>;

    fn store_word(&self, offset: usize, value: u32) -> Result<(), RegionFault>;

    /// Mirrors `AtomicU32::compare_exchange`: `Ok(previous)` on success, `Err(actual)`
    /// when the word did not hold `current`.
    fn compare_exchange_word(&self, offset: usize, current: u32, new: u32) -> Result<Result<u32, u32>, RegionFault>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: LogRegion + ?Sized> LogRegion for &R {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn load_word(&self, offset: usize) -> Result<u32, RegionFault> {
        (**self).load_word(offset)
    }

    fn store_word(&self, offset: usize, value: u32) -> Result<(), RegionFault> {
        (**self).store_word(offset, value)
    }

    fn compare_exchange_word(&self, offset: usize, current: u32, new: u32) -> Result<Result<u32, u32>, RegionFault> {
        (**self).compare_exchange_word(offset, current, new)
    }
}

impl<R: LogRegion + ?Sized> LogRegion for Arc<R> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn load_word(&self, offset: usize) -> Result<u32, RegionFault> {
        (**self).load_word(offset)
    }

    fn store_word(&self, offset: usize, value: u32) -> Result<(), RegionFault> {
        (**self).store_word(offset, value)
    }

    fn compare_exchange_word(&self, offset: usize, current: u32, new: u32) -> Result<Result<u32, u32>, RegionFault> {
        (**self).compare_exchange_word(offset, current, new)
    }
}

/// Heap-backed region for threads sharing one address space.
pub struct LocalRegion {
    words: Box<[AtomicU32]>,
}

impl LocalRegion {
    /// Zeroed region of `bytes` rounded down to whole words.
    pub fn new(bytes: usize) -> Self {
        Self { words: (0..bytes / 4).map(|_| AtomicU32::new(0)).collect() }
    }

    fn word(&self, offset: usize) -> Result<&AtomicU32, RegionFault> {
        if offset % 4 != 0 {
            return Err(RegionFault { offset });
        }
        self.words.get(offset / 4).ok_or(RegionFault { offset })
    }
}

impl LogRegion for LocalRegion {
    fn len(&self) -> usize {
        self.words.len() * 4
    }

    fn load_word(&self, offset: usize) -> Result<u32, RegionFault> {
        Ok(self.word(offset)?.load(Ordering::SeqCst))
    }

    fn store_word(&self, offset: usize, value: u32) -> Result<(), RegionFault> {
        self.word(offset)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn compare_exchange_word(&self, offset: usize, current: u32, new: u32) -> Result<Result<u32, u32>, RegionFault> {
        Ok(self.word(offset)?.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst))
    }
}

/// First non-zero word in `[start, end)`, scanning in address order.
pub(crate) fn first_nonzero<R: LogRegion>(region: &R, start: usize, end: usize) -> Result<Option<usize>, RegionFault> {
    for offset in (start..end).step_by(4) {
        if region.load_word(offset)? != 0 {
            return Ok(Some(offset));
        }
    }
    Ok(None)
}
