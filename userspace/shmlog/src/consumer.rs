// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Consumer side: repeated linear scans that copy out committed slots and free them.
//!
//! A slot is freed payload first, header last, so a producer never sees a zero header
//! in front of stale payload words. Positions the scan only inferred (runs of zero
//! words, lengths of pending slots) are re-checked before the next header is trusted,
//! since a producer may have claimed space behind the scan.

use crate::header::{SlotHeader, HEADER_SIZE};
use crate::region::{first_nonzero, LogRegion, RegionFault};
use crate::LogError;

/// Tunables for the consumer loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consecutive scans without any occupied slot that end a drain.
    pub max_empty_scans: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { max_empty_scans: 100 }
    }
}

/// One consumed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub tag: u16,
    pub payload: Vec<u8>,
    /// Slot offset the message was read from.
    pub offset: usize,
}

/// Outcome of a single pass over the region.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scan {
    pub messages: Vec<Message>,
    /// Slots still being written when the scan passed them.
    pub in_flight: usize,
}

impl Scan {
    /// A scan that saw neither committed nor pending slots.
    pub fn is_idle(&self) -> bool {
        self.messages.is_empty() && self.in_flight == 0
    }
}

/// Outcome of a full drain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub messages: Vec<Message>,
    pub scans: u64,
}

/// The single reader of a region.
pub struct Consumer<R> {
    region: R,
    config: ConsumerConfig,
    consumed: u64,
}

/// Inferred positions awaiting confirmation before the next header is trusted.
#[derive(Default)]
struct Unverified {
    pending: Option<(usize, u32)>,
    zero_run: Option<usize>,
}

impl<R: LogRegion> Consumer<R> {
    pub fn new(region: R, config: ConsumerConfig) -> Self {
        Self { region, config, consumed: 0 }
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    /// Messages consumed over the consumer's lifetime.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Walks the region once from offset 0.
    pub fn scan(&mut self) -> Result<Scan, LogError> {
        let bound = self.region.len();
        let mut scan = Scan::default();
        let mut unverified = Unverified::default();
        let mut offset = 0;

        while offset + HEADER_SIZE <= bound {
            let word = self.region.load_word(offset)?;
            if word == 0 {
                unverified.zero_run.get_or_insert(offset);
                offset += HEADER_SIZE;
                continue;
            }
            if let Some(restart) = self.recheck(&mut unverified, offset)? {
                offset = restart;
                continue;
            }

            let header = SlotHeader::decode(word);
            let end = offset + header.stride();
            if end > bound {
                break;
            }
            match header {
                SlotHeader::Pending { .. } => {
                    scan.in_flight += 1;
                    unverified.pending = Some((offset, word));
                }
                SlotHeader::Committed { tag, len } => {
                    let payload = self.take(offset, usize::from(len))?;
                    self.consumed += 1;
                    scan.messages.push(Message { tag, payload, offset });
                }
                SlotHeader::Free => {}
            }
            offset = end;
        }
        Ok(scan)
    }

    /// Scans until `max_empty_scans` consecutive idle scans.
    pub fn drain(&mut self) -> Result<DrainReport, LogError> {
        let mut messages = Vec::new();
        let scans = self.drain_with(|message| messages.push(message))?;
        Ok(DrainReport { messages, scans })
    }

    /// Like [`drain`](Self::drain) but hands each message to `sink` as it is read.
    /// Returns the number of scans performed.
    pub fn drain_with(&mut self, mut sink: impl FnMut(Message)) -> Result<u64, LogError> {
        let mut scans = 0u64;
        let mut idle = 0u32;
        while idle < self.config.max_empty_scans {
            let scan = self.scan()?;
            scans += 1;
            if scan.is_idle() {
                idle += 1;
            } else {
                idle = 0;
            }
            scan.messages.into_iter().for_each(&mut sink);
        }
        Ok(scans)
    }

    /// Confirms the positions skipped since the last trusted header.
    ///
    /// Returns the offset to resume from when one of them changed underneath the scan.
    fn recheck(&self, unverified: &mut Unverified, offset: usize) -> Result<Option<usize>, RegionFault> {
        let Unverified { pending, zero_run } = core::mem::take(unverified);
        if let Some((at, word)) = pending {
            if self.region.load_word(at)? != word {
                return Ok(Some(at));
            }
        }
        if let Some(start) = zero_run {
            if let Some(claimed) = first_nonzero(&self.region, start, offset)? {
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    /// Copies the payload out, then zeroes payload words and finally the header.
    fn take(&self, offset: usize, len: usize) -> Result<Vec<u8>, RegionFault> {
        let base = offset + HEADER_SIZE;
        let words = len.div_ceil(4);
        let mut payload = Vec::with_capacity(words * 4);
        for index in 0..words {
            payload.extend_from_slice(&self.region.load_word(base + index * 4)?.to_le_bytes());
        }
        payload.truncate(len);
        for index in 0..words {
            self.region.store_word(base + index * 4, 0)?;
        }
        self.region.store_word(offset, 0)?;
        Ok(payload)
    }
}
