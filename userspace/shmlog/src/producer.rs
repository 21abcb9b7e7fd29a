// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Producer side: first-fit claim by compare-and-swap, then payload, then commit.
//!
//! A claim is only kept if the slot still lies on the slot chain walked from offset 0
//! and its whole range is still free after the header CAS. Otherwise the claim is
//! withdrawn and the scan restarts. Losses are charged against a retry budget so an
//! append always finishes in a bounded number of steps.
//!
//! No stored payload word is ever zero. A producer acting on a stale header can only
//! CAS a claim into a zero word, so it can never land inside committed data; a stray
//! claim inside a slot that is still pending is overwritten by the owner's store.
//! The only header a producer ever zeroes is its own pending claim.

use crate::header::{slot_size, SlotHeader, HEADER_SIZE, MAX_PAYLOAD, MAX_TAG};
use crate::region::{first_nonzero, LogRegion, RegionFault};
use crate::LogError;

/// Tunables for one producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Lost CAS races, withdrawn claims and restarts tolerated per append.
    pub retry_budget: u32,
}

impl ProducerConfig {
    /// Budget sized for `peers` concurrent producers.
    pub const fn for_peers(peers: u32) -> Self {
        let peers = if peers == 0 { 1 } else { peers };
        Self { retry_budget: peers.saturating_mul(16) }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self::for_peers(1)
    }
}

/// One writer identified by its tag.
pub struct Producer<R> {
    region: R,
    tag: u16,
    config: ProducerConfig,
    written: u64,
    dropped: u64,
    stranded: u64,
}

impl<R: LogRegion> Producer<R> {
    pub fn new(region: R, tag: u16, config: ProducerConfig) -> Result<Self, LogError> {
        if tag > MAX_TAG {
            return Err(LogError::InvalidTag(tag));
        }
        Ok(Self { region, tag, config, written: 0, dropped: 0, stranded: 0 })
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Messages committed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Messages refused or dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Pending claims left behind because the region faulted before they could be
    /// withdrawn. Each one keeps the consumer from going idle until the region is reset.
    pub fn stranded(&self) -> u64 {
        self.stranded
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    /// Appends one message and returns the offset of its slot.
    ///
    /// A full log is not retried: the message is dropped and counted.
    pub fn append(&mut self, payload: &[u8]) -> Result<usize, LogError> {
        match self.try_append(payload) {
            Ok(offset) => {
                self.written += 1;
                Ok(offset)
            }
            Err(err) => {
                self.dropped += 1;
                Err(err)
            }
        }
    }

    fn try_append(&mut self, payload: &[u8]) -> Result<usize, LogError> {
        let len = payload.len();
        if len == 0 {
            return Err(LogError::Empty);
        }
        if len > MAX_PAYLOAD || slot_size(len) > self.region.len() {
            return Err(LogError::TooLong { len });
        }
        if let Some(word) = payload.chunks(4).position(|chunk| pack_word(chunk) == 0) {
            return Err(LogError::ZeroWord { word });
        }
        let claim = SlotHeader::Pending { tag: self.tag, len: len as u16 };
        let offset = self.claim(claim, slot_size(len))?;
        if let Err(fault) = self.publish(offset, claim, payload) {
            // Never committed, so no reader can be holding it; give the space back.
            if !matches!(self.withdraw(offset, claim.encode()), Ok(true)) {
                self.stranded += 1;
            }
            return Err(fault.into());
        }
        Ok(offset)
    }

    fn claim(&self, claim: SlotHeader, need: usize) -> Result<usize, LogError> {
        let bound = self.region.len();
        let word = claim.encode();
        let mut retries = 0u32;
        let mut offset = 0usize;
        loop {
            if offset + need > bound {
                if self.reaches(offset)? {
                    return Err(LogError::Full);
                }
                self.spend(&mut retries)?;
                offset = 0;
                continue;
            }

            let current = self.region.load_word(offset)?;
            if current != 0 {
                offset = self.skip(offset, current, &mut retries)?;
                continue;
            }
            if let Some(obstacle) = first_nonzero(&self.region, offset + HEADER_SIZE, offset + need)? {
                offset = obstacle;
                continue;
            }

            if let Err(actual) = self.region.compare_exchange_word(offset, 0, word)? {
                self.spend(&mut retries)?;
                offset = self.skip(offset, actual, &mut retries)?;
                continue;
            }

            let range_free = first_nonzero(&self.region, offset + HEADER_SIZE, offset + need)?.is_none();
            if range_free && self.reaches(offset)? {
                return Ok(offset);
            }
            // A claim that is already gone was overwritten by the owner of the slot it
            // strayed into; either way nothing of ours is left at `offset`.
            self.withdraw(offset, word)?;
            self.spend(&mut retries)?;
            offset = 0;
        }
    }

    /// Next candidate after the occupied word at `offset`; restarts past the end.
    fn skip(&self, offset: usize, occupant: u32, retries: &mut u32) -> Result<usize, LogError> {
        let next = offset + SlotHeader::decode(occupant).stride();
        if next > self.region.len() {
            self.spend(retries)?;
            return Ok(0);
        }
        Ok(next)
    }

    /// Zeroes our own pending claim; false when the word no longer holds it.
    fn withdraw(&self, offset: usize, claim: u32) -> Result<bool, RegionFault> {
        Ok(self.region.compare_exchange_word(offset, claim, 0)?.is_ok())
    }

    /// True when walking the slot chain from offset 0 lands exactly on `target`.
    fn reaches(&self, target: usize) -> Result<bool, RegionFault> {
        let mut offset = 0;
        while offset < target {
            offset += SlotHeader::decode(self.region.load_word(offset)?).stride();
        }
        Ok(offset == target)
    }

    fn spend(&self, retries: &mut u32) -> Result<(), LogError> {
        *retries += 1;
        if *retries > self.config.retry_budget {
            return Err(LogError::Contended);
        }
        Ok(())
    }

    fn publish(&self, offset: usize, claim: SlotHeader, payload: &[u8]) -> Result<(), RegionFault> {
        let base = offset + HEADER_SIZE;
        // Plain stores: they also overwrite any stray claim that landed here while the
        // word was still zero.
        for (index, chunk) in payload.chunks(4).enumerate() {
            self.region.store_word(base + index * 4, pack_word(chunk))?;
        }
        let committed = match claim {
            SlotHeader::Pending { tag, len } => SlotHeader::Committed { tag, len },
            other => other,
        };
        self.region.store_word(offset, committed.encode())
    }
}

/// Little-endian word from up to four payload bytes, zero padded.
fn pack_word(chunk: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes[..chunk.len()].copy_from_slice(chunk);
    u32::from_le_bytes(bytes)
}
