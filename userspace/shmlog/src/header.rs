// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Slot header word: `[pending:1][tag:15][len:16]`.
//!
//! A zero word is free space. Committed headers are `(tag << 16) | len`; a producer
//! that is still writing its payload keeps [`PENDING`] set.

/// Size of the header word in bytes.
pub const HEADER_SIZE: usize = 4;
/// Set while the owning producer writes the payload.
pub const PENDING: u32 = 1 << 31;
/// Largest producer tag; bit 15 of the tag field is the pending bit.
pub const MAX_TAG: u16 = 0x7FFF;
/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Rounds `n` up to the next multiple of four.
#[inline]
pub const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Decoded view of one header word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotHeader {
    Free,
    Pending { tag: u16, len: u16 },
    Committed { tag: u16, len: u16 },
}

impl SlotHeader {
    pub const fn decode(word: u32) -> Self {
        if word == 0 {
            return Self::Free;
        }
        let tag = ((word >> 16) as u16) & MAX_TAG;
        let len = word as u16;
        if word & PENDING != 0 {
            Self::Pending { tag, len }
        } else {
            Self::Committed { tag, len }
        }
    }

    pub const fn encode(self) -> u32 {
        match self {
            Self::Free => 0,
            Self::Pending { tag, len } => PENDING | pack(tag, len),
            Self::Committed { tag, len } => pack(tag, len),
        }
    }

    /// Payload length in bytes (zero for free space).
    pub const fn payload_len(self) -> usize {
        match self {
            Self::Free => 0,
            Self::Pending { len, .. } | Self::Committed { len, .. } => len as usize,
        }
    }

    /// Distance to the next header: the whole slot, or one word of free space.
    pub const fn stride(self) -> usize {
        HEADER_SIZE + align4(self.payload_len())
    }
}

const fn pack(tag: u16, len: u16) -> u32 {
    (((tag & MAX_TAG) as u32) << 16) | len as u32
}

/// Bytes a slot with a `len`-byte payload occupies.
#[inline]
pub const fn slot_size(len: usize) -> usize {
    HEADER_SIZE + align4(len)
}
