// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all)]

//! CONTEXT: Multi-producer, single-consumer message log living in a shared region
//!
//! OWNERS: @runtime
//!
//! STATUS: Functional
//!
//! API_STABILITY: Unstable
//!
//! TEST_COVERAGE: Unit tests per module; threaded scenarios in `tests/concurrent_log.rs`;
//!   kernel-backed scenarios in `tests/shm_e2e`
//!
//! The region is a run of variable-length slots starting at offset 0, each a 4-byte
//! header followed by the payload padded to 4 bytes. Producers find space by a linear
//! scan and claim it with a compare-and-swap on the header word; the consumer walks the
//! same chain, copies committed payloads out and zeroes the slot. There is no index and
//! no wraparound: once the tail is occupied, appends fail with [`LogError::Full`] until
//! the consumer frees space.
//!

pub mod consumer;
pub mod header;
#[cfg(feature = "kernel-region")]
pub mod kernel_region;
pub mod producer;
pub mod region;

pub use consumer::{Consumer, ConsumerConfig, DrainReport, Message, Scan};
pub use header::{SlotHeader, HEADER_SIZE, MAX_PAYLOAD, MAX_TAG, PENDING};
pub use producer::{Producer, ProducerConfig};
pub use region::{LocalRegion, LogRegion, RegionFault};

/// Errors reported by producers and the consumer.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    /// Zero-length payloads would be indistinguishable from a free header.
    #[error("empty payload")]
    Empty,
    /// Payload cannot fit the header length field or the region.
    #[error("payload of {len} bytes can never fit")]
    TooLong { len: usize },
    /// Payload word `word` (zero padding included) would be stored as all zero bytes,
    /// which reads as free space to other producers.
    #[error("payload word {word} is all zero bytes")]
    ZeroWord { word: usize },
    /// Tag collides with the pending bit.
    #[error("tag {0:#x} exceeds {max:#x}", max = MAX_TAG)]
    InvalidTag(u16),
    /// No free slot large enough remains before the end of the region.
    #[error("log full")]
    Full,
    /// Retry budget exhausted while racing other producers.
    #[error("retry budget exhausted")]
    Contended,
    /// The region became inaccessible (for example the alias was unmapped).
    #[error(transparent)]
    Fault(#[from] RegionFault),
}
