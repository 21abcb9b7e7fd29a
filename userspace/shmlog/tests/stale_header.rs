// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Producer acting on a header that changed between its load and its claim
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! TEST_SCOPE:
//!   - A claim made from a stale skip never lands inside another producer's payload
//!   - Payloads that would store an all-zero word are refused before any claim
//!
//! TEST_SCENARIOS:
//!   - stale_skip_cannot_claim_inside_committed_payload(): the slot the producer skipped
//!     is consumed and replaced by a longer one before the producer's next load

use std::cell::RefCell;

use nexus_shmlog::{
    Consumer, ConsumerConfig, LocalRegion, LogError, LogRegion, Producer, ProducerConfig, RegionFault,
};

/// Runs `hook` once, right before the first load of `trigger`.
struct BeforeLoad<'a> {
    inner: &'a LocalRegion,
    trigger: usize,
    hook: RefCell<Option<Box<dyn FnOnce() + 'a>>>,
}

impl LogRegion for BeforeLoad<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn load_word(&self, offset: usize) -> Result<u32, RegionFault> {
        if offset == self.trigger {
            let hook = self.hook.borrow_mut().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        self.inner.load_word(offset)
    }

    fn store_word(&self, offset: usize, value: u32) -> Result<(), RegionFault> {
        self.inner.store_word(offset, value)
    }

    fn compare_exchange_word(&self, offset: usize, current: u32, new: u32) -> Result<Result<u32, u32>, RegionFault> {
        self.inner.compare_exchange_word(offset, current, new)
    }
}

#[test]
fn stale_skip_cannot_claim_inside_committed_payload() {
    let region = LocalRegion::new(64);
    let mut first = Producer::new(&region, 1, ProducerConfig::for_peers(3)).expect("producer 1");
    assert_eq!(first.append(b"aaaa"), Ok(0));

    // Zero bytes inside the payload, but every stored word keeps a non-zero byte.
    let replacement: &[u8] = b"qqqq\x01\0\0\0\0\0\0\x02";
    let swap = || {
        let mut consumer = Consumer::new(&region, ConsumerConfig::default());
        let taken = consumer.scan().expect("scan").messages;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].payload, b"aaaa");

        let mut third = Producer::new(&region, 3, ProducerConfig::for_peers(3)).expect("producer 3");
        assert_eq!(third.append(b"qqqq\0\0\0\0\0\0\0\0"), Err(LogError::ZeroWord { word: 1 }));
        assert_eq!(third.append(replacement), Ok(0));
    };
    // Producer 2 reads the 8-byte slot at 0 and moves to 8; the swap happens before it
    // looks at 8, so offset 8 is now the middle of a 16-byte slot.
    let stale = BeforeLoad { inner: &region, trigger: 8, hook: RefCell::new(Some(Box::new(swap))) };
    let mut second = Producer::new(&stale, 2, ProducerConfig::for_peers(3)).expect("producer 2");
    assert_eq!(second.append(b"pppp"), Ok(16));

    let mut consumer = Consumer::new(&region, ConsumerConfig::default());
    let got: Vec<(u16, Vec<u8>, usize)> =
        consumer.scan().expect("scan").messages.into_iter().map(|m| (m.tag, m.payload, m.offset)).collect();
    assert_eq!(got, vec![(3, replacement.to_vec(), 0), (2, b"pppp".to_vec(), 16)]);
    assert!(consumer.scan().expect("scan").is_idle());
}
