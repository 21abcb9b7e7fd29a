// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Message log protocol over a kernel alias
//! INTENT: Producers in child processes, consumer in the parent, one shared page
//! DEPS: neuron-shm, nexus-shmlog (kernel-region)
//!
//! TEST_SCOPE:
//!   - Exactly the committed messages are read, each once, with the writer's tag
//!   - Overflowing the page drops messages locally without blocking or corrupting
//!   - A producer whose alias disappears sees a fault, not stale memory
//!
//! TEST_SCENARIOS:
//!   - four_children_forty_short_messages(): 4 x 10 messages, 100 idle scans, 40 read
//!   - overflow_child_stops_at_full(): child 0 writes 60 long-ish messages into 4 KiB
//!   - revoked_alias_faults_the_producer(): source exits while a child still logs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use neuron_shm::mm::PAGE_SIZE;
use neuron_shm::syscall::SYSCALL_FAILED;
use neuron_shm::ulib::UserProcess;
use nexus_shmlog::{Consumer, ConsumerConfig, LogError, Message, Producer, ProducerConfig, RegionFault};
use shm_e2e::{alloc_pages, Machine};

/// Runs one producer per child and a consumer in the parent; returns (written, read).
fn run_log(
    machine: &Machine,
    children: u16,
    payloads: impl Fn(u16) -> Vec<String> + Sync,
) -> (BTreeMap<u16, Vec<String>>, Vec<Message>) {
    let parent = machine.spawn();
    let buffer = alloc_pages(&parent, 1);
    let kids: Vec<UserProcess<'_>> = (0..children).map(|_| parent.spawn_child().expect("child")).collect();
    let live = AtomicUsize::new(kids.len());
    let mut consumer = Consumer::new(
        parent.window(buffer, PAGE_SIZE).expect("parent window"),
        ConsumerConfig { max_empty_scans: 100 },
    );

    let mut read = Vec::new();
    let mut written = BTreeMap::new();
    thread::scope(|scope| {
        let handles: Vec<_> = kids
            .into_iter()
            .zip(0u16..)
            .map(|(child, tag)| {
                let payloads = &payloads;
                let live = &live;
                let parent_pid = parent.pid();
                scope.spawn(move || {
                    let alias = child.map_shared_pages(parent_pid, buffer, PAGE_SIZE);
                    assert_ne!(alias, SYSCALL_FAILED);
                    let window = child.window(alias, PAGE_SIZE).expect("child window");
                    let mut producer =
                        Producer::new(window, tag, ProducerConfig::for_peers(u32::from(children))).expect("producer");
                    let mut ok = Vec::new();
                    for payload in payloads(tag) {
                        match producer.append(payload.as_bytes()) {
                            Ok(_) => ok.push(payload),
                            Err(LogError::Full) => break,
                            Err(err) => panic!("child {tag}: {err}"),
                        }
                    }
                    assert_eq!(child.unmap_shared_pages(alias, PAGE_SIZE), 0);
                    child.exit(0);
                    live.fetch_sub(1, Ordering::SeqCst);
                    (tag, ok)
                })
            })
            .collect();

        while live.load(Ordering::SeqCst) > 0 {
            read.extend(consumer.scan().expect("scan").messages);
        }
        read.extend(consumer.drain().expect("drain").messages);
        for handle in handles {
            let (tag, ok) = handle.join().expect("child thread");
            written.insert(tag, ok);
        }
    });

    parent.exit(0);
    assert!(machine.all_frames_free());
    (written, read)
}

fn by_tag(read: &[Message]) -> BTreeMap<u16, Vec<String>> {
    let mut map: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for message in read {
        map.entry(message.tag)
            .or_default()
            .push(String::from_utf8(message.payload.clone()).expect("utf8 payload"));
    }
    map
}

fn sorted(mut map: BTreeMap<u16, Vec<String>>) -> BTreeMap<u16, Vec<String>> {
    map.values_mut().for_each(|v| v.sort());
    map.retain(|_, v| !v.is_empty());
    map
}

#[test]
fn four_children_forty_short_messages() {
    let machine = Machine::new(64);
    let (written, read) = run_log(&machine, 4, |tag| (0..10).map(|i| format!("c{tag} m{i}")).collect());
    assert!(read.iter().all(|m| m.payload.len() < 16));
    assert_eq!(read.len(), 40);
    assert!(read.iter().all(|m| m.tag <= 3));
    assert_eq!(sorted(by_tag(&read)), sorted(written));
}

#[test]
fn overflow_child_stops_at_full() {
    let machine = Machine::new(64);
    let (written, read) = run_log(&machine, 2, |tag| {
        let count = if tag == 0 { 60 } else { 10 };
        (0..count).map(|i| format!("Child {tag}: Very long message number {i} with lots of extra text")).collect()
    });
    // Either the consumer kept up or child 0 hit the end of the page; nothing is lost
    // or duplicated in between.
    assert_eq!(sorted(by_tag(&read)), sorted(written));
}

#[test]
fn revoked_alias_faults_the_producer() {
    let machine = Machine::new(64);
    let parent = machine.spawn();
    let buffer = alloc_pages(&parent, 1);
    let child = parent.spawn_child().expect("child");
    let alias = child.map_shared_pages(parent.pid(), buffer, PAGE_SIZE);
    assert_ne!(alias, SYSCALL_FAILED);

    let mut producer =
        Producer::new(child.window(alias, PAGE_SIZE).expect("window"), 1, ProducerConfig::default()).expect("producer");
    producer.append(b"before exit").expect("append");

    parent.exit(0);
    assert_eq!(producer.append(b"after exit"), Err(LogError::Fault(RegionFault { offset: 0 })));
    assert_eq!((producer.written(), producer.dropped()), (1, 1));
    child.exit(0);
    assert!(machine.all_frames_free());
}
