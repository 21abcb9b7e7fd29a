// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared page mapping end-to-end through the syscall table
//! INTENT: Writes through an alias land in the source's frame and vice versa
//! DEPS: neuron-shm
//!
//! TEST_SCOPE:
//!   - Byte visibility in both directions across two processes
//!   - Heap break accounting around map, unmap and allocation (shmem scenario)
//!   - Exit teardown returns every frame, with and without the mapping kept
//!
//! TEST_SCENARIOS:
//!   - aa_then_bb_round_trip(): source writes 0xAA, destination reads it and writes 0xBB
//!   - shmem_greeting_with_unmap(): "Hello daddy" plus heap sizes before/after
//!   - shmem_greeting_keep_mapping(): child exits with the alias still installed
//!   - threads_see_each_others_writes(): processes on separate threads share a counter

use std::thread;

use neuron_shm::mm::{PAGE_SIZE, USER_BASE};
use neuron_shm::syscall::SYSCALL_FAILED;
use shm_e2e::{alloc_pages, Machine};

#[test]
fn aa_then_bb_round_trip() {
    let machine = Machine::new(64);
    let source = machine.spawn();
    let destination = source.spawn_child().expect("child");
    let va = alloc_pages(&source, 1);
    source.memory().expect("source").write_u8(va, 0xAA).expect("write AA");

    let alias = destination.map_shared_pages(source.pid(), va, PAGE_SIZE);
    assert_ne!(alias, SYSCALL_FAILED);
    let dst_mem = destination.memory().expect("destination");
    assert_eq!(dst_mem.read_u8(alias), Ok(0xAA));
    dst_mem.write_u8(alias, 0xBB).expect("write BB");
    assert_eq!(source.memory().expect("source").read_u8(va), Ok(0xBB));

    destination.exit(0);
    source.exit(0);
    assert!(machine.all_frames_free());
}

fn greeting_scenario(keep: bool) {
    let machine = Machine::new(128);
    let parent = machine.spawn();
    let va = alloc_pages(&parent, 1);
    let child = parent.spawn_child().expect("child");
    let parent_pid = parent.pid();

    thread::scope(|scope| {
        scope
            .spawn(move || {
                let before = child.sbrk(0);
                assert_eq!(before, USER_BASE);
                let p = child.map_shared_pages(parent_pid, va, PAGE_SIZE);
                assert_ne!(p, SYSCALL_FAILED);
                assert_eq!(child.sbrk(0), before + PAGE_SIZE);
                child.memory().expect("child").write_bytes(p, b"Hello daddy\0").expect("write");
                if !keep {
                    assert_eq!(child.unmap_shared_pages(p, PAGE_SIZE), 0);
                    assert_eq!(child.sbrk(0), before);
                }
                let grown = child.sbrk(100_000);
                assert_ne!(grown, SYSCALL_FAILED);
                assert_eq!(child.sbrk(0), grown + 100_000);
                child.exit(0);
            })
            .join()
            .expect("child thread");
    });

    let mut buf = [0u8; 12];
    parent.memory().expect("parent").read_bytes(va, &mut buf).expect("read");
    assert_eq!(&buf, b"Hello daddy\0");
    assert!(machine.kernel.mappings().is_empty());
    parent.exit(0);
    assert!(machine.all_frames_free());
}

#[test]
fn shmem_greeting_with_unmap() {
    greeting_scenario(false);
}

#[test]
fn shmem_greeting_keep_mapping() {
    greeting_scenario(true);
}

#[test]
fn threads_see_each_others_writes() {
    let machine = Machine::new(64);
    let owner = machine.spawn();
    let va = alloc_pages(&owner, 1);
    let peers: Vec<_> = (0..4).map(|_| owner.spawn_child().expect("child")).collect();

    thread::scope(|scope| {
        for peer in &peers {
            let peer = *peer;
            let owner_pid = owner.pid();
            scope.spawn(move || {
                let alias = peer.map_shared_pages(owner_pid, va, PAGE_SIZE);
                assert_ne!(alias, SYSCALL_FAILED);
                let mem = peer.memory().expect("peer");
                for _ in 0..1000 {
                    loop {
                        let current = mem.load_u32(alias).expect("load");
                        if mem.compare_exchange_u32(alias, current, current + 1).expect("cas").is_ok() {
                            break;
                        }
                    }
                }
                peer.exit(0);
            });
        }
    });

    assert_eq!(owner.memory().expect("owner").load_u32(va), Ok(4000));
    owner.exit(0);
    assert!(machine.all_frames_free());
}
