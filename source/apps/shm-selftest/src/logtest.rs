// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-process logging: every child maps the parent's page and appends messages of
//! three lengths; the parent is the single consumer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{anyhow, bail, Context as _};
use neuron_shm::mm::PAGE_SIZE;
use neuron_shm::syscall::{SyscallTable, SYSCALL_FAILED};
use neuron_shm::types::Pid;
use neuron_shm::ulib::UserProcess;
use neuron_shm::Kernel;
use nexus_shmlog::{Consumer, ConsumerConfig, LogError, Message, Producer, ProducerConfig};

#[derive(Clone, Copy, Debug)]
pub struct LogTestConfig {
    pub producers: u16,
    pub messages_per_producer: usize,
    /// Extra messages for child 0.
    pub overflow: usize,
    pub idle_scans: u32,
}

/// Counts reported by one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogTestReport {
    /// Messages each child reports as written, by child index.
    pub written: Vec<u64>,
    pub read: u64,
}

/// Payload for message `i` of child `index`, cycling short, medium and long.
pub fn message(index: u16, i: usize) -> String {
    let digit = i % 10;
    match i % 3 {
        0 => format!("Child {index}: Short msg {digit}"),
        1 => format!("Child {index}: Medium length message {digit} with more text"),
        _ => format!(
            "Child {index}: Very long message number {digit} with lots of extra text to test variable length handling"
        ),
    }
}

pub fn run(kernel: &Kernel, table: &SyscallTable, config: &LogTestConfig) -> anyhow::Result<LogTestReport> {
    println!("Starting multi-process logging test with {} children", config.producers);
    let parent = UserProcess::spawn(kernel, table).map_err(|err| anyhow!("spawn parent: {err:?}"))?;
    let buffer = parent.sbrk(PAGE_SIZE as isize);
    if buffer == SYSCALL_FAILED {
        bail!("Failed to allocate buffer");
    }
    let window = parent.window(buffer, PAGE_SIZE).context("parent vanished")?;
    window.write_bytes(0, &[0u8; PAGE_SIZE]).map_err(|err| anyhow!("zero buffer: {err:?}"))?;

    let children = (0..config.producers)
        .map(|_| parent.spawn_child())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| anyhow!("Fork failed: {err:?}"))?;
    let live = AtomicUsize::new(children.len());
    let parent_pid = parent.pid();

    let mut consumer = Consumer::new(window, ConsumerConfig { max_empty_scans: config.idle_scans });
    let written = thread::scope(|scope| -> anyhow::Result<Vec<u64>> {
        let handles: Vec<_> = children
            .into_iter()
            .zip(0u16..)
            .map(|(child, index)| {
                let live = &live;
                scope.spawn(move || {
                    let wrote = child_main(child, index, parent_pid, buffer, config);
                    live.fetch_sub(1, Ordering::SeqCst);
                    wrote
                })
            })
            .collect();

        println!("Parent starting to read messages...");
        while live.load(Ordering::SeqCst) > 0 {
            consumer.scan()?.messages.into_iter().for_each(print_message);
        }
        consumer.drain_with(print_message)?;

        handles.into_iter().map(|handle| handle.join().map_err(|_| anyhow!("child panicked"))).collect()
    })?;

    let read = consumer.consumed();
    println!("Parent finished reading. Total messages processed: {read}");
    println!("Logging test completed");
    parent.exit(0);
    Ok(LogTestReport { written, read })
}

fn print_message(message: Message) {
    println!(
        "Message from child {} (len={}): {}",
        message.tag,
        message.payload.len(),
        String::from_utf8_lossy(&message.payload)
    );
}

/// Child body; returns how many messages it committed.
fn child_main(child: UserProcess<'_>, index: u16, parent: Pid, buffer: usize, config: &LogTestConfig) -> u64 {
    let alias = child.map_shared_pages(parent, buffer, PAGE_SIZE);
    if alias == SYSCALL_FAILED {
        println!("Child {index}: Failed to map shared buffer");
        child.exit(1);
        return 0;
    }
    let written = match child.window(alias, PAGE_SIZE) {
        Some(window) => produce(window, index, config),
        None => 0,
    };
    println!("Child {index} wrote {written} messages");
    child.unmap_shared_pages(alias, PAGE_SIZE);
    child.exit(0);
    written
}

fn produce<R: nexus_shmlog::LogRegion>(region: R, index: u16, config: &LogTestConfig) -> u64 {
    let peers = ProducerConfig::for_peers(u32::from(config.producers));
    let Ok(mut producer) = Producer::new(region, index, peers) else {
        return 0;
    };
    let extra = if index == 0 { config.overflow } else { 0 };
    for i in 0..config.messages_per_producer + extra {
        match producer.append(message(index, i).as_bytes()) {
            Ok(_) => {}
            // Reached end of buffer.
            Err(LogError::Full) => break,
            Err(LogError::Contended) => continue,
            Err(err) => {
                println!("Child {index}: {err}");
                break;
            }
        }
    }
    producer.written()
}
