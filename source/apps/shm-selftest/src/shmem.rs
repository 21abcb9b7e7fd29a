// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Parent shares one heap page; the child maps it, writes a greeting and reports its
//! heap size around map, unmap and a large allocation.

use std::thread;

use anyhow::{anyhow, bail, Context as _};
use neuron_shm::mm::PAGE_SIZE;
use neuron_shm::syscall::{SyscallTable, SYSCALL_FAILED};
use neuron_shm::types::Pid;
use neuron_shm::ulib::UserProcess;
use neuron_shm::Kernel;

/// Greeting the child leaves in the shared page.
pub const GREETING: &str = "Hello daddy";

const CHILD_ALLOCATION: isize = 100_000;

/// Runs the scenario and returns what the parent read back.
pub fn run(kernel: &Kernel, table: &SyscallTable, keep: bool) -> anyhow::Result<String> {
    let parent = UserProcess::spawn(kernel, table).map_err(|err| anyhow!("spawn parent: {err:?}"))?;
    let va = parent.sbrk(PAGE_SIZE as isize);
    if va == SYSCALL_FAILED {
        bail!("malloc failed");
    }
    println!("Parent allocated va: {va:#x}");

    let child = parent.spawn_child().map_err(|err| anyhow!("fork failed: {err:?}"))?;
    let parent_pid = parent.pid();
    // wait(0)
    thread::scope(|scope| scope.spawn(move || child_main(child, parent_pid, va, keep)).join())
        .map_err(|_| anyhow!("child panicked"))??;

    let text = read_c_string(&parent, va)?;
    println!("parent says va contains: {text}");
    parent.exit(0);
    Ok(text)
}

fn child_main(child: UserProcess<'_>, parent: Pid, va: usize, keep: bool) -> anyhow::Result<()> {
    println!("Child memory before mapping: {}", child.sbrk(0));
    let p = child.map_shared_pages(parent, va, PAGE_SIZE);
    println!("Child memory after mapping: {}", child.sbrk(0));
    if p == SYSCALL_FAILED {
        println!("map_shared_pages failed");
        child.exit(1);
        bail!("map_shared_pages failed");
    }

    let memory = child.memory().context("child vanished")?;
    let mut greeting = GREETING.as_bytes().to_vec();
    greeting.push(0);
    memory.write_bytes(p, &greeting).map_err(|err| anyhow!("write through alias: {err:?}"))?;

    if !keep {
        if child.unmap_shared_pages(p, PAGE_SIZE) == SYSCALL_FAILED {
            bail!("unmap_shared_pages failed");
        }
        println!("Child memory after unmapping: {}", child.sbrk(0));
    }

    if child.sbrk(CHILD_ALLOCATION) == SYSCALL_FAILED {
        bail!("malloc failed");
    }
    println!("Child memory after malloc: {}", child.sbrk(0));
    child.exit(0);
    Ok(())
}

fn read_c_string(process: &UserProcess<'_>, va: usize) -> anyhow::Result<String> {
    let memory = process.memory().context("parent vanished")?;
    let mut buf = vec![0u8; 64];
    memory.read_bytes(va, &mut buf).map_err(|err| anyhow!("read shared page: {err:?}"))?;
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
