//! CONTEXT: Shared page mapping end-to-end test harness library
//! INTENT: Drive the hosted kernel through its syscall table the way user programs do
//! DEPS: neuron-shm (kernel core + user stubs), nexus-shmlog (kernel-region feature)
//! READINESS: Host backend ready; one thread per simulated process
//! TESTS: Alias visibility, shmem heap accounting, multi-producer log over an alias
// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use neuron_shm::diag::log::{install_sink, Level, LogSink};
use neuron_shm::mm::PAGE_SIZE;
use neuron_shm::syscall::{SyscallTable, SYSCALL_FAILED};
use neuron_shm::ulib::UserProcess;
use neuron_shm::{Kernel, KernelConfig};

/// One hosted kernel plus its dispatch table.
pub struct Machine {
    pub kernel: Kernel,
    pub table: SyscallTable,
}

impl Machine {
    pub fn new(frames: u32) -> Self {
        install_stderr_sink();
        Self {
            kernel: Kernel::new(KernelConfig { frames, ..KernelConfig::default() }),
            table: SyscallTable::with_default_handlers(),
        }
    }

    /// Spawns a root process.
    pub fn spawn(&self) -> UserProcess<'_> {
        UserProcess::spawn(&self.kernel, &self.table).expect("spawn")
    }

    /// True once every frame is back in the pool.
    pub fn all_frames_free(&self) -> bool {
        self.kernel.frames().free_frames() == self.kernel.frames().capacity()
    }
}

/// Allocates `pages` heap pages in `process` and returns their base.
pub fn alloc_pages(process: &UserProcess<'_>, pages: usize) -> usize {
    let va = process.sbrk((pages * PAGE_SIZE) as isize);
    assert_ne!(va, SYSCALL_FAILED, "sbrk({pages} pages) failed");
    va
}

struct Stderr;

impl LogSink for Stderr {
    fn write_line(&self, level: Level, target: &'static str, args: core::fmt::Arguments<'_>) {
        eprintln!("[{} {}] {}", level.tag(), target, args);
    }
}

static STDERR: Stderr = Stderr;

/// Routes kernel log lines to stderr so they show up for failing tests.
pub fn install_stderr_sink() {
    let _ = install_sink(&STDERR);
}
