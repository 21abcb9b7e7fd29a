// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host selftest for shared page mapping and the shared-memory message log
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Scenarios are mirrored by tests/shm_e2e
//!
//! PUBLIC API:
//!   - `shm-selftest shmem [--keep]`: child maps the parent's page and writes a greeting
//!   - `shm-selftest log`: children log through one shared page, the parent drains it
//!
//! Each simulated process runs on its own thread against one hosted kernel instance.
//!

#![forbid(unsafe_code)]

mod logtest;
mod shmem;
mod sink;

use clap::{Parser, Subcommand};
use neuron_shm::syscall::SyscallTable;
use neuron_shm::{Kernel, KernelConfig};

#[derive(Debug, Parser)]
#[command(name = "shm-selftest", about = "Shared page mapping selftests")]
struct Cli {
    /// Physical frames available to the hosted kernel.
    #[arg(long, default_value_t = 1024)]
    frames: u32,

    /// Print kernel log lines to stdout.
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parent/child page sharing with heap-size reporting.
    Shmem {
        /// Let the child exit with the mapping still installed.
        #[arg(long)]
        keep: bool,
    },
    /// Multi-process logging through one shared page.
    Log {
        /// Number of child producers.
        #[arg(long, default_value_t = 4)]
        producers: u16,
        /// Messages written by every child.
        #[arg(long, default_value_t = 10)]
        messages_per_producer: usize,
        /// Extra messages written by child 0 to overflow the page.
        #[arg(long, default_value_t = 50)]
        overflow: usize,
        /// Consecutive empty scans after which the parent stops reading.
        #[arg(long, default_value_t = 100)]
        idle_scans: u32,
    },
}

fn main() {
    let cli = Cli::parse();
    if cli.verbose {
        sink::install();
    }
    if let Err(err) = run(cli) {
        eprintln!("shm-selftest: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let kernel = Kernel::new(KernelConfig { frames: cli.frames, ..KernelConfig::default() });
    let table = SyscallTable::with_default_handlers();
    match cli.command {
        Command::Shmem { keep } => {
            shmem::run(&kernel, &table, keep)?;
            println!("SELFTEST: shmem ok");
        }
        Command::Log { producers, messages_per_producer, overflow, idle_scans } => {
            let config = logtest::LogTestConfig { producers, messages_per_producer, overflow, idle_scans };
            logtest::run(&kernel, &table, &config)?;
            println!("SELFTEST: log ok");
        }
    }
    if kernel.frames().free_frames() != kernel.frames().capacity() {
        anyhow::bail!(
            "frame leak: {} of {} frames free after all processes exited",
            kernel.frames().free_frames(),
            kernel.frames().capacity()
        );
    }
    Ok(())
}
