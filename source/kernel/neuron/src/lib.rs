// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON shared-page mapping core (frame registry, alias mapper, unwinder)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptest in mm/shm, host integration in tests/
//! PUBLIC API: Kernel, KernelConfig, syscall::{SyscallTable, install_handlers}, ulib::UserProcess
//! DEPENDS_ON: bitflags, spin, static_assertions (no_std + alloc)
//! INVARIANTS: Frames return to the pool only from FrameTable::release; map is all-or-nothing

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod kernel;
pub mod mm;
pub mod shm;
pub mod syscall;
pub mod task;
pub mod types;
pub mod uaccess;
pub mod ulib;

pub use kernel::{Kernel, KernelConfig};
