// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Stdout sink for kernel log lines.

use core::fmt::Arguments;

use neuron_shm::diag::log::{install_sink, Level, LogSink};

struct Stdout;

impl LogSink for Stdout {
    fn write_line(&self, level: Level, target: &'static str, args: Arguments<'_>) {
        println!("[{} {}] {}", level.tag(), target, args);
    }
}

static STDOUT: Stdout = Stdout;

pub fn install() {
    let _ = install_sink(&STDOUT);
}
