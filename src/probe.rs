// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Startup autoprobe pass (skippable with `-P`).
//!
//! Some drivers only register an interface with the kernel once
//! something asks about it by name, so before the initial dump we run
//! the helper synchronously, once, with action `probe`, against every
//! interface our patterns could plausibly name. A literal pattern is
//! probed directly. A pattern whose first metacharacter isn't the very
//! first byte yields a literal prefix (capped at 3 characters) that we
//! pair with every trailing digit 0-15, probing whichever synthesized
//! name still matches the pattern. A pattern that opens with a
//! metacharacter names no literal prefix at all, so it's skipped with a
//! warning. Unlike `supervisor::Supervisor::launch`, this doesn't track
//! the child through the self-pipe — each probe blocks until its helper
//! exits before the next one starts, and the exit status itself doesn't
//! matter (issuing the exec at all is what can coax a lazily-registered
//! driver into existing before the dump).

use crate::patterns::{first_meta, has_meta, pattern_matches, PatternSet};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

const MAX_PREFIX_LEN: usize = 3;
const MAX_TRAILING_DIGIT: u32 = 15;

/// Run the autoprobe pass over every pattern in `patterns`, synchronously
/// exec'ing `helper_path <name> probe` for each candidate name in turn.
pub fn run(patterns: &PatternSet, helper_path: &Path) {
    for pattern in patterns.iter() {
        probe_pattern(pattern, helper_path);
    }
}

fn probe_pattern(pattern: &str, helper_path: &Path) {
    if !has_meta(pattern) {
        probe_one(helper_path, pattern);
        return;
    }

    let meta_idx = first_meta(pattern).expect("has_meta implies first_meta is Some");
    if meta_idx == 0 {
        log::warn!("pattern {pattern:?} starts with a wildcard — skipping autoprobe");
        return;
    }

    let prefix: String = pattern.chars().take(meta_idx.min(MAX_PREFIX_LEN)).collect();
    for digit in 0..=MAX_TRAILING_DIGIT {
        let candidate = format!("{prefix}{digit}");
        if pattern_matches(pattern, &candidate) {
            probe_one(helper_path, &candidate);
        }
    }
}

fn probe_one(helper_path: &Path, name: &str) {
    let mut cmd = Command::new(helper_path);
    cmd.arg(name).arg("probe");
    // SAFETY: pre_exec runs in the forked child before exec; setpgid(0, 0)
    // makes it its own process group leader, which is all it does.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    match cmd.status() {
        Ok(_status) => {}
        Err(e) => log::warn!("autoprobe {name}: could not run {}: {e}", helper_path.display()),
    }
}
