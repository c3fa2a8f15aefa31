// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shutdown-signal handling and pid-file lifecycle.
//!
//! `SIGHUP`/`SIGINT`/`SIGTERM` only flip an atomic flag from the
//! handler — async-signal-safe by construction. The actual cleanup
//! (removing the pid file, logging, exiting) happens on the event
//! loop's side after the next interrupted `poll` returns, not inside
//! the handler itself.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install handlers for the three shutdown signals.
pub fn install() -> std::io::Result<()> {
    for signum in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = request_shutdown as usize;
        action.sa_flags = 0;
        // SAFETY: action is fully initialized before use.
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        // SAFETY: action is a fully initialized sigaction; signum is one
        // of the three constants above.
        if unsafe { libc::sigaction(signum, &action, std::ptr::null_mut()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Has a shutdown signal arrived since the last check?
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Writes the daemon's pid on construction, unlinks the file on drop.
/// A no-op guard (no path) is returned when `-p` wasn't given.
pub struct PidFile {
    path: Option<std::path::PathBuf>,
}

impl PidFile {
    pub fn none() -> Self {
        Self { path: None }
    }

    pub fn write(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path: Some(path) })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_is_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkplugd.pid");

        {
            let _guard = PidFile::write(&path).unwrap();
            let contents = std::fs::read_to_string(&path).unwrap();
            assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
        }

        assert!(!path.exists());
    }

    #[test]
    fn none_guard_touches_nothing() {
        let guard = PidFile::none();
        drop(guard);
    }
}
