// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dual-backend logger: level-prefixed stdout/stderr in the foreground,
//! or a direct BSD-syslog datagram when running as a background daemon.
//!
//! The `-D` flag enables debug-level records; below that, `Level::Debug`
//! and `Level::Trace` records are dropped before formatting.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::process;
use std::sync::Mutex;

const SYSLOG_PATHS: [&str; 3] = ["/dev/log", "/var/run/syslog", "/var/run/log"];

/// `LOG_DAEMON` facility, numeric priority base (facility * 8).
const FACILITY_DAEMON: u8 = 3 * 8;

enum Backend {
    /// stdout/stderr with the original daemon's prefixes.
    Foreground,
    /// A connected datagram socket to the local syslog daemon.
    Syslog(Mutex<UnixDatagram>),
}

struct DaemonLogger {
    backend: Backend,
    debug: bool,
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() != Level::Debug || self.debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        match &self.backend {
            Backend::Foreground => write_foreground(record),
            Backend::Syslog(socket) => write_syslog(socket, record),
        }
    }

    fn flush(&self) {}
}

fn write_foreground(record: &Record) {
    let (prefix, to_stderr) = match record.level() {
        Level::Error => ("Error: ", true),
        Level::Warn => ("Warning: ", true),
        Level::Info | Level::Debug | Level::Trace => ("", false),
    };

    let line = format!("{prefix}{}", record.args());
    if to_stderr {
        let _ = writeln!(std::io::stderr(), "{line}");
    } else {
        let _ = writeln!(std::io::stdout(), "{line}");
    }
}

fn write_syslog(socket: &Mutex<UnixDatagram>, record: &Record) {
    let severity = match record.level() {
        Level::Error => 3,
        Level::Warn => 4,
        Level::Info => 6,
        Level::Debug | Level::Trace => 7,
    };
    let pri = FACILITY_DAEMON + severity;
    let msg = format!("<{pri}>linkplugd[{}]: {}", process::id(), record.args());

    if let Ok(socket) = socket.lock() {
        let _ = socket.send(msg.as_bytes());
    }
}

fn connect_syslog() -> std::io::Result<UnixDatagram> {
    let socket = UnixDatagram::unbound()?;
    for path in SYSLOG_PATHS {
        if std::path::Path::new(path).exists() && socket.connect(path).is_ok() {
            return Ok(socket);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no syslog socket found",
    ))
}

/// Install the process-wide logger. `foreground` selects the backend;
/// `debug` raises the max level to include `Level::Debug` records.
pub fn init(foreground: bool, debug: bool) -> std::io::Result<()> {
    let backend = if foreground {
        Backend::Foreground
    } else {
        Backend::Syslog(Mutex::new(connect_syslog()?))
    };

    let logger = Box::new(DaemonLogger { backend, debug });
    log::set_max_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    log::set_boxed_logger(logger).map_err(|e| std::io::Error::other(e.to_string()))
}
