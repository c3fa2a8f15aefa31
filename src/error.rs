// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the daemon.
//!
//! A malformed kernel frame, a kernel error reply, or a programming-error
//! state transition all abort the process. Everything else (`EINTR`,
//! transient overrun, unknown reaper pid) is handled inline and never
//! reaches here.

use thiserror::Error;

/// Daemon-wide result alias.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Fatal error conditions. Any of these is logged once and the process
/// exits with status 1.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kernel socket error: {0}")]
    Socket(String),

    #[error("malformed netlink frame: {0}")]
    MalformedFrame(String),

    #[error("kernel rejected request: {0}")]
    KernelReply(String),

    #[error("{source}: bad pattern: {pattern}")]
    InvalidPattern { source: String, pattern: String },

    #[error("fork/exec of helper failed: {0}")]
    HelperSpawn(std::io::Error),

    #[error("unexpected state {state} for interface {iface} during {transition}")]
    BadTransition {
        iface: String,
        state: &'static str,
        transition: &'static str,
    },

    #[error("shutdown signal received")]
    Shutdown,
}
