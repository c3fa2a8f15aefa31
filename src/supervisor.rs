// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Child-process supervision (component C4): launches the helper
//! script in its own process group, reaps it via a `SIGCHLD` handler
//! feeding a self-pipe, and kills a group with a grace period before
//! escalating.

use crate::error::{DaemonError, Result};
use crate::state::{Action, HelperLauncher, Pid};
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

const GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Write end of the self-pipe, stashed here so the async-signal-safe
/// handler can reach it without touching any Rust-level allocation.
static SELF_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

/// One `(pid, status)` tuple, as handed from the reap path to the
/// state machine.
#[derive(Clone, Copy, Debug)]
pub struct ChildExit {
    pub pid: Pid,
    pub status: i32,
}

/// Launches and kills helpers, and exposes the self-pipe read end for
/// the event loop to poll.
pub struct Supervisor {
    helper_path: std::path::PathBuf,
    self_pipe_read: RawFd,
}

impl Supervisor {
    /// Install the `SIGCHLD` handler and create the self-pipe. Must be
    /// called once, before any helper is launched.
    pub fn new(helper_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid 2-element out-array for pipe(2).
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        set_nonblocking_cloexec(read_fd)?;
        set_nonblocking_cloexec(write_fd)?;

        SELF_PIPE_WRITE.store(write_fd, Ordering::SeqCst);
        install_sigchld_handler()?;

        Ok(Self {
            helper_path: helper_path.as_ref().to_path_buf(),
            self_pipe_read: read_fd,
        })
    }

    pub fn self_pipe_fd(&self) -> RawFd {
        self.self_pipe_read
    }

    /// Drain the self-pipe until `EAGAIN`, decoding each write from the
    /// signal handler into a `ChildExit`.
    pub fn drain_exits(&self) -> Result<Vec<ChildExit>> {
        let mut exits = Vec::new();
        loop {
            let mut raw = [0u8; std::mem::size_of::<RawChildExit>()];
            // SAFETY: raw is exactly sized for one RawChildExit; fd is
            // our non-blocking read end.
            let n = unsafe {
                libc::read(
                    self.self_pipe_read,
                    raw.as_mut_ptr() as *mut libc::c_void,
                    raw.len(),
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Ok(exits);
                }
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if n == 0 {
                return Ok(exits);
            }
            if n as usize != raw.len() {
                // A short read means the signal handler's write was
                // torn; nothing sane to do but stop for this pass.
                return Ok(exits);
            }
            // SAFETY: raw holds exactly size_of::<RawChildExit>() bytes
            // written atomically by the handler.
            let raw_exit: RawChildExit = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const RawChildExit) };
            exits.push(ChildExit {
                pid: raw_exit.pid,
                status: raw_exit.status,
            });
        }
    }
}

impl HelperLauncher for Supervisor {
    /// Fork into a fresh process group and exec the helper with
    /// `argv = [helper, iface, action]`.
    fn launch(&mut self, iface: &str, action: Action) -> Result<Pid> {
        let mut cmd = Command::new(&self.helper_path);
        cmd.arg(iface).arg(action.as_str());
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

        let child = cmd.spawn().map_err(DaemonError::HelperSpawn)?;
        Ok(child.id() as Pid)
    }

    /// `SIGTERM` the group, wait up to the grace period, then `SIGKILL`
    /// if it's still around. Blocks `SIGCHLD` for the duration so the
    /// handler can't race this synchronous wait.
    fn kill(&mut self, pid: Pid) -> Result<()> {
        block_sigchld();

        // SAFETY: pid is a process group leader we launched; killpg with
        // a valid signal number is infallible UB-wise.
        unsafe { libc::killpg(pid, libc::SIGTERM) };

        std::thread::sleep(GRACE_PERIOD);

        let mut status = 0;
        // SAFETY: status is a valid out-parameter; WNOHANG is standard.
        let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

        if reaped == 0 {
            // SAFETY: same group, SIGKILL cannot be caught or ignored.
            unsafe { libc::killpg(pid, libc::SIGKILL) };
            // SAFETY: status is valid; blocking wait, group leader is
            // guaranteed to die from SIGKILL.
            unsafe { libc::waitpid(pid, &mut status, 0) };
        }

        unblock_sigchld();
        Ok(())
    }
}

#[repr(C)]
struct RawChildExit {
    pid: Pid,
    status: i32,
}

extern "C" fn sigchld_handler(_signum: libc::c_int) {
    loop {
        let mut status = 0;
        // SAFETY: async-signal-safe: waitpid and write are both
        // permitted inside a signal handler; no allocation occurs.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        let exit = RawChildExit { pid, status };
        let write_fd = SELF_PIPE_WRITE.load(Ordering::SeqCst);
        if write_fd >= 0 {
            // SAFETY: exit is a plain-old-data value on the stack; the
            // write is best-effort, failures (e.g. a full pipe) are
            // deliberately ignored.
            unsafe {
                libc::write(
                    write_fd,
                    &exit as *const RawChildExit as *const libc::c_void,
                    std::mem::size_of::<RawChildExit>(),
                );
            }
        }
    }
}

fn install_sigchld_handler() -> Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = sigchld_handler as usize;
    action.sa_flags = libc::SA_RESTART;
    // SAFETY: action is fully initialized; SIGCHLD is a valid signal.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    // SAFETY: action is a fully initialized sigaction.
    if unsafe { libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn block_sigchld() {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: set is a valid, zeroed sigset_t.
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

fn unblock_sigchld() {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: set is a valid, zeroed sigset_t.
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fd is a valid, just-created pipe end.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: flags came from a successful F_GETFL on this fd.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: fd is valid; F_SETFD/FD_CLOEXEC are standard arguments.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_spawns_helper_with_expected_argv() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("helper.sh");
        std::fs::write(&helper, "#!/bin/sh\necho \"$1 $2\" > \"$0.out\"\n").unwrap();
        let mut perms = std::fs::metadata(&helper).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&helper, perms).unwrap();

        let mut supervisor = Supervisor::new(&helper).unwrap();
        let pid = supervisor.launch("eth0", Action::Probe).unwrap();
        assert!(pid > 0);

        let mut status = 0;
        // SAFETY: pid is a child we just spawned; a blocking wait is fine in a test.
        unsafe {
            libc::waitpid(pid, &mut status, 0);
        }

        let out = std::fs::read_to_string(format!("{}.out", helper.display())).unwrap();
        assert_eq!(out.trim(), "eth0 probe");
    }
}
