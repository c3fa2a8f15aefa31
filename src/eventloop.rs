// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The event loop (component C6): multiplexes the kernel link channel
//! and the child-exit self-pipe, runs anti-entropy re-poll before each
//! wait, and drives the state machine from both input sources.

use crate::error::Result;
use crate::iface::InterfaceTable;
use crate::netlink::socket::{ListenOutcome, NetlinkSocket};
use crate::patterns::PatternSet;
use crate::state::{apply_flag_change, apply_repoll, apply_script_done, find_draining};
use crate::supervisor::Supervisor;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::time::Duration;

const NETLINK_TOKEN: Token = Token(0);
const SELF_PIPE_TOKEN: Token = Token(1);
const MAX_EVENTS: usize = 16;
const SPURIOUS_WAKE_BACKOFF: Duration = Duration::from_millis(50);

pub struct Daemon {
    netlink: NetlinkSocket,
    supervisor: Supervisor,
    table: InterfaceTable,
    patterns: PatternSet,
    poll: Poll,
}

impl Daemon {
    pub fn new(
        netlink: NetlinkSocket,
        supervisor: Supervisor,
        table: InterfaceTable,
        patterns: PatternSet,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&netlink.as_raw_fd()),
            NETLINK_TOKEN,
            Interest::READABLE,
        )?;
        poll.registry().register(
            &mut SourceFd(&supervisor.self_pipe_fd()),
            SELF_PIPE_TOKEN,
            Interest::READABLE,
        )?;

        Ok(Self {
            netlink,
            supervisor,
            table,
            patterns,
            poll,
        })
    }

    /// Run until the kernel channel signals clean shutdown (`Ok(())`)
    /// or a shutdown signal / fatal error ends it (`Err`).
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);

        loop {
            if crate::signals::shutdown_requested() {
                return Err(crate::error::DaemonError::Shutdown);
            }

            self.repoll()?;

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if events.is_empty() {
                std::thread::sleep(SPURIOUS_WAKE_BACKOFF);
                continue;
            }

            let mut netlink_ready = false;
            let mut self_pipe_ready = false;
            for event in events.iter() {
                match event.token() {
                    NETLINK_TOKEN => netlink_ready = true,
                    SELF_PIPE_TOKEN => self_pipe_ready = true,
                    _ => {}
                }
            }

            if netlink_ready {
                match self.netlink.listen_once()? {
                    ListenOutcome::Eof => return Ok(()),
                    ListenOutcome::Events(records) => {
                        for rec in records {
                            self.apply_link_record(rec)?;
                        }
                    }
                }
            }

            if self_pipe_ready {
                for exit in self.supervisor.drain_exits()? {
                    self.apply_child_exit(exit)?;
                }
            }
        }
    }

    fn apply_link_record(&mut self, rec: crate::netlink::socket::LinkRecord) -> Result<()> {
        if !self.patterns.matches(&rec.name) {
            return Ok(());
        }

        let (record, _old_flags) =
            self.table
                .observe(rec.index, &rec.name, rec.hw_type, rec.flags, &rec.hw_addr);
        let new_flags = rec.flags;
        apply_flag_change(record, new_flags, &mut self.supervisor, now())
    }

    fn apply_child_exit(&mut self, exit: crate::supervisor::ChildExit) -> Result<()> {
        let success = libc_wifexited_success(exit.status);
        match find_draining(self.table.values_mut(), exit.pid) {
            Some(record) => apply_script_done(record, success, &mut self.supervisor),
            None => {
                log::info!("reaped unknown pid {} (status {})", exit.pid, exit.status);
                Ok(())
            }
        }
    }

    /// Re-read each record's live kernel flags via `ioctl` and feed any
    /// divergence from our stored copy through rule 1. An interface that
    /// has vanished since the last dump is skipped, not fatal — it'll
    /// resurface as a `DELLINK`/`NEWLINK` pair if it comes back.
    fn repoll(&mut self) -> Result<()> {
        let now = now();
        let supervisor = &mut self.supervisor;
        let mut first_error = None;
        self.table.for_each(|record| {
            let live_flags = match crate::ioctl::read_flags(&record.name) {
                Ok(flags) => flags,
                Err(e) => {
                    log::debug!("repoll: could not read flags for {}: {e}", record.name);
                    return false;
                }
            };
            if let Err(e) = apply_repoll(record, live_flags, &mut *supervisor, now) {
                first_error = Some(e);
                return true;
            }
            false
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn libc_wifexited_success(status: i32) -> bool {
    libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
}
