// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command-line entry point: argument parsing, startup sequencing
//! (autoprobe, kernel dump, daemonization, pid file), then handing off
//! to the event loop.

use clap::Parser;
use linkplugd::error::DaemonError;
use linkplugd::eventloop::Daemon;
use linkplugd::iface::InterfaceTable;
use linkplugd::netlink::NetlinkSocket;
use linkplugd::patterns::{read_config_file, PatternSet};
use linkplugd::signals::{self, PidFile};
use linkplugd::state::apply_flagpoll;
use linkplugd::supervisor::Supervisor;
use linkplugd::{logging, probe};

const DEFAULT_CONFIG_PATH: &str = "/etc/linkplugd.conf";
const DEFAULT_HELPER_PATH: &str = "/usr/lib/linkplugd/linkplugd-helper";

/// Link-state daemon: watches interface carrier/admin-state transitions
/// and runs a helper script on each one.
#[derive(Parser, Debug)]
#[command(name = "linkplugd", version)]
struct Cli {
    /// Run in the foreground, logging to stdout/stderr instead of syslog.
    #[arg(short = 'F')]
    foreground: bool,

    /// Skip the startup autoprobe pass.
    #[arg(short = 'P')]
    no_autoprobe: bool,

    /// Enable debug-level logging.
    #[arg(short = 'D')]
    debug: bool,

    /// Read patterns from this file instead of the default config path.
    /// `-` reads from stdin.
    #[arg(short = 'c')]
    config: Option<String>,

    /// Append a pattern from the command line (repeatable).
    #[arg(short = 'i')]
    inline_pattern: Vec<String>,

    /// Write the daemon pid here; removed on exit.
    #[arg(short = 'p')]
    pid_file: Option<String>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    if let Err(e) = logging::init(cli.foreground, cli.debug) {
        eprintln!("could not start logging: {e}");
        return 1;
    }

    // SAFETY: getuid() takes no arguments and cannot fail.
    if unsafe { libc::getuid() } != 0 {
        log::warn!("not running as root; helper execs may fail to configure interfaces");
    }

    let mut patterns = PatternSet::new();
    if let Err(e) = load_patterns(&cli, &mut patterns) {
        eprintln!("{e}");
        return 1;
    }

    if !cli.no_autoprobe {
        probe::run(&patterns, std::path::Path::new(DEFAULT_HELPER_PATH));
    }

    if let Err(e) = signals::install() {
        log::error!("could not install signal handlers: {e}");
        return 1;
    }

    // The supervisor (self-pipe + SIGCHLD handler) has to exist before we
    // process the initial dump below, since a cold-start interface that's
    // already up with carrier launches a real helper right there.
    let mut supervisor = match Supervisor::new(DEFAULT_HELPER_PATH) {
        Ok(s) => s,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };

    let mut netlink = match NetlinkSocket::open() {
        Ok(s) => s,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };
    if let Err(e) = netlink.request_dump() {
        log::error!("{e}");
        return 1;
    }
    let dumped = match netlink.receive_dump() {
        Ok(records) => records,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };

    let mut table = InterfaceTable::new();
    for rec in dumped {
        if !patterns.matches(&rec.name) {
            continue;
        }
        table.observe(rec.index, &rec.name, rec.hw_type, rec.flags, &rec.hw_addr);
    }

    // The dump hands us each interface's current flags directly (there's
    // no prior value to diff against), so rule 1 has nothing to react
    // to. Settle every freshly observed record against its absolute
    // flags once, up front, the way the original does right after its
    // own dump and before entering its main loop.
    let mut settle_err = None;
    table.for_each(|record| {
        if let Err(e) = apply_flagpoll(record, &mut supervisor) {
            settle_err = Some(e);
            return true;
        }
        false
    });
    if let Some(e) = settle_err {
        log::error!("{e}");
        return 1;
    }

    if let Err(e) = netlink.set_nonblocking() {
        log::error!("{e}");
        return 1;
    }

    if !cli.foreground {
        // SAFETY: daemon(3) with nochdir=0, noclose=0. Fds and signal
        // dispositions (the self-pipe, the SIGCHLD/shutdown handlers)
        // survive the fork this performs.
        if unsafe { libc::daemon(0, 0) } != 0 {
            log::error!("daemon(): {}", std::io::Error::last_os_error());
            return 1;
        }
    }

    let pid_guard = match &cli.pid_file {
        Some(path) => match PidFile::write(path) {
            Ok(guard) => guard,
            Err(e) => {
                log::error!("could not write pid file {path}: {e}");
                return 1;
            }
        },
        None => PidFile::none(),
    };

    let mut daemon = match Daemon::new(netlink, supervisor, table, patterns) {
        Ok(d) => d,
        Err(e) => {
            log::error!("{e}");
            drop(pid_guard);
            return 1;
        }
    };

    let code = match daemon.run() {
        Ok(()) => 0,
        Err(DaemonError::Shutdown) => {
            log::error!("shutdown signal received");
            1
        }
        Err(e) => {
            log::error!("{e}");
            1
        }
    };

    drop(pid_guard);
    code
}

fn load_patterns(cli: &Cli, patterns: &mut PatternSet) -> Result<(), String> {
    match &cli.config {
        Some(path) => read_config_file(patterns, path).map_err(|e| e.to_string())?,
        None => match read_config_file(patterns, DEFAULT_CONFIG_PATH) {
            Ok(()) => {}
            Err(DaemonError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no config file at {DEFAULT_CONFIG_PATH}, using -i patterns only");
            }
            Err(e) => return Err(e.to_string()),
        },
    }

    for pat in &cli.inline_pattern {
        patterns.push(pat).map_err(|e| e.to_string())?;
    }

    Ok(())
}
