// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ground-truth flag reads for the re-poll anti-entropy pass
//! (`SIOCGIFFLAGS`), independent of whatever the kernel link channel
//! last reported.

use std::os::unix::io::RawFd;

const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
}

/// Read the live administrative/carrier flags for `name` via a
/// throwaway `AF_INET`/`SOCK_DGRAM` socket, the same family `ioctl`
/// uses regardless of the interface's actual address family.
pub fn read_flags(name: &str) -> std::io::Result<u32> {
    if name.len() >= IFNAMSIZ {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }

    // SAFETY: AF_INET/SOCK_DGRAM/0 are valid static arguments.
    let fd: RawFd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut req: IfReqFlags = unsafe { std::mem::zeroed() };
    for (i, b) in name.bytes().enumerate() {
        req.ifr_name[i] = b as libc::c_char;
    }

    // SAFETY: fd is a valid socket; req is a fully initialized ifreq-shaped
    // struct matching the kernel's layout for SIOCGIFFLAGS.
    let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut req) };
    let err = std::io::Error::last_os_error();
    // SAFETY: fd is owned solely by this function.
    unsafe { libc::close(fd) };

    if ret < 0 {
        return Err(err);
    }

    Ok(req.ifr_flags as u16 as u32)
}
