// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The kernel link-notification transport (component C1).
//!
//! Opens a `NETLINK_ROUTE` socket bound to `RTMGRP_LINK`, requests an
//! initial dump of every link, and thereafter decodes asynchronous
//! `NEWLINK`/`DELLINK` notifications. Parsing follows spec.md §4.1: a
//! truncated datagram, an overrunning declared length, or an
//! unexpected sender address size is fatal; `EINTR` is retried; a
//! non-kernel sender is dropped.

use super::consts::*;
use crate::error::{DaemonError, Result};
use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// A decoded `NEWLINK`/`DELLINK` record, attributes already extracted.
#[derive(Clone, Debug)]
pub struct LinkRecord {
    pub index: u32,
    pub deleted: bool,
    pub hw_type: u16,
    pub flags: u32,
    pub name: String,
    pub hw_addr: Vec<u8>,
}

/// Outcome of one `listen_once` call.
pub enum ListenOutcome {
    /// Zero or more link records decoded from the datagram(s) read.
    Events(Vec<LinkRecord>),
    /// The kernel socket hit EOF — the daemon's clean-shutdown signal.
    Eof,
}

pub struct NetlinkSocket {
    fd: RawFd,
    seq: u32,
}

impl NetlinkSocket {
    /// Open, bind to `RTMGRP_LINK`, and sanity-check the kernel's
    /// returned address. The socket starts in blocking mode; callers
    /// switch it to non-blocking after the initial dump.
    pub fn open() -> Result<Self> {
        // SAFETY: AF_NETLINK/SOCK_RAW/NETLINK_ROUTE are valid, static
        // arguments; socket(2) either returns a valid owned fd or -1.
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_ROUTE) };
        if fd < 0 {
            return Err(DaemonError::Socket(format!(
                "could not create netlink socket: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: fd is a valid, just-created socket; F_SETFD/FD_CLOEXEC
        // are standard fcntl arguments.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(DaemonError::Socket(format!("close-on-exec: {err}")));
        }

        let mut addr = SockAddrNl {
            nl_family: libc::AF_NETLINK as u16,
            nl_pad: 0,
            nl_pid: 0,
            nl_groups: RTMGRP_LINK,
        };

        // SAFETY: fd is our netlink socket; addr is a fully initialized
        // stack value of the size passed.
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const SockAddrNl as *const libc::sockaddr,
                SOCKADDR_NL_LEN as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(DaemonError::Socket(format!("bind: {err}")));
        }

        let mut addr_len = SOCKADDR_NL_LEN as libc::socklen_t;
        // SAFETY: fd is bound; addr/addr_len are valid out-parameters
        // sized for SockAddrNl.
        let ret = unsafe {
            libc::getsockname(
                fd,
                &mut addr as *mut SockAddrNl as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(DaemonError::Socket(format!("getsockname: {err}")));
        }

        if addr_len as usize != SOCKADDR_NL_LEN {
            unsafe { libc::close(fd) };
            return Err(DaemonError::Socket(
                "kernel's netlink address size does not match ours".into(),
            ));
        }
        if addr.nl_family != libc::AF_NETLINK as u16 {
            unsafe { libc::close(fd) };
            return Err(DaemonError::Socket(
                "kernel returned an unexpected address family".into(),
            ));
        }

        Ok(Self { fd, seq: 0 })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Switch the socket to non-blocking mode for the event loop.
    pub fn set_nonblocking(&self) -> Result<()> {
        // SAFETY: fd is our open socket; F_GETFL/F_SETFL are standard.
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: flags came from a successful F_GETFL on this fd.
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Send one `RTM_GETLINK` dump request. The kernel pid (0) and our
    /// own address aren't needed for sendto on a bound netlink socket.
    pub fn request_dump(&mut self) -> Result<()> {
        self.seq += 1;

        #[repr(C)]
        struct DumpRequest {
            hdr: NlMsgHdr,
            msg: RtGenMsg,
        }

        let req = DumpRequest {
            hdr: NlMsgHdr {
                nlmsg_len: std::mem::size_of::<DumpRequest>() as u32,
                nlmsg_type: RTM_GETLINK,
                nlmsg_flags: NLM_F_ROOT | NLM_F_MATCH | NLM_F_REQUEST,
                nlmsg_seq: self.seq,
                nlmsg_pid: 0,
            },
            msg: RtGenMsg { rtgen_family: 0 },
        };

        let dest = SockAddrNl {
            nl_family: libc::AF_NETLINK as u16,
            nl_pad: 0,
            nl_pid: 0,
            nl_groups: 0,
        };

        // SAFETY: req and dest are fully initialized stack values; fd is
        // our open, bound netlink socket.
        let ret = unsafe {
            libc::sendto(
                self.fd,
                &req as *const DumpRequest as *const libc::c_void,
                std::mem::size_of::<DumpRequest>(),
                0,
                &dest as *const SockAddrNl as *const libc::sockaddr,
                SOCKADDR_NL_LEN as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(DaemonError::Socket(format!(
                "could not request interface dump: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Drain the dump reply until `NLMSG_DONE`. Blocking — this runs
    /// once at startup before the socket is switched non-blocking.
    pub fn receive_dump(&self) -> Result<Vec<LinkRecord>> {
        let mut records = Vec::new();

        loop {
            let datagram = self.recv_datagram()?;
            let datagram = match datagram {
                Some(d) => d,
                None => continue,
            };

            for msg in iter_messages(&datagram.buf[..datagram.len])? {
                if msg.hdr.nlmsg_seq != self.seq {
                    continue;
                }
                if msg.hdr.nlmsg_type == NLMSG_DONE {
                    return Ok(records);
                }
                if msg.hdr.nlmsg_type == NLMSG_ERROR {
                    let err = read_nlmsgerr(msg.payload)?;
                    if err.error != 0 {
                        return Err(DaemonError::KernelReply(format!(
                            "rtnetlink dump failed: errno {}",
                            -err.error
                        )));
                    }
                    continue;
                }
                if msg.hdr.nlmsg_type == RTM_NEWLINK {
                    if let Some(rec) = parse_link_record(msg.payload, false)? {
                        records.push(rec);
                    }
                }
            }
        }
    }

    /// Consume one readiness event's worth of asynchronous
    /// notifications. Called only when the socket is known readable;
    /// `WouldBlock` (a spurious wakeup) yields an empty event list.
    pub fn listen_once(&self) -> Result<ListenOutcome> {
        let datagram = match self.recv_datagram()? {
            Some(d) => d,
            None => return Ok(ListenOutcome::Events(Vec::new())),
        };

        if datagram.len == 0 {
            return Ok(ListenOutcome::Eof);
        }
        if datagram.sender_pid != 0 {
            log::info!("netlink packet from pid {}, not the kernel — dropped", datagram.sender_pid);
            return Ok(ListenOutcome::Events(Vec::new()));
        }

        let mut records = Vec::new();
        for msg in iter_messages(&datagram.buf[..datagram.len])? {
            match msg.hdr.nlmsg_type {
                RTM_NEWLINK => {
                    if let Some(rec) = parse_link_record(msg.payload, false)? {
                        records.push(rec);
                    }
                }
                RTM_DELLINK => {
                    if let Some(rec) = parse_link_record(msg.payload, true)? {
                        records.push(rec);
                    }
                }
                _ => {}
            }
        }

        Ok(ListenOutcome::Events(records))
    }

    /// Receive one datagram, retrying on `EINTR` and logging-then-
    /// retrying on transient overrun. `EAGAIN` yields `None`: the dump
    /// path runs while the socket is still in its default blocking mode
    /// so it shouldn't actually see this, but `listen_once` (called only
    /// after `set_nonblocking`) relies on it for a spurious readiness
    /// wakeup.
    fn recv_datagram(&self) -> Result<Option<RawDatagram>> {
        loop {
            let mut buf = [0u8; 8192];
            let mut sender = SockAddrNl {
                nl_family: 0,
                nl_pad: 0,
                nl_pid: 0,
                nl_groups: 0,
            };
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_name = &mut sender as *mut SockAddrNl as *mut libc::c_void;
            msg.msg_namelen = SOCKADDR_NL_LEN as u32;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;

            // SAFETY: buf/sender/iov/msg are all valid, correctly sized
            // stack values that outlive the call; fd is our open socket.
            let n = unsafe { libc::recvmsg(self.fd, &mut msg, 0) };

            if n < 0 {
                let err = std::io::Error::last_os_error();
                match err.kind() {
                    std::io::ErrorKind::Interrupted => continue,
                    std::io::ErrorKind::WouldBlock => return Ok(None),
                    _ => {
                        log::error!("netlink overrun: {err}");
                        continue;
                    }
                }
            }

            if msg.msg_namelen as usize != SOCKADDR_NL_LEN {
                return Err(DaemonError::MalformedFrame(format!(
                    "sender address length {} (expected {})",
                    msg.msg_namelen, SOCKADDR_NL_LEN
                )));
            }

            if msg.msg_flags & libc::MSG_TRUNC != 0 {
                return Err(DaemonError::MalformedFrame("truncated datagram".into()));
            }

            return Ok(Some(RawDatagram {
                buf,
                len: n as usize,
                sender_pid: sender.nl_pid,
            }));
        }
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this struct and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

struct RawDatagram {
    buf: [u8; 8192],
    len: usize,
    sender_pid: u32,
}

struct ParsedMessage<'a> {
    hdr: NlMsgHdr,
    payload: &'a [u8],
}

/// Walk the length-tagged messages in one datagram. A declared length
/// that overruns the buffer is fatal per spec.md §4.1.
fn iter_messages(data: &[u8]) -> Result<Vec<ParsedMessage<'_>>> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset + NLMSGHDR_LEN <= data.len() {
        // SAFETY: bounds-checked above; NlMsgHdr is repr(C) and matches
        // the kernel's nlmsghdr layout; alignment is handled via
        // read_unaligned.
        let hdr: NlMsgHdr = unsafe { std::ptr::read_unaligned(data[offset..].as_ptr() as *const NlMsgHdr) };

        let declared_len = hdr.nlmsg_len as usize;
        if declared_len < NLMSGHDR_LEN {
            return Err(DaemonError::MalformedFrame(format!(
                "message length {declared_len} shorter than header"
            )));
        }
        let msg_end = offset + declared_len;
        if msg_end > data.len() {
            return Err(DaemonError::MalformedFrame(format!(
                "message length {declared_len} overruns datagram"
            )));
        }

        out.push(ParsedMessage {
            hdr,
            payload: &data[offset + NLMSGHDR_LEN..msg_end],
        });

        offset += nlmsg_align(declared_len);
    }

    Ok(out)
}

fn read_nlmsgerr(payload: &[u8]) -> Result<NlMsgErr> {
    if payload.len() < std::mem::size_of::<NlMsgErr>() {
        return Err(DaemonError::MalformedFrame("truncated NLMSG_ERROR".into()));
    }
    // SAFETY: bounds-checked above.
    Ok(unsafe { std::ptr::read_unaligned(payload.as_ptr() as *const NlMsgErr) })
}

/// Decode one `RTM_NEWLINK`/`RTM_DELLINK` payload into a `LinkRecord`.
/// Returns `None` for records we deliberately drop (loopback, missing
/// name) rather than malformed ones (which are `Err`).
fn parse_link_record(payload: &[u8], deleted: bool) -> Result<Option<LinkRecord>> {
    if payload.len() < IFINFOMSG_LEN {
        return Err(DaemonError::MalformedFrame("short ifinfomsg".into()));
    }
    // SAFETY: bounds-checked above; IfInfoMsg mirrors the kernel layout.
    let info: IfInfoMsg = unsafe { std::ptr::read_unaligned(payload.as_ptr() as *const IfInfoMsg) };

    if info.ifi_flags & IFF_LOOPBACK != 0 {
        return Ok(None);
    }

    let attrs = parse_rtattrs(&payload[IFINFOMSG_LEN..])?;

    let name = match attrs.get(&IFLA_IFNAME) {
        Some(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => s.trim_end_matches('\0').to_string(),
            Err(_) => {
                log::error!("interface name is not valid UTF-8 — dropped");
                return Ok(None);
            }
        },
        None => {
            log::error!("link record with no interface name — dropped");
            return Ok(None);
        }
    };

    let hw_addr = attrs.get(&IFLA_ADDRESS).cloned().unwrap_or_default();

    Ok(Some(LinkRecord {
        index: info.ifi_index as u32,
        deleted,
        hw_type: info.ifi_type,
        flags: info.ifi_flags,
        name,
        hw_addr,
    }))
}

/// Parse a generic `rtattr` table keyed by attribute id.
fn parse_rtattrs(mut data: &[u8]) -> Result<HashMap<u16, Vec<u8>>> {
    let mut attrs = HashMap::new();

    while data.len() >= RTATTR_LEN {
        // SAFETY: bounds-checked above; RtAttr mirrors the kernel layout.
        let attr: RtAttr = unsafe { std::ptr::read_unaligned(data.as_ptr() as *const RtAttr) };
        let rta_len = attr.rta_len as usize;
        if rta_len < RTATTR_LEN || rta_len > data.len() {
            return Err(DaemonError::MalformedFrame(format!(
                "rtattr length {rta_len} out of range"
            )));
        }

        let value = data[RTATTR_LEN..rta_len].to_vec();
        attrs.insert(attr.rta_type, value);

        let advance = nlmsg_align(rta_len);
        if advance > data.len() {
            break;
        }
        data = &data[advance..];
    }

    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_attr(buf: &mut Vec<u8>, rta_type: u16, value: &[u8]) {
        let rta_len = RTATTR_LEN + value.len();
        buf.extend_from_slice(&(rta_len as u16).to_ne_bytes());
        buf.extend_from_slice(&rta_type.to_ne_bytes());
        buf.extend_from_slice(value);
        let padded = nlmsg_align(rta_len);
        buf.resize(buf.len() + (padded - rta_len), 0);
    }

    fn sample_ifinfomsg(flags: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(0); // ifi_family
        buf.push(0); // pad
        buf.extend_from_slice(&1u16.to_ne_bytes()); // ifi_type (ARPHRD_ETHER-ish)
        buf.extend_from_slice(&2i32.to_ne_bytes()); // ifi_index
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // ifi_change
        push_attr(&mut buf, IFLA_IFNAME, b"eth0\0");
        push_attr(&mut buf, IFLA_ADDRESS, &[0xde, 0xad, 0xbe, 0xef, 0, 0]);
        buf
    }

    #[test]
    fn parses_newlink_record() {
        let payload = sample_ifinfomsg(IFF_UP | IFF_RUNNING);
        let rec = parse_link_record(&payload, false).unwrap().unwrap();
        assert_eq!(rec.index, 2);
        assert_eq!(rec.name, "eth0");
        assert_eq!(rec.flags, IFF_UP | IFF_RUNNING);
        assert_eq!(rec.hw_addr, vec![0xde, 0xad, 0xbe, 0xef, 0, 0]);
        assert!(!rec.deleted);
    }

    #[test]
    fn drops_loopback_record() {
        let payload = sample_ifinfomsg(IFF_UP | IFF_LOOPBACK);
        assert!(parse_link_record(&payload, false).unwrap().is_none());
    }

    #[test]
    fn missing_ifname_is_dropped_not_fatal() {
        let mut buf = Vec::new();
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&1u16.to_ne_bytes());
        buf.extend_from_slice(&2i32.to_ne_bytes());
        buf.extend_from_slice(&(IFF_UP).to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        assert!(parse_link_record(&buf, false).unwrap().is_none());
    }

    #[test]
    fn overrunning_rtattr_is_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&40u16.to_ne_bytes()); // rta_len far past buffer
        buf.extend_from_slice(&IFLA_IFNAME.to_ne_bytes());
        assert!(parse_rtattrs(&buf).is_err());
    }

    #[test]
    fn iter_messages_rejects_overrunning_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u32.to_ne_bytes()); // nlmsg_len, way too big
        buf.extend_from_slice(&RTM_NEWLINK.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        assert!(iter_messages(&buf).is_err());
    }
}
