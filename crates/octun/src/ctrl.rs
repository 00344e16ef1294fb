// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control socket to the supervising process.
//!
//! The worker and its parent exchange small length-prefixed, versioned
//! binary messages over a `SOCK_SEQPACKET` socketpair; the UDP tunnel
//! socket travels as `SCM_RIGHTS` ancillary data. Message boundaries are
//! packet boundaries, the length prefix guards against truncation.
//!
//! # Wire Format
//!
//! ```text
//! +----------------+---------+------+---------+
//! | Length (2B BE) | Version | Kind | Payload |
//! +----------------+---------+------+---------+
//! ```
//!
//! Length covers version, kind and payload. Strings are encoded as a
//! 2-byte big-endian length followed by UTF-8 bytes.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::config::{COOKIE_SIZE, MASTER_SECRET_SIZE, SESSION_ID_SIZE, SID_SIZE};

/// Protocol version of the control channel.
pub const CTRL_VERSION: u8 = 1;

/// Upper bound on one control message.
pub const MAX_CTRL_MSG: usize = 1024;

// Message kind bytes.
const KIND_TUN_MTU: u8 = 1;
const KIND_SESSION_INFO: u8 = 2;
const KIND_COOKIE_VERIFY: u8 = 3;
const KIND_COOKIE_REPLY: u8 = 4;
const KIND_UDP_FD: u8 = 5;
const KIND_RESUME_QUERY: u8 = 6;
const KIND_RESUME_REPLY: u8 = 7;

/// Messages the worker reports to the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMsg {
    /// Plaintext tunnel MTU (already excludes the frame type byte).
    TunMtu { mtu: u16 },
    /// Negotiated session facts for accounting.
    SessionInfo {
        tls_ciphersuite: Option<String>,
        dtls_ciphersuite: Option<String>,
        user_agent: Option<String>,
    },
    /// Ask the parent to validate a session cookie.
    CookieVerify {
        cookie: [u8; COOKIE_SIZE],
        sid: [u8; SID_SIZE],
    },
    /// Ask whether a datagram session can be resumed.
    ResumeQuery {
        session_id: [u8; SESSION_ID_SIZE],
    },
}

/// Commands the parent sends to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainCmd {
    /// Cookie verification verdict.
    CookieReply { ok: bool },
    /// The bound-and-connected UDP socket arrives in ancillary data.
    UdpFd,
    /// Resume lookup result; the master secret of the stored session
    /// rides along when found.
    ResumeReply {
        master_secret: Option<[u8; MASTER_SECRET_SIZE]>,
    },
}

fn put_str(out: &mut Vec<u8>, s: Option<&str>) {
    let bytes = s.map(str::as_bytes).unwrap_or(&[]);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn get_str(buf: &[u8], pos: &mut usize) -> io::Result<Option<String>> {
    if buf.len() < *pos + 2 {
        return Err(bad_msg("truncated string length"));
    }
    let len = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]) as usize;
    *pos += 2;
    if buf.len() < *pos + len {
        return Err(bad_msg("truncated string body"));
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| bad_msg("string not UTF-8"))?;
    *pos += len;
    Ok(if s.is_empty() { None } else { Some(s.to_string()) })
}

fn bad_msg(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("control message: {}", what))
}

/// Encode a worker-to-parent message, including the length prefix.
pub fn encode_worker_msg(msg: &WorkerMsg) -> Vec<u8> {
    let mut body = vec![CTRL_VERSION];
    match msg {
        WorkerMsg::TunMtu { mtu } => {
            body.push(KIND_TUN_MTU);
            body.extend_from_slice(&mtu.to_be_bytes());
        }
        WorkerMsg::SessionInfo {
            tls_ciphersuite,
            dtls_ciphersuite,
            user_agent,
        } => {
            body.push(KIND_SESSION_INFO);
            put_str(&mut body, tls_ciphersuite.as_deref());
            put_str(&mut body, dtls_ciphersuite.as_deref());
            put_str(&mut body, user_agent.as_deref());
        }
        WorkerMsg::CookieVerify { cookie, sid } => {
            body.push(KIND_COOKIE_VERIFY);
            body.extend_from_slice(cookie);
            body.extend_from_slice(sid);
        }
        WorkerMsg::ResumeQuery { session_id } => {
            body.push(KIND_RESUME_QUERY);
            body.extend_from_slice(session_id);
        }
    }
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Encode a parent-to-worker command, including the length prefix.
pub fn encode_main_cmd(cmd: &MainCmd) -> Vec<u8> {
    let mut body = vec![CTRL_VERSION];
    match cmd {
        MainCmd::CookieReply { ok } => {
            body.push(KIND_COOKIE_REPLY);
            body.push(u8::from(*ok));
        }
        MainCmd::UdpFd => body.push(KIND_UDP_FD),
        MainCmd::ResumeReply { master_secret } => {
            body.push(KIND_RESUME_REPLY);
            match master_secret {
                Some(secret) => {
                    body.push(1);
                    body.extend_from_slice(secret);
                }
                None => body.push(0),
            }
        }
    }
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

fn check_envelope(buf: &[u8]) -> io::Result<&[u8]> {
    if buf.len() < 4 {
        return Err(bad_msg("short envelope"));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() != 2 + len {
        return Err(bad_msg("length prefix mismatch"));
    }
    if buf[2] != CTRL_VERSION {
        return Err(bad_msg("unsupported version"));
    }
    Ok(&buf[3..])
}

/// Decode a parent-to-worker command.
pub fn decode_main_cmd(buf: &[u8]) -> io::Result<MainCmd> {
    let body = check_envelope(buf)?;
    let (kind, payload) = body.split_first().ok_or_else(|| bad_msg("missing kind"))?;
    match *kind {
        KIND_COOKIE_REPLY => {
            let ok = *payload.first().ok_or_else(|| bad_msg("missing verdict"))?;
            Ok(MainCmd::CookieReply { ok: ok != 0 })
        }
        KIND_UDP_FD => Ok(MainCmd::UdpFd),
        KIND_RESUME_REPLY => match payload.split_first() {
            Some((0, _)) => Ok(MainCmd::ResumeReply {
                master_secret: None,
            }),
            Some((1, rest)) if rest.len() == MASTER_SECRET_SIZE => {
                let mut secret = [0u8; MASTER_SECRET_SIZE];
                secret.copy_from_slice(rest);
                Ok(MainCmd::ResumeReply {
                    master_secret: Some(secret),
                })
            }
            _ => Err(bad_msg("malformed resume reply")),
        },
        _ => Err(bad_msg("unknown command kind")),
    }
}

/// Decode a worker-to-parent message (parent side of the contract; also
/// exercised by the tests).
pub fn decode_worker_msg(buf: &[u8]) -> io::Result<WorkerMsg> {
    let body = check_envelope(buf)?;
    let (kind, payload) = body.split_first().ok_or_else(|| bad_msg("missing kind"))?;
    match *kind {
        KIND_TUN_MTU => {
            if payload.len() != 2 {
                return Err(bad_msg("malformed MTU report"));
            }
            Ok(WorkerMsg::TunMtu {
                mtu: u16::from_be_bytes([payload[0], payload[1]]),
            })
        }
        KIND_SESSION_INFO => {
            let mut pos = 0;
            let tls_ciphersuite = get_str(payload, &mut pos)?;
            let dtls_ciphersuite = get_str(payload, &mut pos)?;
            let user_agent = get_str(payload, &mut pos)?;
            Ok(WorkerMsg::SessionInfo {
                tls_ciphersuite,
                dtls_ciphersuite,
                user_agent,
            })
        }
        KIND_COOKIE_VERIFY => {
            if payload.len() != COOKIE_SIZE + SID_SIZE {
                return Err(bad_msg("malformed cookie verify"));
            }
            let mut cookie = [0u8; COOKIE_SIZE];
            cookie.copy_from_slice(&payload[..COOKIE_SIZE]);
            let mut sid = [0u8; SID_SIZE];
            sid.copy_from_slice(&payload[COOKIE_SIZE..]);
            Ok(WorkerMsg::CookieVerify { cookie, sid })
        }
        KIND_RESUME_QUERY => {
            if payload.len() != SESSION_ID_SIZE {
                return Err(bad_msg("malformed resume query"));
            }
            let mut session_id = [0u8; SESSION_ID_SIZE];
            session_id.copy_from_slice(payload);
            Ok(WorkerMsg::ResumeQuery { session_id })
        }
        _ => Err(bad_msg("unknown message kind")),
    }
}

// ============================================================================
// Socket plumbing
// ============================================================================

/// One end of the control socketpair.
pub struct ControlChannel {
    fd: OwnedFd,
}

impl ControlChannel {
    /// Wrap the control fd handed over by the parent.
    ///
    /// # Safety
    /// `fd` must be a valid, owned `SOCK_SEQPACKET` socket descriptor.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Create a connected control socketpair (parent side of the
    /// contract; also used by tests and harnesses).
    pub fn pair() -> io::Result<(ControlChannel, ControlChannel)> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            Ok((
                ControlChannel::from_raw_fd(fds[0]),
                ControlChannel::from_raw_fd(fds[1]),
            ))
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Report a message to the parent.
    pub fn send(&self, msg: &WorkerMsg) -> io::Result<()> {
        self.send_raw(&encode_worker_msg(msg), None)
    }

    /// Send a command (parent side; used by tests and harnesses). The
    /// optional fd travels as `SCM_RIGHTS`.
    pub fn send_cmd(&self, cmd: &MainCmd, fd: Option<RawFd>) -> io::Result<()> {
        self.send_raw(&encode_main_cmd(cmd), fd)
    }

    /// Block until the parent answers; used during session setup only.
    pub fn recv_blocking(&self) -> io::Result<(MainCmd, Option<OwnedFd>)> {
        let mut buf = [0u8; MAX_CTRL_MSG];
        let (n, fd) = recvmsg_fd(self.fd.as_raw_fd(), &mut buf, 0)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control socket closed",
            ));
        }
        Ok((decode_main_cmd(&buf[..n])?, fd))
    }

    /// Non-blocking receive for the tunnel loop. `Ok(None)` means no
    /// command is queued.
    pub fn try_recv(&self) -> io::Result<Option<(MainCmd, Option<OwnedFd>)>> {
        let mut buf = [0u8; MAX_CTRL_MSG];
        match recvmsg_fd(self.fd.as_raw_fd(), &mut buf, libc::MSG_DONTWAIT) {
            Ok((0, _)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control socket closed",
            )),
            Ok((n, fd)) => Ok(Some((decode_main_cmd(&buf[..n])?, fd))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Synchronous cookie verification against the parent.
    pub fn verify_cookie(
        &self,
        cookie: [u8; COOKIE_SIZE],
        sid: [u8; SID_SIZE],
    ) -> io::Result<bool> {
        self.send(&WorkerMsg::CookieVerify { cookie, sid })?;
        loop {
            let (cmd, fd) = self.recv_blocking()?;
            match cmd {
                MainCmd::CookieReply { ok } => return Ok(ok),
                // Unrelated commands queued ahead of the reply are not
                // expected during setup; an fd racing in here would leak.
                other => {
                    drop(fd);
                    log::warn!("[CTRL] ignoring {:?} while awaiting cookie reply", other);
                }
            }
        }
    }

    fn send_raw(&self, buf: &[u8], pass_fd: Option<RawFd>) -> io::Result<()> {
        sendmsg_fd(self.fd.as_raw_fd(), buf, pass_fd)
    }
}

fn recvmsg_fd(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cbuf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr().cast();
    msg.msg_controllen = cbuf.len() as _;

    let n = loop {
        let rc = unsafe { libc::recvmsg(fd, &mut msg, flags) };
        if rc >= 0 {
            break rc as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut passed = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
                passed = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n, passed))
}

fn sendmsg_fd(fd: RawFd, buf: &[u8], pass_fd: Option<RawFd>) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cbuf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(pfd) = pass_fd {
        msg.msg_control = cbuf.as_mut_ptr().cast();
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(4) } as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(4) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, pfd);
        }
    }

    loop {
        let rc = unsafe { libc::sendmsg(fd, &msg, 0) };
        if rc >= 0 {
            if rc as usize != buf.len() {
                return Err(io::Error::other("short control message send"));
            }
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_worker_msg_roundtrip() {
        let msgs = [
            WorkerMsg::TunMtu { mtu: 1399 },
            WorkerMsg::SessionInfo {
                tls_ciphersuite: Some("TLS13_AES_256_GCM_SHA384".to_string()),
                dtls_ciphersuite: Some("OC-DTLS1_2-AES128-GCM".to_string()),
                user_agent: None,
            },
            WorkerMsg::CookieVerify {
                cookie: [7; COOKIE_SIZE],
                sid: [9; SID_SIZE],
            },
            WorkerMsg::ResumeQuery {
                session_id: [3; SESSION_ID_SIZE],
            },
        ];
        for msg in msgs {
            let wire = encode_worker_msg(&msg);
            assert_eq!(decode_worker_msg(&wire).unwrap(), msg);
        }
    }

    #[test]
    fn test_main_cmd_roundtrip() {
        let cmds = [
            MainCmd::CookieReply { ok: true },
            MainCmd::UdpFd,
            MainCmd::ResumeReply {
                master_secret: Some([0x5A; MASTER_SECRET_SIZE]),
            },
            MainCmd::ResumeReply {
                master_secret: None,
            },
        ];
        for cmd in cmds {
            let wire = encode_main_cmd(&cmd);
            assert_eq!(decode_main_cmd(&wire).unwrap(), cmd);
        }
    }

    #[test]
    fn test_envelope_validation() {
        let mut wire = encode_worker_msg(&WorkerMsg::TunMtu { mtu: 1400 });
        wire[2] = 99; // bad version
        assert!(decode_worker_msg(&wire).is_err());

        let wire = encode_worker_msg(&WorkerMsg::TunMtu { mtu: 1400 });
        assert!(decode_worker_msg(&wire[..3]).is_err());
    }

    #[test]
    fn test_socketpair_exchange() {
        let (worker, parent) = ControlChannel::pair().unwrap();

        worker.send(&WorkerMsg::TunMtu { mtu: 1360 }).unwrap();
        let mut buf = [0u8; MAX_CTRL_MSG];
        let (n, fd) = recvmsg_fd(parent.as_raw_fd(), &mut buf, 0).unwrap();
        assert!(fd.is_none());
        assert_eq!(
            decode_worker_msg(&buf[..n]).unwrap(),
            WorkerMsg::TunMtu { mtu: 1360 }
        );

        parent.send_cmd(&MainCmd::CookieReply { ok: true }, None).unwrap();
        let (cmd, _) = worker.recv_blocking().unwrap();
        assert_eq!(cmd, MainCmd::CookieReply { ok: true });

        assert!(worker.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_fd_handover() {
        let (worker, parent) = ControlChannel::pair().unwrap();

        // Hand the read end of a pipe across and prove it still works.
        let mut pipe_fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (pipe_fds[0], pipe_fds[1]);

        parent.send_cmd(&MainCmd::UdpFd, Some(rd)).unwrap();
        unsafe { libc::close(rd) };

        let (cmd, fd) = worker.recv_blocking().unwrap();
        assert_eq!(cmd, MainCmd::UdpFd);
        let fd = fd.expect("fd must ride along");

        assert_eq!(unsafe { libc::write(wr, b"ping".as_ptr().cast(), 4) }, 4);
        unsafe { libc::close(wr) };

        let mut got = [0u8; 4];
        let mut file = std::fs::File::from(fd);
        file.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");
    }

    #[test]
    fn test_cookie_verify_flow() {
        let (worker, parent) = ControlChannel::pair().unwrap();

        parent.send_cmd(&MainCmd::CookieReply { ok: false }, None).unwrap();
        let ok = worker.verify_cookie([1; COOKIE_SIZE], [2; SID_SIZE]).unwrap();
        assert!(!ok);

        // The request itself must have reached the parent first.
        let mut buf = [0u8; MAX_CTRL_MSG];
        let (n, _) = recvmsg_fd(parent.as_raw_fd(), &mut buf, 0).unwrap();
        assert!(matches!(
            decode_worker_msg(&buf[..n]).unwrap(),
            WorkerMsg::CookieVerify { .. }
        ));
    }
}
