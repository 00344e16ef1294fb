// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket tuning for the tunnel sockets.
//!
//! MSS polling feeds the MTU controller; send-buffer sizing and traffic
//! priority are applied at tunnel setup. Tuning failures are log-only -
//! the tunnel works without them.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use socket2::SockRef;

use crate::config::NetPriority;

/// Kernel-reported TCP maximum segment size of the reliable socket.
pub fn tcp_mss(fd: RawFd) -> io::Result<u32> {
    let mut mss: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            std::ptr::addr_of_mut!(mss).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(mss as u32)
}

/// Size the socket's send buffer to `mtus` full packets.
pub fn set_sndbuf<F: AsFd>(sock: &F, conn_mtu: u16, mtus: u32) {
    let bytes = conn_mtu as usize * mtus as usize;
    if let Err(e) = SockRef::from(sock).set_send_buffer_size(bytes) {
        log::debug!("[SOCK] setting SO_SNDBUF to {} failed: {}", bytes, e);
    }
}

/// Apply the configured traffic priority.
pub fn set_net_priority<F: AsFd>(sock: &F, priority: NetPriority) {
    match priority {
        NetPriority::Unset => {}
        NetPriority::Tos(tos) => {
            if let Err(e) = SockRef::from(sock).set_tos(tos as u32) {
                log::debug!("[SOCK] setting IP_TOS to {:#x} failed: {}", tos, e);
            }
        }
        NetPriority::Priority(prio) => {
            let val: libc::c_int = (prio as libc::c_int - 1).max(0);
            let rc = unsafe {
                libc::setsockopt(
                    sock.as_fd().as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_PRIORITY,
                    std::ptr::addr_of!(val).cast(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                log::debug!(
                    "[SOCK] setting SO_PRIORITY to {} failed: {}",
                    val,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

/// Borrow a raw fd for the `AsFd`-based helpers.
///
/// # Safety
/// `fd` must stay open for the duration of the borrow.
pub unsafe fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
    BorrowedFd::borrow_raw(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream, UdpSocket};

    #[test]
    fn test_tcp_mss_on_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mss = tcp_mss(stream.as_raw_fd()).unwrap();
        // Loopback MSS is large but always positive.
        assert!(mss > 0);
    }

    #[test]
    fn test_sndbuf_and_priority_do_not_error() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        set_sndbuf(&sock, 1400, 10);
        set_net_priority(&sock, NetPriority::Tos(0x60));
        set_net_priority(&sock, NetPriority::Priority(3));
        set_net_priority(&sock, NetPriority::Unset);
    }
}
