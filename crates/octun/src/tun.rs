// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel device I/O.
//!
//! The parent opens and configures the tun device before the worker
//! starts; the worker only moves whole IP packets through the fd. One
//! `read` returns one packet, one `write` injects one.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct TunDevice {
    fd: OwnedFd,
}

impl TunDevice {
    /// Wrap the provisioned tun fd.
    ///
    /// # Safety
    /// `fd` must be a valid, owned tun device descriptor in
    /// non-blocking mode.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Read one packet. Transient conditions (`EAGAIN`, `EINTR`) are the
    /// caller's to classify, anything else is fatal to the session.
    pub fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Inject one packet, retrying interrupts and short writes until the
    /// whole packet is in.
    pub fn write_packet(&self, buf: &[u8]) -> io::Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let rc = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    buf[off..].as_ptr().cast(),
                    buf.len() - off,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            off += rc as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pipe stands in for the tun device: same read/write fd semantics.
    fn pipe_pair() -> (TunDevice, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let dev = unsafe { TunDevice::from_raw_fd(fds[0]) };
        let wr = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        (dev, wr)
    }

    #[test]
    fn test_packet_passthrough() {
        let (dev, wr) = pipe_pair();
        let pkt = b"\x45\x00\x00\x14fake-ip-packet";
        let rc = unsafe { libc::write(wr.as_raw_fd(), pkt.as_ptr().cast(), pkt.len()) };
        assert_eq!(rc as usize, pkt.len());

        let mut buf = [0u8; 64];
        let n = dev.read_packet(&mut buf).unwrap();
        assert_eq!(&buf[..n], pkt);
    }

    #[test]
    fn test_write_packet_whole() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let rd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let dev = unsafe { TunDevice::from_raw_fd(fds[1]) };

        dev.write_packet(b"payload").unwrap();
        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(rd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(&buf[..n as usize], b"payload");
    }
}
