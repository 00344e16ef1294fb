// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rustls-backed reliable channel.
//!
//! Wraps a server-side rustls session over a non-blocking TCP stream and
//! exposes it through the [`RecordChannel`] contract. Only the reliable
//! channel is backed here; the datagram record layer stays behind
//! [`super::DatagramChannel`] because DTLS sessions seeded from an
//! externally supplied premaster secret are outside rustls's model.
//!
//! rustls performs no renegotiation, so this channel never surfaces
//! [`RecordError::Rehandshake`], and alert delivery degrades to
//! close-notify (rustls does not expose raw alerts).

use std::io::{self, Read, Write};
use std::sync::Arc;

use mio::net::TcpStream;

use super::{Alert, RecordChannel, RecordError, RecordResult};

/// Nominal per-record ciphertext overhead (header, nonce, tag) of the
/// AEAD suites rustls negotiates.
const TLS_RECORD_OVERHEAD: u16 = 29;

pub struct TlsChannel {
    conn: rustls::ServerConnection,
    sock: TcpStream,
    /// Decrypted bytes known to be buffered inside rustls.
    plaintext_pending: usize,
    /// The TCP stream hit EOF.
    tcp_eof: bool,
    closed: bool,
}

impl TlsChannel {
    pub fn new(config: Arc<rustls::ServerConfig>, sock: TcpStream) -> io::Result<Self> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            conn,
            sock,
            plaintext_pending: 0,
            tcp_eof: false,
            closed: false,
        })
    }

    pub fn socket(&self) -> &TcpStream {
        &self.sock
    }

    /// Pull ciphertext from the socket into rustls and decrypt.
    fn pump_read(&mut self) -> RecordResult<()> {
        match self.conn.read_tls(&mut self.sock) {
            Ok(0) => {
                // TCP level EOF; surfaced to the caller as a clean close.
                self.tcp_eof = true;
                self.plaintext_pending = 0;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(RecordError::WouldBlock)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Err(RecordError::Interrupted)
            }
            Err(e) => return Err(RecordError::fatal(e)),
        }

        match self.conn.process_new_packets() {
            Ok(state) => {
                self.plaintext_pending = state.plaintext_bytes_to_read();
                Ok(())
            }
            Err(e) => {
                // Let rustls push its alert out before reporting.
                let _ = self.conn.write_tls(&mut self.sock);
                Err(RecordError::fatal(e))
            }
        }
    }

    /// Push buffered ciphertext out to the socket.
    fn pump_write(&mut self) -> RecordResult<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(0) => return Err(RecordError::fatal("socket closed during write")),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RecordError::fatal(e)),
            }
        }
        Ok(())
    }
}

impl RecordChannel for TlsChannel {
    fn recv(&mut self, buf: &mut [u8]) -> RecordResult<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => {
                    self.plaintext_pending = self.plaintext_pending.saturating_sub(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No decrypted data buffered; pull from the socket.
                    // `pump_read` surfaces `WouldBlock` only once the
                    // socket is drained, which the edge-triggered poll
                    // upstream depends on.
                    self.pump_read()?;
                    if self.tcp_eof {
                        return Ok(0);
                    }
                }
                Err(e) => return Err(RecordError::fatal(e)),
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> RecordResult<usize> {
        self.conn
            .writer()
            .write_all(buf)
            .map_err(RecordError::fatal)?;
        self.pump_write()?;
        Ok(buf.len())
    }

    fn pending(&self) -> bool {
        self.plaintext_pending > 0
    }

    fn handshake(&mut self) -> RecordResult<()> {
        while self.conn.is_handshaking() {
            self.pump_write()?;
            if !self.conn.is_handshaking() {
                break;
            }
            self.pump_read()?;
        }
        self.pump_write()?;
        Ok(())
    }

    fn flush(&mut self) -> RecordResult<()> {
        self.pump_write()
    }

    fn send_alert(&mut self, alert: Alert, fatal: bool) -> RecordResult<()> {
        // rustls exposes no raw alert interface; a fatal alert degrades
        // to an immediate close-notify, a warning to a log line.
        if fatal {
            log::debug!("[TLS] sending {:?} as close-notify", alert);
            self.close();
        } else {
            log::debug!("[TLS] suppressing warning alert {:?}", alert);
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.conn.send_close_notify();
            let _ = self.pump_write();
        }
    }

    fn record_overhead(&self) -> u16 {
        TLS_RECORD_OVERHEAD
    }

    fn describe_ciphersuite(&self) -> Option<String> {
        self.conn
            .negotiated_cipher_suite()
            .map(|cs| format!("{:?}", cs.suite()))
    }
}

impl Drop for TlsChannel {
    fn drop(&mut self) {
        self.close();
    }
}
