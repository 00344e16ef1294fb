// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Record-layer collaborator contract.
//!
//! The tunnel engine never touches cryptography. Both channels are driven
//! through the traits in this module: [`RecordChannel`] for the reliable
//! TLS stream and [`DatagramChannel`] for the DTLS datagram session. The
//! engine owns the policy (what to send, when to probe, when to tear
//! down); the record layer owns encryption, record framing and handshake
//! mechanics.
//!
//! The datagram session is not negotiated from scratch: it is seeded from
//! the premaster secret and session id the peer carried in the
//! reliable-channel handshake headers ([`DatagramParams`]), which is what
//! lets the channel be torn down and reborn mid-session.

use std::fmt;
use std::io;
use std::net::UdpSocket;

use crate::ciphers::DtlsCipherSuite;

pub mod mem;
#[cfg(feature = "tls")]
pub mod tls;

/// Errors surfaced by a record layer. Everything unrecoverable collapses
/// into `Fatal`; the tunnel loop decides what each kind means for the
/// session.
#[derive(Debug)]
pub enum RecordError {
    /// No progress possible right now; retry after readiness.
    WouldBlock,
    /// Interrupted by a signal; retry immediately.
    Interrupted,
    /// The datagram payload exceeded what the path accepts. Recovered by
    /// MTU discovery, never fatal.
    LargePacket,
    /// The peer asked for a renegotiation.
    Rehandshake,
    /// Unrecoverable record-layer failure.
    Fatal(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::WouldBlock => write!(f, "operation would block"),
            RecordError::Interrupted => write!(f, "interrupted"),
            RecordError::LargePacket => write!(f, "payload exceeds path MTU"),
            RecordError::Rehandshake => write!(f, "peer requested rehandshake"),
            RecordError::Fatal(e) => write!(f, "record layer failure: {}", e),
        }
    }
}

impl RecordError {
    pub fn fatal(e: impl fmt::Display) -> Self {
        RecordError::Fatal(e.to_string())
    }
}

pub type RecordResult<T> = Result<T, RecordError>;

/// Alerts the engine may ask the record layer to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    /// Sent fatally when an unauthenticated peer attempts to tunnel.
    AccessDenied,
    /// Sent as a warning when the peer asks the datagram channel to
    /// renegotiate.
    NoRenegotiation,
}

/// One encrypted channel, reliable or datagram.
pub trait RecordChannel {
    /// Receive one record's plaintext. `Ok(0)` means orderly close by the
    /// peer.
    fn recv(&mut self, buf: &mut [u8]) -> RecordResult<usize>;

    /// Send plaintext as one record. For datagram channels the send is
    /// best-effort and must not block.
    fn send(&mut self, buf: &[u8]) -> RecordResult<usize>;

    /// Whether decrypted records are already buffered, in which case the
    /// tunnel loop must not sleep before draining them.
    fn pending(&self) -> bool {
        false
    }

    /// Drive the (re)handshake one step. `Ok(())` means complete;
    /// `Err(WouldBlock)` means still in progress.
    fn handshake(&mut self) -> RecordResult<()> {
        Ok(())
    }

    /// Flush any buffered outgoing records. Called once per loop turn.
    fn flush(&mut self) -> RecordResult<()> {
        Ok(())
    }

    /// Deliver an alert to the peer.
    fn send_alert(&mut self, alert: Alert, fatal: bool) -> RecordResult<()>;

    /// Close the channel, sending close-notify when possible. Idempotent.
    fn close(&mut self);

    /// Per-record ciphertext overhead of the negotiated parameters.
    fn record_overhead(&self) -> u16;

    /// Human-readable negotiated-suite description for session reporting.
    fn describe_ciphersuite(&self) -> Option<String> {
        None
    }
}

/// The datagram flavor adds MTU plumbing on top of [`RecordChannel`].
pub trait DatagramChannel: RecordChannel {
    /// Tell the record layer how much plaintext one record may carry.
    fn set_data_mtu(&mut self, mtu: u16);

    /// The data-MTU the handshake negotiated.
    fn negotiated_data_mtu(&self) -> u16;

    /// Tell the record layer the link MTU below it.
    fn set_link_mtu(&mut self, mtu: u16);
}

/// Seed material for a datagram session, lifted from the reliable-channel
/// handshake headers.
pub struct DatagramParams {
    pub master_secret: [u8; crate::config::MASTER_SECRET_SIZE],
    pub session_id: [u8; crate::config::SESSION_ID_SIZE],
    pub suite: &'static DtlsCipherSuite,
}

impl fmt::Debug for DatagramParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The master secret must never reach logs.
        f.debug_struct("DatagramParams")
            .field("suite", &self.suite.oc_name)
            .finish_non_exhaustive()
    }
}

/// Builds datagram record sessions over handed-over UDP sockets.
pub trait DatagramFactory {
    /// Construct a datagram session seeded with `params`, transporting
    /// over `socket`. The socket is already connected to the peer.
    fn open(
        &self,
        params: &DatagramParams,
        socket: UdpSocket,
    ) -> io::Result<Box<dyn DatagramChannel>>;

    /// Per-record overhead estimate for a suite, used for MTU header math
    /// before the session exists.
    fn record_overhead(&self, suite: &DtlsCipherSuite) -> u16 {
        suite.nominal_record_overhead()
    }
}

/// Send a whole buffer through a record channel, retrying interrupts.
/// Used for the handshake-phase HTTP responses where partial sends are
/// not acceptable.
pub fn send_all(ch: &mut dyn RecordChannel, mut buf: &[u8]) -> RecordResult<()> {
    while !buf.is_empty() {
        match ch.send(buf) {
            Ok(0) => return Err(RecordError::fatal("record layer accepted no bytes")),
            Ok(n) => buf = &buf[n..],
            Err(RecordError::Interrupted) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_debug_hides_secret() {
        let params = DatagramParams {
            master_secret: [0xAA; crate::config::MASTER_SECRET_SIZE],
            session_id: [0xBB; crate::config::SESSION_ID_SIZE],
            suite: &crate::ciphers::DTLS_CIPHERSUITES[0],
        };
        let s = format!("{:?}", params);
        assert!(!s.contains("AA"));
        assert!(!s.contains("170"));
        assert!(s.contains("OC-DTLS1_2-AES128-GCM"));
    }
}
