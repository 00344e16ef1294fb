// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram channel lifecycle driver.
//!
//! Walks a session's datagram channel through fd handover, record-session
//! construction and the DTLS handshake (see the state diagram in
//! [`crate::session`]). The handshake doubles as the first MTU probe:
//! oversized flights walk the estimate down before retrying, and
//! bottoming out disables the channel for good.
//!
//! Because the record session is seeded from header material rather than
//! negotiated from scratch, a fresh fd handover mid-session tears the old
//! session down and rebuilds - the datagram channel is reborn while the
//! logical session continues.

use std::fmt;
use std::io;
use std::net::UdpSocket;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::ctrl::ControlChannel;
use crate::record::{DatagramFactory, RecordError};
use crate::session::{Session, UdpState};

/// Failures constructing the datagram record session. Fatal to the whole
/// session: by the time setup runs, the seed material was already
/// committed to in the tunnel response headers.
#[derive(Debug)]
pub enum SetupError {
    /// Master secret or ciphersuite missing.
    MissingSeed,
    /// No socket was parked for setup.
    MissingSocket,
    /// The record-layer collaborator refused.
    Factory(io::Error),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::MissingSeed => write!(f, "no DTLS seed material negotiated"),
            SetupError::MissingSocket => write!(f, "no UDP socket for DTLS setup"),
            SetupError::Factory(e) => write!(f, "datagram record session setup: {}", e),
        }
    }
}

/// Result of a UDP fd handover from the parent.
#[derive(Debug, PartialEq, Eq)]
pub enum HandoverOutcome {
    /// Socket accepted; register `fd` and expect a Setup pass.
    Accepted(RawFd),
    /// The datagram channel is disabled for this session; fd dropped.
    Ignored,
}

/// Result of one handshake-driving pass.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Waiting for more handshake flights.
    InProgress,
    /// Channel is up; carries the applied connection MTU.
    Established(u16),
    /// Handshake failed fatally or MTU discovery bottomed out; the
    /// channel is disabled, the session continues on TCP only.
    Disabled,
}

/// Take ownership of a UDP socket handed over by the parent.
///
/// A handover while a datagram session already exists is a rebirth: the
/// old record session is dropped and the lifecycle restarts at Setup.
/// The caller deregisters the old fd and registers the returned one.
pub fn accept_udp_fd(session: &mut Session, fd: OwnedFd) -> io::Result<HandoverOutcome> {
    if session.udp_state() == UdpState::Disabled {
        log::info!("[DTLS] dropping UDP fd handover, channel is disabled");
        return Ok(HandoverOutcome::Ignored);
    }

    if session.udp_state() != UdpState::WaitFd {
        log::info!(
            "[DTLS] UDP fd handover in {:?}; rebuilding datagram channel",
            session.udp_state()
        );
        session.dtls = None;
    }

    let socket = UdpSocket::from(fd);
    socket.set_nonblocking(true)?;
    let raw = socket.as_raw_fd();
    session.pending_udp_socket = Some(socket);
    session.set_udp_state(UdpState::Setup);
    Ok(HandoverOutcome::Accepted(raw))
}

/// Construct the datagram record session from the parked socket and the
/// seed material collected during the reliable-channel handshake.
pub fn setup_datagram(
    session: &mut Session,
    factory: &dyn DatagramFactory,
) -> Result<(), SetupError> {
    let params = session.datagram_params().ok_or(SetupError::MissingSeed)?;
    let socket = session
        .pending_udp_socket
        .take()
        .ok_or(SetupError::MissingSocket)?;

    log::info!("[DTLS] setting up DTLS connection");
    let mut dtls = factory.open(&params, socket).map_err(SetupError::Factory)?;

    let conn_mtu = session.mtu.conn_mtu();
    dtls.set_link_mtu(conn_mtu);
    session.dtls = Some(dtls);
    session.mtu.reinit(conn_mtu);
    session.set_udp_state(UdpState::Handshake);
    Ok(())
}

/// Drive the datagram handshake one readiness-event's worth.
///
/// `dtls_mtu_cap` is the MTU already announced in the tunnel response
/// headers; the peer rejects larger values, so the negotiated data-MTU is
/// capped by it.
pub fn drive_handshake(
    session: &mut Session,
    ctrl: &ControlChannel,
    dtls_mtu_cap: u16,
) -> io::Result<HandshakeProgress> {
    loop {
        let result = match session.dtls.as_mut() {
            Some(dtls) => dtls.handshake(),
            None => {
                session.set_udp_state(UdpState::Disabled);
                return Ok(HandshakeProgress::Disabled);
            }
        };

        match result {
            Ok(()) => {
                let negotiated = session
                    .dtls
                    .as_ref()
                    .map(|d| d.negotiated_data_mtu())
                    .unwrap_or(0);
                let mut mtu = if negotiated == 0 {
                    session.mtu.conn_mtu()
                } else {
                    negotiated
                };
                // The peer read a single MTU value from our headers and
                // will drop anything larger.
                if dtls_mtu_cap > 0 {
                    mtu = mtu.min(dtls_mtu_cap);
                }

                session.set_udp_state(UdpState::Active);
                session.mtu.reinit(mtu);
                session.apply_mtu(mtu, ctrl)?;
                log::info!(
                    "[DTLS] handshake completed (plaintext MTU: {})",
                    mtu - 1
                );
                return Ok(HandshakeProgress::Established(mtu));
            }
            Err(RecordError::WouldBlock) => return Ok(HandshakeProgress::InProgress),
            Err(RecordError::Interrupted) => continue,
            Err(RecordError::LargePacket) => {
                // The flight exceeded the path MTU; shrink and retry.
                if !session.mtu_not_ok(ctrl)? {
                    return Ok(HandshakeProgress::Disabled);
                }
                if let Some(dtls) = session.dtls.as_mut() {
                    dtls.set_link_mtu(session.mtu.conn_mtu());
                }
            }
            Err(RecordError::Rehandshake) => {
                // Cannot happen during the initial handshake; treat like
                // any other fatal condition.
                log::warn!("[DTLS] unexpected rehandshake signal during handshake");
                session.set_udp_state(UdpState::Disabled);
                return Ok(HandshakeProgress::Disabled);
            }
            Err(RecordError::Fatal(e)) => {
                log::error!("[DTLS] error in DTLS handshake: {}", e);
                session.set_udp_state(UdpState::Disabled);
                return Ok(HandshakeProgress::Disabled);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ciphers::DTLS_CIPHERSUITES;
    use crate::config::MASTER_SECRET_SIZE;
    use crate::ctrl::{decode_worker_msg, WorkerMsg, MAX_CTRL_MSG};
    use crate::net::{AddrFamily, NetworkInfo};
    use crate::record::mem::{MemoryChannel, MemoryFactory, MemoryPeer};

    fn seeded_session() -> Session {
        let (tls, _peer) = MemoryChannel::pair();
        let vinfo = NetworkInfo {
            ipv4: Some("192.0.2.10".to_string()),
            mtu: 1500,
            ..Default::default()
        };
        let mut s = Session::new(AddrFamily::V4, Box::new(tls), vinfo).unwrap();
        s.master_secret = Some([0x11; MASTER_SECRET_SIZE]);
        s.suite = Some(&DTLS_CIPHERSUITES[0]);
        s.arm_udp();
        s
    }

    fn udp_fd() -> OwnedFd {
        OwnedFd::from(UdpSocket::bind("127.0.0.1:0").unwrap())
    }

    fn drain_parent(parent: &ControlChannel) -> Vec<WorkerMsg> {
        let mut out = Vec::new();
        let mut buf = [0u8; MAX_CTRL_MSG];
        loop {
            let n = unsafe {
                libc::recv(
                    parent.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n <= 0 {
                return out;
            }
            out.push(decode_worker_msg(&buf[..n as usize]).unwrap());
        }
    }

    fn promote_to_handshake(session: &mut Session) -> MemoryPeer {
        let outcome = accept_udp_fd(session, udp_fd()).unwrap();
        assert!(matches!(outcome, HandoverOutcome::Accepted(_)));
        assert_eq!(session.udp_state(), UdpState::Setup);

        let (dtls, peer) = MemoryChannel::pair();
        let factory = MemoryFactory::new(dtls);
        setup_datagram(session, &factory).unwrap();
        assert_eq!(session.udp_state(), UdpState::Handshake);
        assert_eq!(factory.seen_suite(), Some("OC-DTLS1_2-AES128-GCM"));
        peer
    }

    #[test]
    fn test_handover_rejected_when_disabled() {
        let mut session = seeded_session();
        session.set_udp_state(UdpState::Disabled);
        let outcome = accept_udp_fd(&mut session, udp_fd()).unwrap();
        assert_eq!(outcome, HandoverOutcome::Ignored);
        assert_eq!(session.udp_state(), UdpState::Disabled);
    }

    #[test]
    fn test_setup_without_seed_fails() {
        let mut session = seeded_session();
        session.suite = None;
        accept_udp_fd(&mut session, udp_fd()).unwrap();
        let err = setup_datagram(&mut session, &MemoryFactory::empty()).unwrap_err();
        assert!(matches!(err, SetupError::MissingSeed));
    }

    #[test]
    fn test_handshake_completion_applies_capped_mtu() {
        let (worker_ctrl, parent_ctrl) = ControlChannel::pair().unwrap();
        let mut session = seeded_session();
        let peer = promote_to_handshake(&mut session);

        peer.script_handshake(Err(RecordError::WouldBlock));
        assert_eq!(
            drive_handshake(&mut session, &worker_ctrl, 1340).unwrap(),
            HandshakeProgress::InProgress
        );
        assert_eq!(session.udp_state(), UdpState::Handshake);

        // Handshake finishes with a negotiated data-MTU of 1400, capped
        // by the announced 1340.
        peer.set_negotiated_data_mtu(1400);
        assert_eq!(
            drive_handshake(&mut session, &worker_ctrl, 1340).unwrap(),
            HandshakeProgress::Established(1340)
        );
        assert_eq!(session.udp_state(), UdpState::Active);
        assert_eq!(session.mtu.conn_mtu(), 1340);
        assert_eq!(peer.data_mtu(), 1340);

        // The plaintext MTU reached the parent.
        let msgs = drain_parent(&parent_ctrl);
        assert!(msgs.contains(&WorkerMsg::TunMtu { mtu: 1339 }));
    }

    #[test]
    fn test_handshake_large_packet_shrinks_then_completes() {
        let (worker_ctrl, _parent_ctrl) = ControlChannel::pair().unwrap();
        let mut session = seeded_session();
        let peer = promote_to_handshake(&mut session);

        peer.script_handshake(Err(RecordError::LargePacket));
        peer.set_negotiated_data_mtu(0);
        let progress = drive_handshake(&mut session, &worker_ctrl, 0).unwrap();
        // After the oversize flight the estimate dropped to 2/3 and the
        // retried handshake (scripted success) established at it.
        assert_eq!(progress, HandshakeProgress::Established(1000));
        assert_eq!(peer.handshake_calls(), 2);
    }

    #[test]
    fn test_handshake_fatal_disables_channel() {
        let (worker_ctrl, _parent_ctrl) = ControlChannel::pair().unwrap();
        let mut session = seeded_session();
        let peer = promote_to_handshake(&mut session);

        peer.script_handshake(Err(RecordError::fatal("bad record MAC")));
        assert_eq!(
            drive_handshake(&mut session, &worker_ctrl, 0).unwrap(),
            HandshakeProgress::Disabled
        );
        assert_eq!(session.udp_state(), UdpState::Disabled);
        assert!(session.dtls.is_none());

        // Disabled is terminal even for a fresh handover.
        let outcome = accept_udp_fd(&mut session, udp_fd()).unwrap();
        assert_eq!(outcome, HandoverOutcome::Ignored);
    }

    #[test]
    fn test_rebirth_replaces_record_session() {
        let (worker_ctrl, _parent_ctrl) = ControlChannel::pair().unwrap();
        let mut session = seeded_session();
        let _peer = promote_to_handshake(&mut session);
        drive_handshake(&mut session, &worker_ctrl, 0).unwrap();
        assert_eq!(session.udp_state(), UdpState::Active);

        // A new fd arrives mid-session: lifecycle restarts at Setup.
        let outcome = accept_udp_fd(&mut session, udp_fd()).unwrap();
        assert!(matches!(outcome, HandoverOutcome::Accepted(_)));
        assert_eq!(session.udp_state(), UdpState::Setup);
        assert!(session.dtls.is_none());
        assert!(session.pending_udp_socket.is_some());
    }
}
