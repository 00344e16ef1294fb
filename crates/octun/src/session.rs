// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection session state.
//!
//! One worker owns exactly one [`Session`]: the reliable record channel,
//! the optional datagram channel with its lifecycle state, the MTU
//! estimates and the single I/O buffer all frames pass through.
//!
//! # Datagram channel lifecycle
//!
//! ```text
//!            master secret        UDP fd        record session
//!            in headers           from parent   constructed
//! Disabled ----------> WaitFd ----------> Setup ----------> Handshake
//!    ^                                                          |
//!    |  handshake failed / MTU exhausted                        v
//!    +------------------------------------------- Active <-> Inactive
//! ```
//!
//! `Disabled` is terminal: once entered it is never left for the rest of
//! the session. `Active <-> Inactive` tracks observed datagram liveness;
//! the record session survives an `Inactive` spell and revives on the
//! next decoded frame.

use std::io;
use std::net::UdpSocket;

use ring::rand::{SecureRandom, SystemRandom};

use crate::ciphers::DtlsCipherSuite;
use crate::config::{
    INITIAL_BUFFER_SIZE, MASTER_SECRET_SIZE, MIN_MTU_IPV4, MIN_MTU_IPV6, SESSION_ID_SIZE,
    SID_SIZE,
};
use crate::ctrl::{ControlChannel, WorkerMsg};
use crate::mtu::MtuDiscovery;
use crate::net::{AddrFamily, NetworkInfo};
use crate::record::{DatagramChannel, DatagramParams, RecordChannel, RecordResult};

/// Datagram channel lifecycle state. The ordering matters: states past
/// `WaitFd` have a UDP socket worth polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UdpState {
    /// No datagram channel for this session, ever.
    Disabled,
    /// Peer supplied a master secret; awaiting the UDP fd from the parent.
    WaitFd,
    /// Socket in hand; datagram record session not yet constructed.
    Setup,
    /// Driving the datagram handshake.
    Handshake,
    /// Datagram channel carries data.
    Active,
    /// Datagram channel presumed dead; reliable channel carries data.
    Inactive,
}

impl UdpState {
    /// Whether the UDP socket should be part of the readiness set.
    pub fn polls_socket(self) -> bool {
        self > UdpState::WaitFd
    }

    /// Whether a datagram record session exists in this state.
    pub fn datagram_live(self) -> bool {
        matches!(self, UdpState::Handshake | UdpState::Active | UdpState::Inactive)
    }
}

/// Progress of the auth collaborator for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Incomplete,
    Complete,
}

pub struct Session {
    pub family: AddrFamily,
    /// Reliable channel; present for the whole session.
    pub tls: Box<dyn RecordChannel>,
    /// Datagram channel; present iff `udp_state.datagram_live()`.
    pub dtls: Option<Box<dyn DatagramChannel>>,
    /// UDP socket parked between fd handover and record-session setup.
    pub pending_udp_socket: Option<UdpSocket>,
    udp_state: UdpState,
    pub master_secret: Option<[u8; MASTER_SECRET_SIZE]>,
    /// Seeds the datagram session; announced as `X-DTLS-Session-ID`.
    pub session_id: [u8; SESSION_ID_SIZE],
    /// Worker session id; replaced when the peer presents a
    /// `webvpncontext` cookie.
    pub sid: [u8; SID_SIZE],
    pub suite: Option<&'static DtlsCipherSuite>,
    pub vinfo: NetworkInfo,
    pub mtu: MtuDiscovery,
    /// The one I/O buffer all frames pass through. The first 8 bytes are
    /// reserved so tun payloads can be framed in place for either
    /// channel.
    pub buffer: Vec<u8>,
    pub hostname: Option<String>,
    pub user_agent: Option<String>,
    pub auth_state: AuthState,
    /// Monotonic time of the last accepted reliable-channel rekey.
    pub last_tls_rehandshake: u64,
}

impl Session {
    pub fn new(
        family: AddrFamily,
        tls: Box<dyn RecordChannel>,
        vinfo: NetworkInfo,
    ) -> io::Result<Self> {
        let rng = SystemRandom::new();
        let mut session_id = [0u8; SESSION_ID_SIZE];
        let mut sid = [0u8; SID_SIZE];
        rng.fill(&mut session_id)
            .and_then(|()| rng.fill(&mut sid))
            .map_err(|_| io::Error::other("system RNG failure"))?;

        let min = if vinfo.has_ipv6() {
            MIN_MTU_IPV6
        } else {
            MIN_MTU_IPV4
        };
        let mtu = MtuDiscovery::new(min, vinfo.mtu);

        Ok(Self {
            family,
            tls,
            dtls: None,
            pending_udp_socket: None,
            udp_state: UdpState::Disabled,
            master_secret: None,
            session_id,
            sid,
            suite: None,
            vinfo,
            mtu,
            buffer: vec![0u8; INITIAL_BUFFER_SIZE],
            hostname: None,
            user_agent: None,
            auth_state: AuthState::Incomplete,
            last_tls_rehandshake: 0,
        })
    }

    pub fn udp_state(&self) -> UdpState {
        self.udp_state
    }

    /// Transition the datagram lifecycle. `Disabled` is terminal; any
    /// attempt to leave it is refused.
    pub fn set_udp_state(&mut self, new: UdpState) {
        if self.udp_state == new {
            return;
        }
        if self.udp_state == UdpState::Disabled {
            log::warn!("[DTLS] refusing transition out of Disabled to {:?}", new);
            return;
        }
        log::debug!("[DTLS] state {:?} -> {:?}", self.udp_state, new);
        if new == UdpState::Disabled {
            self.dtls = None;
            self.pending_udp_socket = None;
        }
        self.udp_state = new;
    }

    /// Arms the datagram lifecycle at session setup. Only valid before
    /// the tunnel loop starts, while the state is still the initial
    /// `Disabled`.
    pub fn arm_udp(&mut self) {
        debug_assert!(self.dtls.is_none());
        self.udp_state = UdpState::WaitFd;
    }

    /// Grow the I/O buffer to hold a full frame at the current MTU.
    pub fn ensure_buffer(&mut self, mtu_overhead: u16) {
        let need = self.mtu.conn_mtu() as usize + mtu_overhead as usize;
        if self.buffer.len() < need {
            log::warn!(
                "[SESSION] buffer smaller than MTU ({} < {}); growing",
                self.buffer.len(),
                need
            );
            self.buffer.resize(need, 0);
        }
    }

    /// Apply a new connection MTU: record it, push the data-MTU to the
    /// datagram record layer and report the plaintext MTU (one less for
    /// the frame type byte) to the parent.
    pub fn apply_mtu(&mut self, mtu: u16, ctrl: &ControlChannel) -> io::Result<()> {
        self.mtu.set(mtu);
        if let Some(dtls) = self.dtls.as_mut() {
            dtls.set_data_mtu(mtu);
        }
        ctrl.send(&WorkerMsg::TunMtu { mtu: mtu - 1 })?;
        log::info!("[MTU] setting MTU to {}", mtu - 1);
        Ok(())
    }

    /// A full-size datagram send succeeded; probe upward if possible.
    pub fn mtu_ok(&mut self, ctrl: &ControlChannel) -> io::Result<()> {
        if let Some(next) = self.mtu.ok() {
            self.apply_mtu(next, ctrl)?;
        }
        Ok(())
    }

    /// A datagram send failed as too large. Returns `false` when
    /// discovery bottomed out and the datagram channel was disabled.
    pub fn mtu_not_ok(&mut self, ctrl: &ControlChannel) -> io::Result<bool> {
        let bad = self.mtu.conn_mtu();
        match self.mtu.not_ok() {
            Ok(next) => {
                self.apply_mtu(next, ctrl)?;
                log::info!("[MTU] {} is too large, switching to {}", bad, next);
                Ok(true)
            }
            Err(_) => {
                log::info!("[MTU] could not find a sufficient MTU; disabling DTLS");
                self.set_udp_state(UdpState::Disabled);
                Ok(false)
            }
        }
    }

    /// Seed material for (re)constructing the datagram session.
    pub fn datagram_params(&self) -> Option<DatagramParams> {
        Some(DatagramParams {
            master_secret: self.master_secret?,
            session_id: self.session_id,
            suite: self.suite?,
        })
    }

    /// Receive into the session buffer from the reliable channel.
    pub fn recv_tls(&mut self) -> RecordResult<usize> {
        self.tls.recv(&mut self.buffer)
    }

    /// Receive into the session buffer from the datagram channel.
    /// Must only be called while a datagram session exists.
    pub fn recv_dtls(&mut self) -> RecordResult<usize> {
        match self.dtls.as_mut() {
            Some(dtls) => dtls.recv(&mut self.buffer),
            None => Err(crate::record::RecordError::fatal(
                "datagram channel not established",
            )),
        }
    }

    /// Close both record channels, close-notify first on the reliable
    /// one. Safe to call on every exit path.
    pub fn close_channels(&mut self, send_tls_close: bool) {
        if send_tls_close {
            self.tls.close();
        }
        if self.udp_state == UdpState::Active {
            if let Some(dtls) = self.dtls.as_mut() {
                dtls.close();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
