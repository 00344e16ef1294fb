// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The tunnel engine's event loop.
//!
//! After the CONNECT handshake, [`Tunnel::establish`] emits the tunnel
//! response headers, seeds the MTU estimate and registers every fd with a
//! single poll; [`Tunnel::run`] then multiplexes the tunnel device, the
//! reliable channel, the datagram channel and the parent's control socket
//! until the session ends.
//!
//! # Architecture
//!
//! ```text
//!              +-----------------------------------------+
//!              |                mio::Poll                 |
//!              |  conn fd | tun fd | ctrl fd | udp fd     |
//!              +---------------------+--------------------+
//!                                    | (10 s wait, signals
//!                                    |  unblocked inside)
//!                                    v
//!   periodic check (DPD ladder, MSS clamp)
//!   tun     -> rate limit -> DTLS preferred, CSTP fallback
//!   conn    -> decode CSTP -> tun / DPD / liveness / rekey
//!   udp     -> lifecycle dispatch -> decode DTLS -> tun / liveness
//!   ctrl    -> UDP fd handover, parent commands
//! ```
//!
//! Every leaf failure is mapped here, and only here, to one of: keep
//! going, disable the datagram channel, or exit the session.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::bandwidth::Bandwidth;
use crate::config::{
    WorkerConfig, CSTP_DTLS_OVERHEAD, CSTP_OVERHEAD, IPV4_OVERHEAD, IPV6_OVERHEAD,
    MSS_OPTION_SLACK, UDP_OVERHEAD, UDP_SWITCH_TIME,
};
use crate::ctrl::{ControlChannel, MainCmd, WorkerMsg};
use crate::datagram::{self, HandoverOutcome, HandshakeProgress, SetupError};
use crate::frame::{self, FrameError, PacketType, CSTP_HEADER_SIZE};
use crate::http::HttpRequest;
use crate::liveness::{monotonic_secs, LivenessMonitor};
use crate::net::{route_allowed, AddrFamily};
use crate::record::{Alert, DatagramFactory, RecordError};
use crate::session::{Session, UdpState};
use crate::signal;
use crate::sockopt;
use crate::tun::TunDevice;

const CONN_TOKEN: Token = Token(0);
const TUN_TOKEN: Token = Token(1);
const CTRL_TOKEN: Token = Token(2);
const UDP_TOKEN: Token = Token(3);

/// Readiness wait bound; periodic checks piggyback on the wakeup.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_EVENTS: usize = 16;

// ============================================================================
// Exit reasons
// ============================================================================

/// Why the tunnel loop ended. The loop never returns success: the worker
/// exists only as long as its session.
#[derive(Debug)]
pub enum TunnelError {
    /// The peer closed the reliable channel.
    PeerDisconnect,
    /// The peer sent a DISCONN frame.
    PeerBye,
    /// A termination signal was honored (TERM_SERVER sent).
    Terminated,
    /// The reliable channel failed dead-peer detection.
    DpdTimeout,
    /// The peer requested reliable-channel rekeys too frequently.
    RekeyTooSoon,
    /// Framing violation on the reliable channel.
    Frame(FrameError),
    /// Fatal record-layer failure.
    Record(RecordError),
    /// Datagram session construction failed.
    Setup(SetupError),
    /// Tun device or poll failure.
    Io(io::Error),
    /// The control socket to the parent failed.
    Control(io::Error),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelError::PeerDisconnect => write!(f, "client disconnected"),
            TunnelError::PeerBye => write!(f, "client sent BYE"),
            TunnelError::Terminated => write!(f, "terminated by signal"),
            TunnelError::DpdTimeout => write!(f, "dead peer detection timed out"),
            TunnelError::RekeyTooSoon => write!(f, "client rekeyed too soon"),
            TunnelError::Frame(e) => write!(f, "framing error: {}", e),
            TunnelError::Record(e) => write!(f, "record layer: {}", e),
            TunnelError::Setup(e) => write!(f, "datagram setup: {}", e),
            TunnelError::Io(e) => write!(f, "I/O error: {}", e),
            TunnelError::Control(e) => write!(f, "control socket: {}", e),
        }
    }
}

/// Failures while emitting the tunnel response.
#[derive(Debug)]
pub enum EstablishError {
    /// A 503 with `X-Reason` was already sent.
    Config(&'static str),
    Record(RecordError),
    Io(io::Error),
}

impl fmt::Display for EstablishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstablishError::Config(what) => write!(f, "configuration rejected: {}", what),
            EstablishError::Record(e) => write!(f, "record layer: {}", e),
            EstablishError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

/// Which channel a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelSide {
    Reliable,
    Datagram,
}

// ============================================================================
// Tunnel
// ============================================================================

pub struct Tunnel {
    cfg: WorkerConfig,
    session: Session,
    ctrl: ControlChannel,
    tun: TunDevice,
    poll: Poll,
    events: Events,
    /// Raw fd of the reliable socket, when one exists (MSS polling and
    /// readiness; absent for loopback record layers).
    conn_fd: Option<RawFd>,
    /// Registered datagram socket fd.
    udp_fd: Option<RawFd>,
    dtls_factory: Box<dyn DatagramFactory>,
    liveness: LivenessMonitor,
    b_tx: Bandwidth,
    b_rx: Bandwidth,
    /// Last time a datagram actually arrived on the UDP socket.
    udp_recv_time: u64,
    /// Path overhead below the tunnel payload (headers plus frame type).
    mtu_overhead: u16,
    /// MTU announced in `X-DTLS-MTU`; caps the negotiated data-MTU.
    dtls_mtu_cap: u16,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel").finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Emit the tunnel response and assemble the loop state.
    ///
    /// The caller has already authenticated the peer and verified that a
    /// network is provisioned. Everything the peer's headers contribute
    /// (master secret, suite, MTU hints, family restrictions) is in `req`.
    #[allow(clippy::too_many_lines)]
    pub fn establish(
        cfg: WorkerConfig,
        mut session: Session,
        ctrl: ControlChannel,
        tun: TunDevice,
        conn_fd: Option<RawFd>,
        dtls_factory: Box<dyn DatagramFactory>,
        req: &HttpRequest,
    ) -> Result<Tunnel, EstablishError> {
        use std::fmt::Write as _;

        session.hostname = req.hostname.clone();
        session.user_agent = req.user_agent.clone();

        // Decide the datagram channel's fate up front.
        if cfg.udp_port != 0 && req.master_secret.is_some() {
            if req.selected_ciphersuite.is_none() {
                crate::record::send_all(
                    session.tls.as_mut(),
                    b"HTTP/1.1 503 Service Unavailable\r\n\
                      X-Reason: No DTLS ciphersuite negotiated\r\n\r\n",
                )
                .map_err(EstablishError::Record)?;
                return Err(EstablishError::Config("no DTLS ciphersuite negotiated"));
            }
            session.master_secret = req.master_secret;
            session.suite = req.selected_ciphersuite;
            session.arm_udp();
        } else {
            log::debug!("[CSTP] disabling UDP (DTLS) connection");
        }

        let mut out = String::with_capacity(1024);
        out.push_str("HTTP/1.1 200 CONNECTED\r\n");
        out.push_str("X-CSTP-Version: 1\r\n");
        let _ = write!(out, "X-CSTP-DPD: {}\r\n", cfg.dpd);
        if let Some(domain) = &cfg.default_domain {
            let _ = write!(out, "X-CSTP-Default-Domain: {}\r\n", domain);
        }

        if !req.no_ipv4 {
            if let Some(addr) = &session.vinfo.ipv4 {
                log::debug!("[CSTP] sending IPv4 {}", addr);
                let _ = write!(out, "X-CSTP-Address: {}\r\n", addr);
                if let Some(mask) = &session.vinfo.ipv4_netmask {
                    let _ = write!(out, "X-CSTP-Netmask: {}\r\n", mask);
                }
                if let Some(dns) = &session.vinfo.ipv4_dns {
                    let _ = write!(out, "X-CSTP-DNS: {}\r\n", dns);
                }
                if let Some(nbns) = &session.vinfo.ipv4_nbns {
                    let _ = write!(out, "X-CSTP-NBNS: {}\r\n", nbns);
                }
            }
        }
        if !req.no_ipv6 {
            if let Some(addr) = &session.vinfo.ipv6 {
                log::debug!("[CSTP] sending IPv6 {}", addr);
                let _ = write!(out, "X-CSTP-Address: {}\r\n", addr);
                if let Some(mask) = &session.vinfo.ipv6_netmask {
                    let _ = write!(out, "X-CSTP-Netmask: {}\r\n", mask);
                }
                if let Some(dns) = &session.vinfo.ipv6_dns {
                    let _ = write!(out, "X-CSTP-DNS: {}\r\n", dns);
                }
                if let Some(nbns) = &session.vinfo.ipv6_nbns {
                    let _ = write!(out, "X-CSTP-NBNS: {}\r\n", nbns);
                }
            }
        }
        for route in &session.vinfo.routes {
            if !route_allowed(route, req.no_ipv4, req.no_ipv6) {
                continue;
            }
            log::debug!("[CSTP] adding route {}", route);
            let _ = write!(out, "X-CSTP-Split-Include: {}\r\n", route);
        }

        let _ = write!(out, "X-CSTP-Keepalive: {}\r\n", cfg.keepalive);
        out.push_str("X-CSTP-Smartcard-Removal-Disconnect: true\r\n");
        let _ = write!(out, "X-CSTP-Rekey-Time: {}\r\n", cfg.rekey_time());
        out.push_str("X-CSTP-Rekey-Method: new-tunnel\r\n");
        out.push_str(
            "X-CSTP-Session-Timeout: none\r\n\
             X-CSTP-Idle-Timeout: none\r\n\
             X-CSTP-Disconnected-Timeout: none\r\n\
             X-CSTP-Keep: true\r\n\
             X-CSTP-TCP-Keepalive: true\r\n\
             X-CSTP-Tunnel-All-DNS: false\r\n\
             X-CSTP-License: accept\r\n",
        );

        // MTU seeding: start from the link MTU less the CSTP header, then
        // clamp by the kernel's MSS view of the reliable path.
        let link_mtu = if cfg.default_mtu > 0 {
            cfg.default_mtu
        } else {
            session.vinfo.mtu
        };
        let mut mtu_overhead = CSTP_OVERHEAD;
        session.mtu.set(link_mtu.saturating_sub(mtu_overhead));

        if req.cstp_mtu > 0 {
            log::debug!("[MTU] peer's CSTP MTU is {} (ignored)", req.cstp_mtu);
        }

        if let Some(fd) = conn_fd {
            match sockopt::tcp_mss(fd) {
                Ok(mss) => {
                    let budget = mss as i64 - MSS_OPTION_SLACK as i64 - mtu_overhead as i64;
                    log::debug!("[MTU] TCP MSS is {}", mss as i64 - MSS_OPTION_SLACK as i64);
                    if budget > 0 && (budget as u16) < session.mtu.conn_mtu() {
                        log::debug!("[MTU] reducing MTU due to TCP MSS to {}", budget);
                        session.mtu.clamp(budget as u16);
                    }
                }
                Err(e) => log::info!("[MTU] error querying TCP MSS: {}", e),
            }
            if cfg.output_buffer > 0 {
                let sock = unsafe { sockopt::borrow_fd(fd) };
                sockopt::set_sndbuf(&sock, session.mtu.conn_mtu(), cfg.output_buffer);
            }
            let sock = unsafe { sockopt::borrow_fd(fd) };
            sockopt::set_net_priority(&sock, cfg.net_priority);
        }

        // Datagram headers and the datagram-path MTU model.
        let mut dtls_mtu_cap = 0u16;
        if session.udp_state() != UdpState::Disabled {
            let Some(suite) = session.suite else {
                return Err(EstablishError::Config("no DTLS ciphersuite negotiated"));
            };

            let _ = write!(out, "X-DTLS-Session-ID: {}\r\n", hex::encode(session.session_id));
            let _ = write!(out, "X-DTLS-DPD: {}\r\n", cfg.dpd);
            let _ = write!(out, "X-DTLS-Port: {}\r\n", cfg.udp_port);
            let _ = write!(out, "X-DTLS-Rekey-Time: {}\r\n", cfg.rekey_time());
            let _ = write!(out, "X-DTLS-Keepalive: {}\r\n", cfg.keepalive);
            log::info!("[DTLS] ciphersuite: {}", suite.oc_name);
            let _ = write!(out, "X-DTLS-CipherSuite: {}\r\n", suite.oc_name);

            // The same family is assumed for the outer UDP flow as for
            // the reliable connection.
            mtu_overhead = match session.family {
                AddrFamily::V4 => IPV4_OVERHEAD,
                AddrFamily::V6 => IPV6_OVERHEAD,
            } + UDP_OVERHEAD
                + CSTP_DTLS_OVERHEAD;
            session.mtu.clamp(link_mtu.saturating_sub(mtu_overhead));

            let record_overhead =
                CSTP_DTLS_OVERHEAD + dtls_factory.record_overhead(suite);

            // The peer's CSTP MTU stands in when it announced no DTLS MTU.
            let peer_dtls_mtu = if req.dtls_mtu > 0 {
                req.dtls_mtu
            } else {
                req.cstp_mtu
            };
            if peer_dtls_mtu > 0 {
                session.mtu.clamp(
                    peer_dtls_mtu
                        .saturating_add(record_overhead)
                        .saturating_add(mtu_overhead),
                );
                log::debug!(
                    "[MTU] peer's DTLS MTU is {} (overhead: {})",
                    peer_dtls_mtu,
                    record_overhead + mtu_overhead
                );
            }

            dtls_mtu_cap = session.mtu.conn_mtu().saturating_sub(record_overhead);
            let _ = write!(out, "X-DTLS-MTU: {}\r\n", dtls_mtu_cap);
            log::debug!("[MTU] suggesting DTLS MTU {}", dtls_mtu_cap);
        }

        session.ensure_buffer(mtu_overhead);

        let cstp_record_overhead = CSTP_OVERHEAD + session.tls.record_overhead();
        let mut cstp_mtu = session.mtu.conn_mtu().saturating_sub(cstp_record_overhead);
        if dtls_mtu_cap > 0 {
            // openconnect reads a single MTU value for both channels.
            cstp_mtu = cstp_mtu.min(dtls_mtu_cap);
        }
        let _ = write!(out, "X-CSTP-MTU: {}\r\n", cstp_mtu);
        log::debug!("[MTU] suggesting CSTP MTU {}", cstp_mtu);
        log::debug!(
            "[MTU] plaintext MTU is {}",
            session.mtu.conn_mtu().saturating_sub(1)
        );

        if let Some(banner) = &cfg.banner {
            let _ = write!(out, "X-CSTP-Banner: {}\r\n", banner);
        }
        out.push_str("\r\n");

        crate::record::send_all(session.tls.as_mut(), out.as_bytes())
            .map_err(EstablishError::Record)?;

        let conn_mtu = session.mtu.conn_mtu();
        session
            .apply_mtu(conn_mtu, &ctrl)
            .map_err(EstablishError::Io)?;

        // Session facts for accounting.
        ctrl.send(&WorkerMsg::SessionInfo {
            tls_ciphersuite: session.tls.describe_ciphersuite(),
            dtls_ciphersuite: if session.udp_state() != UdpState::Disabled {
                session.suite.map(|s| s.oc_name.to_string())
            } else {
                None
            },
            user_agent: session.user_agent.clone(),
        })
        .map_err(EstablishError::Io)?;

        let now = monotonic_secs();
        let tnow = Instant::now();

        let poll = Poll::new().map_err(EstablishError::Io)?;
        if let Some(fd) = conn_fd {
            poll.registry()
                .register(&mut SourceFd(&fd), CONN_TOKEN, Interest::READABLE)
                .map_err(EstablishError::Io)?;
        }
        poll.registry()
            .register(&mut SourceFd(&tun.as_raw_fd()), TUN_TOKEN, Interest::READABLE)
            .map_err(EstablishError::Io)?;
        poll.registry()
            .register(
                &mut SourceFd(&ctrl.as_raw_fd()),
                CTRL_TOKEN,
                Interest::READABLE,
            )
            .map_err(EstablishError::Io)?;

        Ok(Tunnel {
            liveness: LivenessMonitor::new(cfg.dpd, now),
            b_tx: Bandwidth::new(cfg.tx_per_sec, tnow),
            b_rx: Bandwidth::new(cfg.rx_per_sec, tnow),
            cfg,
            session,
            ctrl,
            tun,
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            conn_fd,
            udp_fd: None,
            dtls_factory,
            udp_recv_time: 0,
            mtu_overhead,
            dtls_mtu_cap,
        })
    }

    /// Run the tunnel until the session ends. Closes both record
    /// channels on the way out.
    pub fn run(mut self) -> TunnelError {
        signal::clear_alarm();
        let err = loop {
            let now = monotonic_secs();
            let tnow = Instant::now();
            if let Err(e) = self.turn(now, tnow) {
                break e;
            }
        };
        log::info!("[TUNNEL] session ending: {}", err);
        let send_close = !matches!(err, TunnelError::PeerDisconnect);
        self.session.close_channels(send_close);
        err
    }

    /// One loop turn: wait (unless records are already buffered), then
    /// drain every source.
    fn turn(&mut self, now: u64, tnow: Instant) -> Result<(), TunnelError> {
        if signal::terminated() {
            log::debug!("[TUNNEL] sending disconnect message in TLS channel");
            let term = frame::cstp_header(PacketType::TermServer, 0);
            let _ = self.send_reliable(&term);
            return Err(TunnelError::Terminated);
        }

        let pending = self.session.tls.pending()
            || self.session.dtls.as_ref().is_some_and(|d| d.pending());
        if !pending {
            self.wait()?;
        }

        self.periodic_check(now)?;
        self.pump_tun(tnow)?;
        self.pump_tls(now, tnow)?;
        self.pump_udp(now, tnow)?;
        self.pump_ctrl(now, tnow)?;
        self.session.tls.flush().map_err(TunnelError::Record)?;
        Ok(())
    }

    /// Block for readiness with the termination signals deliverable.
    /// A signal interrupting the wait is observed at the top of the next
    /// turn; one landing at the window's edge is covered by the alarm
    /// backstop.
    fn wait(&mut self) -> Result<(), TunnelError> {
        let guard = signal::UnblockGuard::new().map_err(TunnelError::Io)?;
        let result = self.poll.poll(&mut self.events, Some(WAIT_TIMEOUT));
        drop(guard);
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(TunnelError::Io(e)),
        }
    }

    // ------------------------------------------------------------------
    // Periodic check
    // ------------------------------------------------------------------

    fn periodic_check(&mut self, now: u64) -> Result<(), TunnelError> {
        let udp_active = self.session.udp_state() == UdpState::Active;
        let Some(actions) = self.liveness.check(now, udp_active) else {
            return Ok(());
        };

        if actions.probe_udp {
            log::error!(
                "[DPD] no UDP traffic for {} secs; probing",
                now.saturating_sub(self.liveness.last_msg_udp())
            );
            if let Some(dtls) = self.session.dtls.as_mut() {
                // Probe is best-effort; a dead path is what we're testing.
                let _ = dtls.send(&[PacketType::DpdOut.wire()]);
            }
            if actions.udp_dead {
                log::error!("[DPD] UDP silent for too long; deactivating channel");
                self.session.set_udp_state(UdpState::Inactive);
            }
        }

        if actions.probe_tcp {
            log::error!(
                "[DPD] no TCP traffic for {} secs; probing",
                now.saturating_sub(self.liveness.last_msg_tcp())
            );
            let probe = frame::cstp_header(PacketType::DpdOut, 0);
            self.send_reliable(&probe)?;
            if actions.tcp_dead {
                log::error!("[DPD] TCP silent for too long; tearing down session");
                return Err(TunnelError::DpdTimeout);
            }
        }

        if let Some(fd) = self.conn_fd {
            match sockopt::tcp_mss(fd) {
                Ok(mss) => {
                    let budget =
                        mss as i64 - MSS_OPTION_SLACK as i64 - self.mtu_overhead as i64;
                    log::debug!("[MTU] TCP MSS is {}", mss as i64 - MSS_OPTION_SLACK as i64);
                    if budget > 0 {
                        if let Some(next) = self.session.mtu.mss_clamp(budget as u16) {
                            log::info!("[MTU] reducing MTU due to TCP MSS to {}", next);
                            self.session
                                .apply_mtu(next, &self.ctrl)
                                .map_err(TunnelError::Control)?;
                        }
                    }
                }
                Err(e) => log::info!("[MTU] error querying TCP MSS: {}", e),
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Tun device -> channels
    // ------------------------------------------------------------------

    fn pump_tun(&mut self, tnow: Instant) -> Result<(), TunnelError> {
        loop {
            // Payload plus the frame type byte must fit in conn_mtu.
            let max = self.session.mtu.conn_mtu() as usize - 1;
            let end = CSTP_HEADER_SIZE + max;
            let n = match self
                .tun
                .read_packet(&mut self.session.buffer[CSTP_HEADER_SIZE..end])
            {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("[TUN] read failed: {}", e);
                    return Err(TunnelError::Io(e));
                }
            };
            if n == 0 {
                log::info!("[TUN] device returned zero");
                continue;
            }

            if !self
                .b_tx
                .allow(n, self.session.mtu.conn_mtu(), tnow)
            {
                // Silent drop; the limiter already decided.
                continue;
            }

            log::debug!("[TUNNEL] sending {} byte(s)", n);
            let mut tls_retry = false;
            if self.session.udp_state() == UdpState::Active {
                // Frame in place: type byte immediately before the payload.
                self.session.buffer[CSTP_HEADER_SIZE - 1] = PacketType::Data.wire();
                let sent = match self.session.dtls.as_mut() {
                    Some(dtls) => dtls
                        .send(&self.session.buffer[CSTP_HEADER_SIZE - 1..CSTP_HEADER_SIZE + n]),
                    None => Err(RecordError::fatal("datagram channel missing while active")),
                };
                match sent {
                    Ok(len) => {
                        if self.cfg.try_mtu && len as u16 >= self.session.mtu.conn_mtu() {
                            self.session.mtu_ok(&self.ctrl).map_err(TunnelError::Control)?;
                        }
                    }
                    Err(RecordError::LargePacket) => {
                        self.session
                            .mtu_not_ok(&self.ctrl)
                            .map_err(TunnelError::Control)?;
                        log::debug!("[TUNNEL] retrying {} byte(s) on TLS", n);
                        tls_retry = true;
                    }
                    Err(RecordError::WouldBlock | RecordError::Interrupted) => {
                        // Datagram sends are best-effort; drop.
                    }
                    Err(RecordError::Rehandshake) => {
                        log::debug!("[DTLS] dropping send during rehandshake signal");
                    }
                    Err(e @ RecordError::Fatal(_)) => return Err(TunnelError::Record(e)),
                }
            }

            if self.session.udp_state() != UdpState::Active || tls_retry {
                let header = frame::cstp_header(PacketType::Data, n);
                self.session.buffer[..CSTP_HEADER_SIZE].copy_from_slice(&header);
                self.send_reliable_buffer(CSTP_HEADER_SIZE + n)?;
            }
        }
    }

    // ------------------------------------------------------------------
    // Reliable channel -> tun
    // ------------------------------------------------------------------

    fn pump_tls(&mut self, now: u64, tnow: Instant) -> Result<(), TunnelError> {
        loop {
            match self.session.recv_tls() {
                Ok(0) => {
                    log::info!("[CSTP] client disconnected");
                    return Err(TunnelError::PeerDisconnect);
                }
                Ok(n) => {
                    log::debug!("[CSTP] received {} byte(s)", n);
                    if !self.b_rx.allow(
                        n.saturating_sub(CSTP_HEADER_SIZE),
                        self.session.mtu.conn_mtu(),
                        tnow,
                    ) {
                        continue;
                    }
                    let (ptype, payload) = match frame::decode_cstp(&self.session.buffer[..n]) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            log::error!("[CSTP] error parsing CSTP data: {}", e);
                            return Err(TunnelError::Frame(e));
                        }
                    };
                    self.handle_frame(ptype, payload, ChannelSide::Reliable)?;
                    // Whatever arrived counts as liveness evidence.
                    self.liveness.seen_tcp(now);

                    // The client moved data to TLS while the datagram
                    // channel has been quiet: deem the datagram path dead.
                    if ptype == PacketType::Data.wire()
                        && self.session.udp_state() == UdpState::Active
                        && now.saturating_sub(self.udp_recv_time) > UDP_SWITCH_TIME
                    {
                        log::info!("[DTLS] client switched to TLS; deactivating UDP");
                        self.session.set_udp_state(UdpState::Inactive);
                    }
                }
                Err(RecordError::WouldBlock) => return Ok(()),
                Err(RecordError::Interrupted) => continue,
                Err(RecordError::Rehandshake) => self.handle_rekey(now)?,
                Err(e) => return Err(TunnelError::Record(e)),
            }
        }
    }

    /// Reliable-channel rekey, rejected when the last one is too recent.
    fn handle_rekey(&mut self, now: u64) -> Result<(), TunnelError> {
        if self.session.last_tls_rehandshake > 0
            && now.saturating_sub(self.session.last_tls_rehandshake) < self.cfg.rekey_floor()
        {
            log::error!("[CSTP] client requested TLS rehandshake too soon");
            return Err(TunnelError::RekeyTooSoon);
        }
        log::info!("[CSTP] client requested rehandshake on TLS channel");
        loop {
            match self.session.tls.handshake() {
                Ok(()) => break,
                Err(RecordError::WouldBlock) => self.wait()?,
                Err(RecordError::Interrupted) => continue,
                Err(e) => return Err(TunnelError::Record(e)),
            }
        }
        self.session.last_tls_rehandshake = now;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Datagram channel -> tun (lifecycle dispatch)
    // ------------------------------------------------------------------

    fn pump_udp(&mut self, now: u64, tnow: Instant) -> Result<(), TunnelError> {
        match self.session.udp_state() {
            UdpState::Disabled | UdpState::WaitFd => Ok(()),
            UdpState::Setup => {
                datagram::setup_datagram(&mut self.session, self.dtls_factory.as_ref())
                    .map_err(TunnelError::Setup)?;
                // The first flight may already sit in the socket.
                self.drive_dtls_handshake(now)
            }
            UdpState::Handshake => self.drive_dtls_handshake(now),
            UdpState::Active | UdpState::Inactive => self.pump_dtls_data(now, tnow),
        }
    }

    fn drive_dtls_handshake(&mut self, now: u64) -> Result<(), TunnelError> {
        match datagram::drive_handshake(&mut self.session, &self.ctrl, self.dtls_mtu_cap)
            .map_err(TunnelError::Control)?
        {
            HandshakeProgress::InProgress => {}
            HandshakeProgress::Established(_) => {
                self.udp_recv_time = now;
                self.liveness.seen_udp(now);
            }
            HandshakeProgress::Disabled => self.deregister_udp(),
        }
        Ok(())
    }

    fn pump_dtls_data(&mut self, now: u64, tnow: Instant) -> Result<(), TunnelError> {
        loop {
            match self.session.recv_dtls() {
                Ok(0) => {
                    log::debug!("[DTLS] no data received");
                    return Ok(());
                }
                Ok(n) => {
                    log::debug!("[DTLS] received {} byte(s)", n);
                    // Any decrypted datagram revives an inactive channel.
                    self.udp_recv_time = now;
                    if self.session.udp_state() == UdpState::Inactive {
                        self.session.set_udp_state(UdpState::Active);
                    }
                    if !self.b_rx.allow(
                        n.saturating_sub(1),
                        self.session.mtu.conn_mtu(),
                        tnow,
                    ) {
                        continue;
                    }
                    let (ptype, payload) = match frame::decode_dtls(&self.session.buffer[..n]) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            // A decrypted but empty datagram; ignore it.
                            log::debug!("[DTLS] undecodable datagram: {}", e);
                            continue;
                        }
                    };
                    self.handle_frame(ptype, payload, ChannelSide::Datagram)?;
                    self.liveness.seen_udp(now);
                }
                Err(RecordError::WouldBlock) => return Ok(()),
                Err(RecordError::Interrupted) => continue,
                Err(RecordError::Rehandshake) => {
                    // AnyConnect never sets up DTLS renegotiation usably.
                    log::info!("[DTLS] client requested rehandshake on DTLS channel (!)");
                    if let Some(dtls) = self.session.dtls.as_mut() {
                        dtls.send_alert(Alert::NoRenegotiation, false)
                            .map_err(TunnelError::Record)?;
                    }
                    self.udp_recv_time = now;
                }
                Err(e) => return Err(TunnelError::Record(e)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Control socket
    // ------------------------------------------------------------------

    fn pump_ctrl(&mut self, now: u64, tnow: Instant) -> Result<(), TunnelError> {
        loop {
            let (cmd, fd) = match self.ctrl.try_recv().map_err(TunnelError::Control)? {
                Some(msg) => msg,
                None => return Ok(()),
            };
            match cmd {
                MainCmd::UdpFd => {
                    let Some(fd) = fd else {
                        log::warn!("[CTRL] UDP fd command without a descriptor");
                        continue;
                    };
                    match datagram::accept_udp_fd(&mut self.session, fd)
                        .map_err(TunnelError::Io)?
                    {
                        HandoverOutcome::Accepted(raw) => {
                            self.deregister_udp();
                            self.poll
                                .registry()
                                .register(&mut SourceFd(&raw), UDP_TOKEN, Interest::READABLE)
                                .map_err(TunnelError::Io)?;
                            self.udp_fd = Some(raw);
                            if let Some(sock) = &self.session.pending_udp_socket {
                                if self.cfg.output_buffer > 0 {
                                    sockopt::set_sndbuf(
                                        sock,
                                        self.session.mtu.conn_mtu(),
                                        self.cfg.output_buffer,
                                    );
                                }
                                sockopt::set_net_priority(sock, self.cfg.net_priority);
                            }
                            // The peer's first flight may already be
                            // queued on the socket.
                            self.pump_udp(now, tnow)?;
                        }
                        HandoverOutcome::Ignored => {}
                    }
                }
                other => log::debug!("[CTRL] ignoring {:?} in tunnel phase", other),
            }
        }
    }

    fn deregister_udp(&mut self) {
        if let Some(fd) = self.udp_fd.take() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    // ------------------------------------------------------------------
    // Frame dispatch
    // ------------------------------------------------------------------

    /// Classify and act on one decoded frame. `payload` indexes into the
    /// session buffer.
    fn handle_frame(
        &mut self,
        ptype: u8,
        payload: std::ops::Range<usize>,
        side: ChannelSide,
    ) -> Result<(), TunnelError> {
        match PacketType::from_wire(ptype) {
            Some(PacketType::Data) => {
                log::debug!("[TUNNEL] writing {} byte(s) to TUN", payload.len());
                self.tun
                    .write_packet(&self.session.buffer[payload])
                    .map_err(|e| {
                        log::error!("[TUN] could not write data: {}", e);
                        TunnelError::Io(e)
                    })?;
            }
            Some(PacketType::DpdOut) => match side {
                ChannelSide::Reliable => {
                    log::debug!("[DPD] received TLS DPD; sending response");
                    let resp = frame::cstp_dpd_response();
                    self.send_reliable(&resp)?;
                }
                ChannelSide::Datagram => {
                    // DPD doubles as an MTU probe on the datagram side.
                    log::debug!("[DPD] received DTLS DPD; sending response");
                    self.send_dtls_dpd_response()?;
                }
            },
            Some(PacketType::DpdResp) => log::debug!("[DPD] received DPD response"),
            Some(PacketType::Keepalive) => log::debug!("[DPD] received keepalive"),
            Some(PacketType::Disconnect) => {
                log::info!("[TUNNEL] received BYE packet; exiting");
                return Err(TunnelError::PeerBye);
            }
            Some(PacketType::TermServer) | None => {
                log::debug!("[TUNNEL] received unknown packet {}", ptype);
            }
        }
        Ok(())
    }

    fn send_dtls_dpd_response(&mut self) -> Result<(), TunnelError> {
        let resp = [PacketType::DpdResp.wire()];
        let result = match self.session.dtls.as_mut() {
            Some(dtls) => dtls.send(&resp),
            None => return Ok(()),
        };
        match result {
            Ok(_) => Ok(()),
            Err(RecordError::LargePacket) => {
                // Even a one-byte response can trip a shrunken path MTU.
                self.session
                    .mtu_not_ok(&self.ctrl)
                    .map_err(TunnelError::Control)?;
                if let Some(dtls) = self.session.dtls.as_mut() {
                    let _ = dtls.send(&resp);
                }
                Ok(())
            }
            Err(RecordError::WouldBlock | RecordError::Interrupted) => Ok(()),
            Err(e) => {
                log::error!("[DPD] could not send DTLS response: {}", e);
                Err(TunnelError::Record(e))
            }
        }
    }

    // ------------------------------------------------------------------
    // Reliable send helpers (any failure is fatal to the session)
    // ------------------------------------------------------------------

    fn send_reliable(&mut self, frame: &[u8]) -> Result<(), TunnelError> {
        crate::record::send_all(self.session.tls.as_mut(), frame).map_err(TunnelError::Record)
    }

    /// Send `buffer[..end]` on the reliable channel.
    fn send_reliable_buffer(&mut self, end: usize) -> Result<(), TunnelError> {
        let mut off = 0;
        while off < end {
            match self.session.tls.send(&self.session.buffer[off..end]) {
                Ok(0) => {
                    return Err(TunnelError::Record(RecordError::fatal(
                        "record layer accepted no bytes",
                    )))
                }
                Ok(n) => off += n,
                Err(RecordError::Interrupted) => continue,
                Err(e) => return Err(TunnelError::Record(e)),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
