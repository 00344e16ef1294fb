// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker entry point: the pre-tunnel HTTP phase.
//!
//! The supervising process accepts the TCP connection, drops privileges,
//! forks and hands this worker the connection, the control socket and the
//! provisioned tun device. The worker drives the reliable-channel
//! handshake, serves a bounded number of HTTP requests (auth pages are
//! the auth collaborator's business), and on `CONNECT /CSCOSSLC/tunnel`
//! hands over to the tunnel engine. It never returns success: a worker
//! lives exactly as long as its session.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::os::fd::RawFd;

use crate::config::{WorkerConfig, HANDSHAKE_TIMEOUT_SECS, MAX_HTTP_REQUESTS, TUNNEL_URL};
use crate::ctrl::ControlChannel;
use crate::http::{HttpError, HttpRequest, Method, RequestParser};
use crate::net::{AddrFamily, NetworkInfo};
use crate::record::{send_all, Alert, DatagramFactory, RecordChannel, RecordError, RecordResult};
use crate::session::{AuthState, Session};
use crate::signal;
use crate::tun::TunDevice;
use crate::tunnel::{EstablishError, Tunnel, TunnelError};

// ============================================================================
// Auth collaborator contract
// ============================================================================

/// What an auth handler decided about the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Keep serving requests on this connection.
    Continue,
    /// Close the connection.
    Close,
}

/// The auth collaborator: serves the interactive authentication URLs
/// (`/` and `/auth`) and tracks whether this session authenticated
/// interactively. Cookie verification is not its job - that goes through
/// the parent via the control socket.
pub trait AuthHandler {
    fn handle_get(
        &mut self,
        req: &HttpRequest,
        ch: &mut dyn RecordChannel,
    ) -> RecordResult<HandlerOutcome>;

    fn handle_post(
        &mut self,
        req: &HttpRequest,
        ch: &mut dyn RecordChannel,
    ) -> RecordResult<HandlerOutcome>;

    /// Whether interactive authentication completed on this connection.
    fn auth_state(&self) -> AuthState {
        AuthState::Incomplete
    }
}

/// Deployment without web-form authentication: clients re-enter sessions
/// with cookies only, the auth URLs answer 404.
pub struct CookieOnlyAuth;

impl AuthHandler for CookieOnlyAuth {
    fn handle_get(
        &mut self,
        _req: &HttpRequest,
        ch: &mut dyn RecordChannel,
    ) -> RecordResult<HandlerOutcome> {
        send_all(ch, b"HTTP/1.1 404 Not found\r\n\r\n")?;
        Ok(HandlerOutcome::Continue)
    }

    fn handle_post(
        &mut self,
        _req: &HttpRequest,
        ch: &mut dyn RecordChannel,
    ) -> RecordResult<HandlerOutcome> {
        send_all(ch, b"HTTP/1.1 404 Not found\r\n\r\n")?;
        Ok(HandlerOutcome::Continue)
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Why the worker exited. Always maps to a nonzero exit code; zero is
/// not used, the worker is terminated by the parent or by failure.
#[derive(Debug)]
pub enum WorkerError {
    Io(io::Error),
    Record(RecordError),
    Http(HttpError),
    /// The connection ended cleanly (peer closed, or we closed after a
    /// refusal or an HTTP/1.0 exchange).
    Closed,
    /// The peer burned through its HTTP request budget.
    TooManyRequests,
    /// Missing or failed authentication on CONNECT.
    AccessDenied,
    /// Server-side configuration prevents tunneling; 503 already sent.
    Config(&'static str),
    /// The peer went silent during the handshake phase.
    Timeout,
    Establish(EstablishError),
    Tunnel(TunnelError),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Io(e) => write!(f, "I/O error: {}", e),
            WorkerError::Record(e) => write!(f, "record layer: {}", e),
            WorkerError::Http(e) => write!(f, "HTTP: {}", e),
            WorkerError::Closed => write!(f, "connection closed"),
            WorkerError::TooManyRequests => write!(f, "too many HTTP requests"),
            WorkerError::AccessDenied => write!(f, "access denied"),
            WorkerError::Config(what) => write!(f, "configuration error: {}", what),
            WorkerError::Timeout => write!(f, "handshake phase timed out"),
            WorkerError::Establish(e) => write!(f, "tunnel establishment: {}", e),
            WorkerError::Tunnel(e) => write!(f, "{}", e),
        }
    }
}

impl WorkerError {
    /// Exit code for the supervising process. Never zero.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Everything the parent provisions before the worker starts.
pub struct WorkerInit {
    pub cfg: WorkerConfig,
    /// Reliable record channel over the accepted connection, handshake
    /// not yet driven.
    pub tls: Box<dyn RecordChannel>,
    /// Raw fd of the reliable socket for readiness waits and MSS
    /// queries; `None` for socketless record layers.
    pub conn_fd: Option<RawFd>,
    pub family: AddrFamily,
    pub vinfo: NetworkInfo,
    pub ctrl: ControlChannel,
    pub tun: TunDevice,
    pub dtls_factory: Box<dyn DatagramFactory>,
    pub auth: Box<dyn AuthHandler>,
}

/// Run one worker to completion. Never returns success.
pub fn run(init: WorkerInit) -> WorkerError {
    match run_inner(init) {
        Ok(never) => match never {},
        Err(e) => {
            log::info!("[WORKER] exiting: {}", e);
            e
        }
    }
}

fn run_inner(init: WorkerInit) -> Result<Infallible, WorkerError> {
    let WorkerInit {
        cfg,
        tls,
        conn_fd,
        family,
        vinfo,
        ctrl,
        tun,
        dtls_factory,
        mut auth,
    } = init;

    signal::install_handlers().map_err(WorkerError::Io)?;
    signal::arm_auth_timeout(cfg.auth_timeout);

    let mut session = Session::new(family, tls, vinfo).map_err(WorkerError::Io)?;
    log::info!("[WORKER] accepted connection");

    // Reliable-channel handshake before anything else.
    loop {
        match session.tls.handshake() {
            Ok(()) => break,
            Err(RecordError::WouldBlock) => wait_readable(conn_fd)?,
            Err(RecordError::Interrupted) => continue,
            Err(e) => return Err(WorkerError::Record(e)),
        }
    }
    log::debug!("[WORKER] TLS handshake completed");

    let mut parser = RequestParser::new();
    for _ in 0..MAX_HTTP_REQUESTS {
        let req = read_request(&mut session, &mut parser, conn_fd)?;
        let keep_alive = req.http_minor != 0;
        let method = req.method.clone();

        match method {
            Method::Get => {
                log::debug!("[HTTP] GET {}", req.url);
                if is_auth_url(&req.url) {
                    let outcome = auth
                        .handle_get(&req, session.tls.as_mut())
                        .map_err(WorkerError::Record)?;
                    if outcome == HandlerOutcome::Continue && keep_alive {
                        continue;
                    }
                    return finish(&mut session);
                }
                log::info!("[HTTP] unexpected URL {}", req.url);
                let _ = send_all(session.tls.as_mut(), b"HTTP/1.1 404 Not found\r\n\r\n");
                return finish(&mut session);
            }
            Method::Post => {
                log::debug!("[HTTP] POST {}", req.url);
                if is_auth_url(&req.url) {
                    let outcome = auth
                        .handle_post(&req, session.tls.as_mut())
                        .map_err(WorkerError::Record)?;
                    if outcome == HandlerOutcome::Continue && keep_alive {
                        continue;
                    }
                    return finish(&mut session);
                }
                log::info!("[HTTP] unexpected POST URL {}", req.url);
                let _ = send_all(session.tls.as_mut(), b"HTTP/1.1 404 Not found\r\n\r\n");
                return finish(&mut session);
            }
            Method::Connect => {
                log::debug!("[HTTP] CONNECT {}", req.url);
                let auth_state = auth.auth_state();
                return connect_handler(
                    cfg,
                    session,
                    ctrl,
                    tun,
                    conn_fd,
                    dtls_factory,
                    auth_state,
                    req,
                );
            }
            Method::Other(name) => {
                log::info!("[HTTP] unexpected HTTP method {}", name);
                let refusal = format!("HTTP/1.{} 404 Nah, go away\r\n\r\n", req.http_minor);
                let _ = send_all(session.tls.as_mut(), refusal.as_bytes());
                return finish(&mut session);
            }
        }
    }

    log::info!("[HTTP] maximum number of HTTP requests reached");
    Err(WorkerError::TooManyRequests)
}

/// The tunneling phase, entered on CONNECT.
#[allow(clippy::too_many_arguments)]
fn connect_handler(
    cfg: WorkerConfig,
    mut session: Session,
    ctrl: ControlChannel,
    tun: TunDevice,
    conn_fd: Option<RawFd>,
    dtls_factory: Box<dyn DatagramFactory>,
    auth_state: AuthState,
    req: HttpRequest,
) -> Result<Infallible, WorkerError> {
    if let Some(sid) = req.context_sid {
        session.sid = sid;
    }
    session.auth_state = auth_state;

    // Without interactive auth the cookie is the only way in.
    if session.auth_state != AuthState::Complete {
        let Some(cookie) = req.cookie else {
            log::info!("[HTTP] connect request without authentication");
            return deny(&mut session);
        };
        match ctrl.verify_cookie(cookie, session.sid) {
            Ok(true) => session.auth_state = AuthState::Complete,
            Ok(false) => {
                log::info!("[HTTP] failed cookie authentication attempt");
                return deny(&mut session);
            }
            Err(e) => return Err(WorkerError::Io(e)),
        }
    }

    if req.url != TUNNEL_URL {
        log::info!("[HTTP] bad connect request: '{}'", req.url);
        let _ = send_all(session.tls.as_mut(), b"HTTP/1.1 404 Nah, go away\r\n\r\n");
        session.tls.send_alert(Alert::AccessDenied, true).ok();
        return Err(WorkerError::AccessDenied);
    }

    if session.vinfo.is_empty() {
        log::error!("[WORKER] no networks are configured; rejecting client");
        let _ = send_all(
            session.tls.as_mut(),
            b"HTTP/1.1 503 Service Unavailable\r\n\
              X-Reason: Server configuration error\r\n\r\n",
        );
        return Err(WorkerError::Config("no networks configured"));
    }

    // Connected; the auth deadline no longer applies.
    signal::clear_alarm();

    let tunnel = Tunnel::establish(cfg, session, ctrl, tun, conn_fd, dtls_factory, &req)
        .map_err(WorkerError::Establish)?;
    Err(WorkerError::Tunnel(tunnel.run()))
}

fn deny(session: &mut Session) -> Result<Infallible, WorkerError> {
    let _ = send_all(
        session.tls.as_mut(),
        b"HTTP/1.1 503 Service Unavailable\r\n\r\n",
    );
    session.tls.send_alert(Alert::AccessDenied, true).ok();
    Err(WorkerError::AccessDenied)
}

fn finish(session: &mut Session) -> Result<Infallible, WorkerError> {
    session.tls.close();
    Err(WorkerError::Closed)
}

fn is_auth_url(url: &str) -> bool {
    url == "/" || url == "/auth"
}

/// Pull bytes until the parser yields one complete request.
fn read_request(
    session: &mut Session,
    parser: &mut RequestParser,
    conn_fd: Option<RawFd>,
) -> Result<HttpRequest, WorkerError> {
    loop {
        if let Some(req) = parser.try_parse().map_err(WorkerError::Http)? {
            return Ok(req);
        }
        let mut chunk = [0u8; 2048];
        match session.tls.recv(&mut chunk) {
            Ok(0) => return Err(WorkerError::Closed),
            Ok(n) => parser.feed(&chunk[..n]),
            Err(RecordError::WouldBlock) => wait_readable(conn_fd)?,
            Err(RecordError::Interrupted) => continue,
            Err(e) => {
                log::info!("[HTTP] error receiving client data: {}", e);
                return Err(WorkerError::Record(e));
            }
        }
    }
}

/// Wait for the reliable socket to become readable, bounded by the
/// handshake timeout. A record layer without a socket has nothing to
/// wait on - starving it is an error, not a hang.
fn wait_readable(conn_fd: Option<RawFd>) -> Result<(), WorkerError> {
    let Some(fd) = conn_fd else {
        return Err(WorkerError::Record(RecordError::fatal(
            "record layer starved with no socket to wait on",
        )));
    };
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = (HANDSHAKE_TIMEOUT_SECS * 1000) as libc::c_int;
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(());
        }
        return Err(WorkerError::Io(err));
    }
    if rc == 0 {
        return Err(WorkerError::Timeout);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COOKIE_SIZE;
    use crate::ctrl::{decode_worker_msg, MainCmd, WorkerMsg, MAX_CTRL_MSG};
    use crate::frame::{self, PacketType};
    use crate::record::mem::{MemoryChannel, MemoryFactory, MemoryPeer};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    struct TestRig {
        init: WorkerInit,
        tls_peer: MemoryPeer,
        parent_ctrl: ControlChannel,
        _tun_peer: OwnedFd,
    }

    fn rig(vinfo: NetworkInfo) -> TestRig {
        let (tls, tls_peer) = MemoryChannel::pair();
        let (worker_ctrl, parent_ctrl) = ControlChannel::pair().unwrap();

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        let tun = unsafe { TunDevice::from_raw_fd(fds[0]) };
        let tun_peer = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let init = WorkerInit {
            cfg: WorkerConfig {
                auth_timeout: 0, // no alarms inside the test binary
                ..Default::default()
            },
            tls: Box::new(tls),
            conn_fd: None,
            family: AddrFamily::V4,
            vinfo,
            ctrl: worker_ctrl,
            tun,
            dtls_factory: Box::new(MemoryFactory::empty()),
            auth: Box::new(CookieOnlyAuth),
        };

        TestRig {
            init,
            tls_peer,
            parent_ctrl,
            _tun_peer: tun_peer,
        }
    }

    fn basic_vinfo() -> NetworkInfo {
        NetworkInfo {
            ipv4: Some("192.0.2.10".to_string()),
            mtu: 1500,
            ..Default::default()
        }
    }

    fn cookie_header() -> String {
        format!("Cookie: webvpn={}\r\n", STANDARD.encode([0xAA; COOKIE_SIZE]))
    }

    fn sent_text(peer: &MemoryPeer) -> String {
        String::from_utf8_lossy(&peer.take_sent().concat()).to_string()
    }

    fn parent_msgs(parent: &ControlChannel) -> Vec<WorkerMsg> {
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

    #[test]
    fn test_full_connect_flow() {
        // The tunnel loop reads the process-global terminate flag.
        let _guard = crate::signal::TEST_LOCK.lock().unwrap();
        let r = rig(basic_vinfo());
        r.tls_peer.push_frame(
            format!(
                "CONNECT /CSCOSSLC/tunnel HTTP/1.1\r\n{}\r\n",
                cookie_header()
            )
            .into_bytes(),
        );
        // The tunnel phase finds a BYE waiting and exits cleanly.
        let mut bye = Vec::new();
        frame::encode_cstp(PacketType::Disconnect, &[], &mut bye);
        r.tls_peer.push_frame(bye);
        r.parent_ctrl
            .send_cmd(&MainCmd::CookieReply { ok: true }, None)
            .unwrap();

        let err = run(r.init);
        assert!(matches!(err, WorkerError::Tunnel(TunnelError::PeerBye)));

        let response = sent_text(&r.tls_peer);
        assert!(response.contains("HTTP/1.1 200 CONNECTED\r\n"));
        assert!(response.contains("X-CSTP-Address: 192.0.2.10\r\n"));

        let msgs = parent_msgs(&r.parent_ctrl);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, WorkerMsg::CookieVerify { .. })));
        assert!(msgs.iter().any(|m| matches!(m, WorkerMsg::TunMtu { .. })));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, WorkerMsg::SessionInfo { .. })));
    }

    #[test]
    fn test_connect_without_cookie_denied() {
        let r = rig(basic_vinfo());
        r.tls_peer
            .push_frame(b"CONNECT /CSCOSSLC/tunnel HTTP/1.1\r\n\r\n".to_vec());

        let err = run(r.init);
        assert!(matches!(err, WorkerError::AccessDenied));
        assert!(sent_text(&r.tls_peer).starts_with("HTTP/1.1 503"));
        assert_eq!(r.tls_peer.alerts(), vec![(Alert::AccessDenied, true)]);
    }

    #[test]
    fn test_failed_cookie_verification_denied() {
        let r = rig(basic_vinfo());
        r.tls_peer.push_frame(
            format!(
                "CONNECT /CSCOSSLC/tunnel HTTP/1.1\r\n{}\r\n",
                cookie_header()
            )
            .into_bytes(),
        );
        r.parent_ctrl
            .send_cmd(&MainCmd::CookieReply { ok: false }, None)
            .unwrap();

        let err = run(r.init);
        assert!(matches!(err, WorkerError::AccessDenied));
    }

    #[test]
    fn test_connect_wrong_url_refused() {
        let r = rig(basic_vinfo());
        r.tls_peer.push_frame(
            format!("CONNECT /elsewhere HTTP/1.1\r\n{}\r\n", cookie_header()).into_bytes(),
        );
        r.parent_ctrl
            .send_cmd(&MainCmd::CookieReply { ok: true }, None)
            .unwrap();

        let err = run(r.init);
        assert!(matches!(err, WorkerError::AccessDenied));
        assert!(sent_text(&r.tls_peer).contains("404"));
    }

    #[test]
    fn test_no_network_is_config_error() {
        let r = rig(NetworkInfo::default());
        r.tls_peer.push_frame(
            format!(
                "CONNECT /CSCOSSLC/tunnel HTTP/1.1\r\n{}\r\n",
                cookie_header()
            )
            .into_bytes(),
        );
        r.parent_ctrl
            .send_cmd(&MainCmd::CookieReply { ok: true }, None)
            .unwrap();

        let err = run(r.init);
        assert!(matches!(err, WorkerError::Config(_)));
        let response = sent_text(&r.tls_peer);
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains("X-Reason: Server configuration error"));
    }

    #[test]
    fn test_unknown_url_gets_404_and_close() {
        let r = rig(basic_vinfo());
        r.tls_peer
            .push_frame(b"GET /favicon.ico HTTP/1.1\r\n\r\n".to_vec());

        let err = run(r.init);
        assert!(matches!(err, WorkerError::Closed));
        assert!(sent_text(&r.tls_peer).contains("404 Not found"));
        assert!(r.tls_peer.worker_closed());
    }

    #[test]
    fn test_unknown_method_refused() {
        let r = rig(basic_vinfo());
        r.tls_peer
            .push_frame(b"DELETE / HTTP/1.1\r\n\r\n".to_vec());

        let err = run(r.init);
        assert!(matches!(err, WorkerError::Closed));
        assert!(sent_text(&r.tls_peer).contains("Nah, go away"));
    }

    #[test]
    fn test_request_budget_enforced() {
        let r = rig(basic_vinfo());
        for _ in 0..MAX_HTTP_REQUESTS {
            r.tls_peer.push_frame(b"GET / HTTP/1.1\r\n\r\n".to_vec());
        }

        let err = run(r.init);
        assert!(matches!(err, WorkerError::TooManyRequests));
        // Every request got its auth-handler answer.
        let text = sent_text(&r.tls_peer);
        assert_eq!(text.matches("404 Not found").count(), MAX_HTTP_REQUESTS);
    }

    #[test]
    fn test_http10_closes_after_one_exchange() {
        let r = rig(basic_vinfo());
        r.tls_peer.push_frame(b"GET / HTTP/1.0\r\n\r\n".to_vec());

        let err = run(r.init);
        assert!(matches!(err, WorkerError::Closed));
        assert!(r.tls_peer.worker_closed());
    }

    #[test]
    fn test_starved_memory_channel_errors_out() {
        let r = rig(basic_vinfo());
        // No request bytes at all: the phase must fail, not hang.
        let err = run(r.init);
        assert!(matches!(err, WorkerError::Record(_)));
    }
}
