// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker configuration - single source of truth for protocol constants.
//!
//! This module centralizes the wire-protocol constants of the CSTP/DTLS
//! tunnel and the per-worker runtime configuration handed down by the
//! supervising process. **Never hardcode these elsewhere!**

// =======================================================================
// Protocol timing (seconds)
// =======================================================================

/// Inactivity on the datagram channel after which a DATA frame observed on
/// the reliable channel demotes the datagram channel to Inactive.
pub const UDP_SWITCH_TIME: u64 = 15;

/// Minimum interval between periodic liveness/MSS checks.
pub const PERIODIC_CHECK_TIME: u64 = 30;

/// Number of DPD periods of silence before a probe is emitted.
pub const DPD_TRIES: u64 = 2;

/// Number of DPD periods of silence before the channel is declared dead.
pub const DPD_MAX_TRIES: u64 = 3;

/// Grace period between a termination signal and the SIGALRM hard exit.
pub const TERM_GRACE_SECS: u32 = 2;

/// Upper bound on waiting for handshake-phase bytes from the peer.
/// Mirrors the record layer's own default handshake timeout.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 40;

// =======================================================================
// HTTP handshake phase
// =======================================================================

/// HTTP requests accepted before the worker gives up on reaching the
/// tunneling phase.
pub const MAX_HTTP_REQUESTS: usize = 16;

/// The only URL a CONNECT request may carry.
pub const TUNNEL_URL: &str = "/CSCOSSLC/tunnel";

/// Cap applied to `X-CSTP-Hostname`.
pub const MAX_HOSTNAME_SIZE: usize = 64;

/// Cap applied to `User-Agent`.
pub const MAX_AGENT_SIZE: usize = 128;

// =======================================================================
// Session identifiers
// =======================================================================

/// Size of the decoded `webvpn=` session cookie.
pub const COOKIE_SIZE: usize = 16;

/// Size of the worker session id (`webvpncontext=` cookie, randomly
/// generated until the peer presents one).
pub const SID_SIZE: usize = 32;

/// Size of the DTLS session id announced as `X-DTLS-Session-ID`.
pub const SESSION_ID_SIZE: usize = 32;

/// Size of the DTLS premaster secret carried in `X-DTLS-Master-Secret`.
pub const MASTER_SECRET_SIZE: usize = 48;

// =======================================================================
// MTU model
// =======================================================================

/// Smallest usable tunnel MTU when the session carries IPv6.
pub const MIN_MTU_IPV6: u16 = 1281;

/// Smallest usable tunnel MTU for IPv4-only sessions.
pub const MIN_MTU_IPV4: u16 = 257;

/// CSTP frame header size on the reliable channel.
pub const CSTP_OVERHEAD: u16 = 8;

/// Frame header size on the datagram channel (the type byte).
pub const CSTP_DTLS_OVERHEAD: u16 = 1;

/// UDP header size, part of the datagram path overhead.
pub const UDP_OVERHEAD: u16 = 8;

/// IPv4 / IPv6 header sizes, part of the datagram path overhead.
pub const IPV4_OVERHEAD: u16 = 20;
pub const IPV6_OVERHEAD: u16 = 40;

/// Observed TCP option overhead subtracted from the kernel-reported MSS
/// before comparing it against the connection MTU.
pub const MSS_OPTION_SLACK: u16 = 13;

/// Initial I/O buffer size. Grown if the negotiated MTU plus overhead
/// exceeds it.
pub const INITIAL_BUFFER_SIZE: usize = 16 * 1024;

// =======================================================================
// Runtime configuration
// =======================================================================

/// Outgoing traffic priority for the tunnel sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetPriority {
    /// Leave the kernel defaults alone.
    #[default]
    Unset,
    /// Set `IP_TOS` to the given class.
    Tos(u8),
    /// Set `SO_PRIORITY` (1..=7).
    Priority(u8),
}

/// Per-worker runtime configuration.
///
/// Filled in by the supervising process before the worker starts; the
/// worker itself never re-reads configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Dead-peer-detection period in seconds.
    pub dpd: u64,
    /// Keepalive interval advertised to the peer (seconds).
    pub keepalive: u64,
    /// Session cookie validity (seconds); also drives the advertised
    /// rekey time and the minimum interval between rekeys.
    pub cookie_validity: u64,
    /// Seconds the peer has to reach the tunneling phase before the
    /// worker hard-exits. 0 disables the deadline.
    pub auth_timeout: u32,
    /// UDP port the server listens on for DTLS. 0 disables the datagram
    /// channel entirely.
    pub udp_port: u16,
    /// Overrides the provisioned link MTU when nonzero.
    pub default_mtu: u16,
    /// Advertised `X-CSTP-Default-Domain`.
    pub default_domain: Option<String>,
    /// Advertised `X-CSTP-Banner`.
    pub banner: Option<String>,
    /// Receive rate limit in bytes/second. 0 means unlimited.
    pub rx_per_sec: u64,
    /// Transmit rate limit in bytes/second. 0 means unlimited.
    pub tx_per_sec: u64,
    /// `SO_SNDBUF` multiplier (in MTUs) for the tunnel sockets. 0 leaves
    /// the kernel default.
    pub output_buffer: u32,
    /// Traffic priority for the tunnel sockets.
    pub net_priority: NetPriority,
    /// Whether to probe the datagram path MTU upward after successful
    /// full-size sends.
    pub try_mtu: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dpd: 60,
            keepalive: 300,
            cookie_validity: 43200,
            auth_timeout: 240,
            udp_port: 0,
            default_mtu: 0,
            default_domain: None,
            banner: None,
            rx_per_sec: 0,
            tx_per_sec: 0,
            output_buffer: 0,
            net_priority: NetPriority::Unset,
            try_mtu: true,
        }
    }
}

impl WorkerConfig {
    /// Rekey interval advertised in `X-CSTP-Rekey-Time` / `X-DTLS-Rekey-Time`.
    pub fn rekey_time(&self) -> u64 {
        2 * self.cookie_validity / 3
    }

    /// Minimum interval the worker tolerates between peer-initiated
    /// rekeys on the reliable channel.
    pub fn rekey_floor(&self) -> u64 {
        self.cookie_validity / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rekey_times_derive_from_cookie_validity() {
        let cfg = WorkerConfig {
            cookie_validity: 300,
            ..Default::default()
        };
        assert_eq!(cfg.rekey_time(), 200);
        assert_eq!(cfg.rekey_floor(), 100);
    }

    #[test]
    fn test_default_disables_udp() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.udp_port, 0);
        assert!(cfg.try_mtu);
    }
}
