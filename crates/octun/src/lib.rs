// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! octun - per-connection worker for an AnyConnect/OpenConnect-compatible
//! SSL VPN server.
//!
//! The supervising process accepts the TCP connection, forks, drops
//! privileges and hands the worker its connection, the provisioned tun
//! device and a control socket. From there this crate owns the session:
//!
//! - the HTTP handshake phase ([`worker`], [`http`]): a bounded number of
//!   GET/POST requests, then `CONNECT /CSCOSSLC/tunnel`;
//! - the dual-channel tunnel engine ([`tunnel`]): a reliable CSTP channel
//!   over TLS and an opportunistic DTLS datagram channel for the same
//!   logical session, with transparent failover between them;
//! - active path-MTU discovery on the datagram channel ([`mtu`]);
//! - dead-peer detection on both channels independently ([`liveness`]);
//! - the datagram channel lifecycle, including mid-session rebirth from a
//!   fresh UDP fd handover ([`datagram`], [`session`]);
//! - bidirectional token-bucket rate limiting ([`bandwidth`]).
//!
//! Cryptography stays behind the record-layer contract in [`record`]; a
//! rustls-backed reliable channel ships behind the `tls` feature.

pub mod bandwidth;
pub mod ciphers;
pub mod config;
pub mod ctrl;
pub mod datagram;
pub mod frame;
pub mod http;
pub mod liveness;
pub mod mtu;
pub mod net;
pub mod record;
pub mod session;
pub mod signal;
pub mod sockopt;
pub mod tun;
pub mod tunnel;
pub mod worker;

pub use config::WorkerConfig;
pub use session::{Session, UdpState};
pub use tunnel::{Tunnel, TunnelError};
pub use worker::{run, AuthHandler, WorkerError, WorkerInit};
