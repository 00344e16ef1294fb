// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recognized-header extraction.
//!
//! A flat name-to-action table over the handshake headers the engine
//! consumes. Unrecognized headers are ignored; malformed values of
//! recognized headers degrade to "absent" rather than failing the
//! request, matching what deployed AnyConnect clients get away with.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::ciphers::select_ciphersuite;
use crate::config::{
    COOKIE_SIZE, MASTER_SECRET_SIZE, MAX_AGENT_SIZE, MAX_HOSTNAME_SIZE, SID_SIZE,
};

use super::request::HttpRequest;

/// Dispatch one header into the request's extracted facts. Names are
/// compared case-sensitively.
pub(crate) fn apply(req: &mut HttpRequest, name: &str, value: &[u8]) {
    match name {
        "Cookie" => parse_cookie(req, value),
        "X-DTLS-Master-Secret" => {
            req.master_secret = parse_master_secret(value);
            if req.master_secret.is_none() {
                log::debug!("[HTTP] discarding short or malformed master secret");
            }
        }
        "X-DTLS-CipherSuite" => {
            if let Ok(v) = std::str::from_utf8(value) {
                req.selected_ciphersuite = select_ciphersuite(v);
            }
        }
        "X-DTLS-MTU" => req.dtls_mtu = parse_mtu(value),
        "X-CSTP-MTU" => req.cstp_mtu = parse_mtu(value),
        "X-CSTP-Address-Type" => {
            let v = String::from_utf8_lossy(value);
            req.no_ipv4 = !v.contains("IPv4");
            req.no_ipv6 = !v.contains("IPv6");
        }
        "X-CSTP-Hostname" => req.hostname = capped_string(value, MAX_HOSTNAME_SIZE),
        "User-Agent" => req.user_agent = capped_string(value, MAX_AGENT_SIZE),
        _ => {}
    }
}

fn parse_mtu(value: &[u8]) -> u16 {
    std::str::from_utf8(value)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn capped_string(value: &[u8], cap: usize) -> Option<String> {
    if value.is_empty() || value.len() > cap {
        return None;
    }
    std::str::from_utf8(value).ok().map(str::to_string)
}

fn parse_master_secret(value: &[u8]) -> Option<[u8; MASTER_SECRET_SIZE]> {
    // At least 96 hex characters; extra characters are ignored.
    if value.len() < MASTER_SECRET_SIZE * 2 {
        return None;
    }
    let decoded = hex::decode(&value[..MASTER_SECRET_SIZE * 2]).ok()?;
    let mut secret = [0u8; MASTER_SECRET_SIZE];
    secret.copy_from_slice(&decoded);
    Some(secret)
}

/// `Cookie` is semicolon-separated; only the `webvpn` and
/// `webvpncontext` items matter, both base64 with exact decoded sizes.
fn parse_cookie(req: &mut HttpRequest, value: &[u8]) {
    let Ok(value) = std::str::from_utf8(value) else {
        return;
    };
    for item in value.split(';') {
        let item = item.trim();
        if let Some(b64) = item.strip_prefix("webvpn=") {
            match BASE64.decode(b64.trim_end()) {
                Ok(decoded) if decoded.len() == COOKIE_SIZE => {
                    let mut cookie = [0u8; COOKIE_SIZE];
                    cookie.copy_from_slice(&decoded);
                    req.cookie = Some(cookie);
                }
                _ => log::debug!("[HTTP] could not decode webvpn cookie"),
            }
        } else if let Some(b64) = item.strip_prefix("webvpncontext=") {
            match BASE64.decode(b64.trim_end()) {
                Ok(decoded) if decoded.len() == SID_SIZE => {
                    let mut sid = [0u8; SID_SIZE];
                    sid.copy_from_slice(&decoded);
                    req.context_sid = Some(sid);
                }
                _ => log::debug!("[HTTP] could not decode webvpncontext cookie"),
            }
        }
    }
}
