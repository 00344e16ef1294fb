// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental request parsing on top of `httparse`.

use std::fmt;

use crate::ciphers::DtlsCipherSuite;
use crate::config::{COOKIE_SIZE, MASTER_SECRET_SIZE, SID_SIZE};

use super::headers;

/// Requests larger than this abort the session.
const MAX_REQUEST_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Connect,
    /// Anything else; answered with a refusal but parsed cleanly.
    Other(String),
}

/// One parsed request plus the handshake facts extracted from its
/// recognized headers.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub http_major: u8,
    pub http_minor: u8,
    pub body: Vec<u8>,

    pub cookie: Option<[u8; COOKIE_SIZE]>,
    pub context_sid: Option<[u8; SID_SIZE]>,
    pub master_secret: Option<[u8; MASTER_SECRET_SIZE]>,
    pub selected_ciphersuite: Option<&'static DtlsCipherSuite>,
    /// Peer-announced MTUs; 0 when absent.
    pub cstp_mtu: u16,
    pub dtls_mtu: u16,
    pub no_ipv4: bool,
    pub no_ipv6: bool,
    pub hostname: Option<String>,
    pub user_agent: Option<String>,
}

impl Default for Method {
    fn default() -> Self {
        Method::Other(String::new())
    }
}

#[derive(Debug)]
pub enum HttpError {
    /// The bytes on the wire are not an HTTP request.
    Malformed,
    /// Request exceeded [`MAX_REQUEST_SIZE`].
    TooLarge,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Malformed => write!(f, "malformed HTTP request"),
            HttpError::TooLarge => write!(f, "HTTP request too large"),
        }
    }
}

/// Accumulates wire bytes and yields complete requests.
#[derive(Default)]
pub struct RequestParser {
    buf: Vec<u8>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to produce one complete request (headers plus body). Returns
    /// `Ok(None)` until enough bytes arrived; consumed bytes are dropped
    /// so pipelined requests parse one at a time.
    pub fn try_parse(&mut self) -> Result<Option<HttpRequest>, HttpError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() > MAX_REQUEST_SIZE {
            return Err(HttpError::TooLarge);
        }

        let (mut request, header_len, content_length) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Request::new(&mut headers);
            let header_len = match parsed.parse(&self.buf) {
                Ok(httparse::Status::Complete(n)) => n,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(_) => return Err(HttpError::Malformed),
            };

            let mut request = HttpRequest {
                method: match parsed.method {
                    Some("GET") => Method::Get,
                    Some("POST") => Method::Post,
                    Some("CONNECT") => Method::Connect,
                    Some(other) => Method::Other(other.to_string()),
                    None => return Err(HttpError::Malformed),
                },
                url: parsed.path.ok_or(HttpError::Malformed)?.to_string(),
                http_major: 1,
                http_minor: parsed.version.ok_or(HttpError::Malformed)?,
                ..Default::default()
            };

            let mut content_length = 0usize;
            for h in parsed.headers.iter() {
                headers::apply(&mut request, h.name, h.value);
                // Framing headers are matched per RFC (case-insensitively),
                // unlike the recognized extraction headers above.
                if h.name.eq_ignore_ascii_case("Content-Length") {
                    content_length = std::str::from_utf8(h.value)
                        .ok()
                        .and_then(|v| v.trim().parse().ok())
                        .ok_or(HttpError::Malformed)?;
                }
            }
            (request, header_len, content_length)
        };

        if content_length > MAX_REQUEST_SIZE {
            return Err(HttpError::TooLarge);
        }
        let total = header_len + content_length;
        if self.buf.len() < total {
            return Ok(None);
        }

        request.body = self.buf[header_len..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(request))
    }
}
