// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP handshake phase.
//!
//! Before tunneling, the peer speaks HTTP/1.x over the reliable channel:
//! a handful of GET/POST requests against the auth collaborator and
//! finally `CONNECT /CSCOSSLC/tunnel`. This module parses those requests
//! incrementally (raw bytes in, [`HttpRequest`] out) and extracts the
//! handshake facts the tunnel engine consumes: session cookies, the DTLS
//! premaster secret, the offered datagram ciphersuites, MTU hints and
//! address-family restrictions.
//!
//! Header names are compared case-sensitively, as the AnyConnect client
//! emits them canonically and the original server did the same.

mod headers;
mod request;

pub use request::{HttpError, HttpRequest, Method, RequestParser};
