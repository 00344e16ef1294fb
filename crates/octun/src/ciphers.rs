// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram cipher suite table.
//!
//! AnyConnect peers advertise the DTLS suites they accept as a
//! colon-separated list of legacy names in `X-DTLS-CipherSuite`; the server
//! picks the entry with the highest `server_prio` and seeds the datagram
//! record layer with its parameters. The table is static and a selected
//! entry stays immutable for the whole session.
//
// Consider a perfect-hash table if this grows significantly.

/// DTLS protocol version expected by the record layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsProto {
    /// The pre-standard DTLS 0.9 used by legacy AnyConnect suites.
    Dtls0_9,
    Dtls1_2,
}

/// Bulk cipher of a suite, named for the record-layer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsCipher {
    Aes128Gcm,
    Aes256Gcm,
    Aes128Cbc,
    TripleDesCbc,
}

/// MAC algorithm of a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsMac {
    /// AEAD suites carry no separate MAC.
    Aead,
    Sha1,
}

/// One row of the datagram cipher suite table.
#[derive(Debug)]
pub struct DtlsCipherSuite {
    /// Wire-visible legacy name.
    pub oc_name: &'static str,
    pub proto: DtlsProto,
    pub cipher: DtlsCipher,
    pub mac: DtlsMac,
    /// Server-side preference; higher wins.
    pub server_prio: u8,
}

impl DtlsCipherSuite {
    /// Nominal per-record overhead (record header, IV/nonce, tag or MAC
    /// plus worst-case padding) used for header math before the datagram
    /// record layer exists. The record layer's own figure, where
    /// available, takes precedence.
    pub fn nominal_record_overhead(&self) -> u16 {
        match (self.cipher, self.mac) {
            // 13 record header + 8 explicit nonce + 16 tag
            (DtlsCipher::Aes128Gcm | DtlsCipher::Aes256Gcm, _) => 37,
            // 13 record header + 16 IV + 20 MAC + up to 16 padding
            (DtlsCipher::Aes128Cbc, DtlsMac::Sha1) => 65,
            // 13 record header + 8 IV + 20 MAC + up to 8 padding
            (DtlsCipher::TripleDesCbc, _) => 49,
            (DtlsCipher::Aes128Cbc, DtlsMac::Aead) => 37,
        }
    }
}

/// The suites this server offers, strongest preference first.
pub static DTLS_CIPHERSUITES: [DtlsCipherSuite; 4] = [
    DtlsCipherSuite {
        oc_name: "OC-DTLS1_2-AES128-GCM",
        proto: DtlsProto::Dtls1_2,
        cipher: DtlsCipher::Aes128Gcm,
        mac: DtlsMac::Aead,
        server_prio: 90,
    },
    DtlsCipherSuite {
        oc_name: "OC-DTLS1_2-AES256-GCM",
        proto: DtlsProto::Dtls1_2,
        cipher: DtlsCipher::Aes256Gcm,
        mac: DtlsMac::Aead,
        server_prio: 80,
    },
    DtlsCipherSuite {
        oc_name: "AES128-SHA",
        proto: DtlsProto::Dtls0_9,
        cipher: DtlsCipher::Aes128Cbc,
        mac: DtlsMac::Sha1,
        server_prio: 50,
    },
    DtlsCipherSuite {
        oc_name: "DES-CBC3-SHA",
        proto: DtlsProto::Dtls0_9,
        cipher: DtlsCipher::TripleDesCbc,
        mac: DtlsMac::Sha1,
        server_prio: 1,
    },
];

/// Pick the highest-priority suite whose name appears in the peer's
/// colon-separated offer. Unknown names are skipped.
pub fn select_ciphersuite(offered: &str) -> Option<&'static DtlsCipherSuite> {
    let mut best: Option<&'static DtlsCipherSuite> = None;
    for token in offered.split(':') {
        for suite in &DTLS_CIPHERSUITES {
            if token == suite.oc_name
                && best.map_or(true, |b| b.server_prio < suite.server_prio)
            {
                best = Some(suite);
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_highest_priority() {
        let suite = select_ciphersuite("DES-CBC3-SHA:OC-DTLS1_2-AES256-GCM:AES128-SHA").unwrap();
        assert_eq!(suite.oc_name, "OC-DTLS1_2-AES256-GCM");
    }

    #[test]
    fn test_select_prefers_aes128_gcm() {
        let suite =
            select_ciphersuite("OC-DTLS1_2-AES128-GCM:OC-DTLS1_2-AES256-GCM").unwrap();
        assert_eq!(suite.oc_name, "OC-DTLS1_2-AES128-GCM");
        assert_eq!(suite.server_prio, 90);
    }

    #[test]
    fn test_select_skips_unknown_names() {
        let suite = select_ciphersuite("X-UNKNOWN:AES128-SHA:ALSO-UNKNOWN").unwrap();
        assert_eq!(suite.oc_name, "AES128-SHA");
        assert!(select_ciphersuite("X-UNKNOWN").is_none());
        assert!(select_ciphersuite("").is_none());
    }

    #[test]
    fn test_exact_name_match_only() {
        // Prefix or case variants must not match.
        assert!(select_ciphersuite("AES128-SHA1").is_none());
        assert!(select_ciphersuite("aes128-sha").is_none());
    }

    #[test]
    fn test_overhead_below_cbc_overhead() {
        let gcm = &DTLS_CIPHERSUITES[0];
        let cbc = &DTLS_CIPHERSUITES[2];
        assert!(gcm.nominal_record_overhead() < cbc.nominal_record_overhead());
    }
}
