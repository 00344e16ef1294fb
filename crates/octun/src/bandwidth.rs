// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Token-bucket rate limiting for tunnel traffic.
//!
//! One bucket per direction. The budget refills continuously at the
//! configured byte rate and is capped so bursts stay bounded; the cap
//! never drops below one full-size packet so a maximum-MTU frame can
//! always eventually pass. A denied packet is silently dropped - IP
//! tolerates loss and the peer's transport retransmits.

use std::time::Instant;

#[derive(Debug)]
pub struct Bandwidth {
    /// Bytes per second; 0 means unlimited.
    rate: u64,
    /// Current spendable budget in bytes.
    budget: u64,
    last_refill: Instant,
}

impl Bandwidth {
    pub fn new(rate_bytes_per_sec: u64, now: Instant) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            // Start with one second of credit so the first packets of a
            // session are never dropped.
            budget: rate_bytes_per_sec,
            last_refill: now,
        }
    }

    /// Whether a packet of `len` bytes may pass. Deducts from the budget
    /// on success. `conn_mtu` bounds the burst cap.
    pub fn allow(&mut self, len: usize, conn_mtu: u16, now: Instant) -> bool {
        if self.rate == 0 {
            return true;
        }

        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        if elapsed_us > 0 {
            let refill = self.rate.saturating_mul(elapsed_us) / 1_000_000;
            if refill > 0 {
                let cap = self.rate.max(conn_mtu as u64);
                self.budget = (self.budget + refill).min(cap);
                self.last_refill = now;
            }
        }

        let len = len as u64;
        if self.budget >= len {
            self.budget -= len;
            true
        } else {
            false
        }
    }
}
