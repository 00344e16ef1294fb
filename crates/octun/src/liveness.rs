// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dead-peer detection for both tunnel channels.
//!
//! Every successfully decoded frame counts as liveness evidence for its
//! channel, whatever its type. The periodic check (rate-limited to one run
//! per [`PERIODIC_CHECK_TIME`]) escalates per channel:
//!
//! ```text
//!   silence > 2*dpd   -> emit a DPD probe on that channel
//!   silence > 3*dpd   -> datagram channel: demote to Inactive
//!                        reliable channel: tear the session down
//! ```
//!
//! The monitor only decides; the tunnel loop sends the probes and applies
//! the state changes.

use std::sync::OnceLock;
use std::time::Instant;

use crate::config::{DPD_MAX_TRIES, DPD_TRIES, PERIODIC_CHECK_TIME};

/// Monotonic seconds since the first call in this process. Wall-clock
/// jumps must not trip DPD.
pub fn monotonic_secs() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs()
}

/// What the periodic check asks the tunnel loop to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DpdActions {
    /// Send a DPD probe on the datagram channel.
    pub probe_udp: bool,
    /// Declare the datagram channel dead (demote to Inactive).
    pub udp_dead: bool,
    /// Send a DPD probe on the reliable channel.
    pub probe_tcp: bool,
    /// The peer is gone; tear the session down.
    pub tcp_dead: bool,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    dpd: u64,
    last_msg_tcp: u64,
    last_msg_udp: u64,
    last_check: u64,
}

impl LivenessMonitor {
    pub fn new(dpd: u64, now: u64) -> Self {
        Self {
            dpd,
            last_msg_tcp: now,
            last_msg_udp: now,
            last_check: now,
        }
    }

    /// Record a decoded frame on the reliable channel.
    pub fn seen_tcp(&mut self, now: u64) {
        self.last_msg_tcp = self.last_msg_tcp.max(now);
    }

    /// Record a decoded frame on the datagram channel.
    pub fn seen_udp(&mut self, now: u64) {
        self.last_msg_udp = self.last_msg_udp.max(now);
    }

    pub fn last_msg_tcp(&self) -> u64 {
        self.last_msg_tcp
    }

    pub fn last_msg_udp(&self) -> u64 {
        self.last_msg_udp
    }

    /// Run the escalation ladder if the periodic interval elapsed.
    /// `udp_active` gates the datagram side: only an Active channel is
    /// probed.
    pub fn check(&mut self, now: u64, udp_active: bool) -> Option<DpdActions> {
        if now.saturating_sub(self.last_check) < PERIODIC_CHECK_TIME {
            return None;
        }
        self.last_check = now;

        let mut actions = DpdActions::default();

        if udp_active {
            let silence = now.saturating_sub(self.last_msg_udp);
            if silence > DPD_TRIES * self.dpd {
                actions.probe_udp = true;
                if silence > DPD_MAX_TRIES * self.dpd {
                    actions.udp_dead = true;
                }
            }
        }

        let silence = now.saturating_sub(self.last_msg_tcp);
        if silence > DPD_TRIES * self.dpd {
            actions.probe_tcp = true;
            if silence > DPD_MAX_TRIES * self.dpd {
                actions.tcp_dead = true;
            }
        }

        Some(actions)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DPD: u64 = 40;

    #[test]
    fn test_quiet_channels_produce_no_actions() {
        let mut mon = LivenessMonitor::new(DPD, 0);
        let actions = mon.check(PERIODIC_CHECK_TIME, true).unwrap();
        assert_eq!(actions, DpdActions::default());
    }

    #[test]
    fn test_check_interval_gate() {
        let mut mon = LivenessMonitor::new(DPD, 0);
        assert!(mon.check(PERIODIC_CHECK_TIME - 1, true).is_none());
        assert!(mon.check(PERIODIC_CHECK_TIME, true).is_some());
        // Gate re-arms from the last run.
        assert!(mon.check(PERIODIC_CHECK_TIME + 10, true).is_none());
        assert!(mon.check(2 * PERIODIC_CHECK_TIME, true).is_some());
    }

    #[test]
    fn test_udp_escalation_ladder() {
        let mut mon = LivenessMonitor::new(DPD, 0);
        mon.seen_tcp(2 * DPD_TRIES * DPD); // keep the reliable side quiet

        let actions = mon.check(DPD_TRIES * DPD + 1, true).unwrap();
        assert!(actions.probe_udp);
        assert!(!actions.udp_dead);

        let actions = mon.check(DPD_MAX_TRIES * DPD + 1, true).unwrap();
        assert!(actions.probe_udp);
        assert!(actions.udp_dead);
    }

    #[test]
    fn test_inactive_udp_not_probed() {
        let mut mon = LivenessMonitor::new(DPD, 0);
        mon.seen_tcp(DPD_MAX_TRIES * DPD);
        let actions = mon.check(DPD_MAX_TRIES * DPD + 1, false).unwrap();
        assert!(!actions.probe_udp);
        assert!(!actions.udp_dead);
    }

    #[test]
    fn test_tcp_silence_tears_down() {
        let mut mon = LivenessMonitor::new(DPD, 0);

        let actions = mon.check(DPD_TRIES * DPD + 1, false).unwrap();
        assert!(actions.probe_tcp);
        assert!(!actions.tcp_dead);

        let actions = mon.check(DPD_MAX_TRIES * DPD + 1, false).unwrap();
        assert!(actions.tcp_dead);
    }

    #[test]
    fn test_any_frame_refreshes_liveness() {
        let mut mon = LivenessMonitor::new(DPD, 0);
        mon.seen_tcp(DPD_MAX_TRIES * DPD);
        mon.seen_udp(DPD_MAX_TRIES * DPD);
        let actions = mon.check(DPD_MAX_TRIES * DPD + 1, true).unwrap();
        assert_eq!(actions, DpdActions::default());
    }

    #[test]
    fn test_timestamps_monotone() {
        let mut mon = LivenessMonitor::new(DPD, 100);
        mon.seen_tcp(50); // stale update must not move time backwards
        assert_eq!(mon.last_msg_tcp(), 100);
        mon.seen_udp(150);
        mon.seen_udp(120);
        assert_eq!(mon.last_msg_udp(), 150);
    }
}
