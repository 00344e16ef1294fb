// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Signal discipline for the worker process.
//!
//! `SIGTERM`/`SIGINT` request a graceful exit: the handler raises the
//! process-wide terminate flag and arms a 2-second `SIGALRM` that
//! hard-exits if the graceful path stalls. `SIGHUP` is ignored. The
//! termination signals stay blocked outside the tunnel loop's wait so
//! state mutations never race the flag; [`UnblockGuard`] opens the window
//! around the wait call only.
//!
//! A separate alarm bounds the time an unauthenticated peer may spend in
//! the HTTP phase; entering the tunnel loop clears it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::TERM_GRACE_SECS;

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_signo: libc::c_int) {
    TERMINATE.store(true, Ordering::Relaxed);
    // Backstop: if the graceful path stalls, SIGALRM hard-exits.
    unsafe { libc::alarm(TERM_GRACE_SECS) };
}

extern "C" fn handle_alarm(_signo: libc::c_int) {
    unsafe { libc::_exit(1) };
}

/// Whether a termination signal has been observed.
pub fn terminated() -> bool {
    TERMINATE.load(Ordering::Relaxed)
}

/// The terminate flag is process-global; tests that raise it (or drive
/// code that reads it) serialize on this.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn reset_for_test() {
    TERMINATE.store(false, Ordering::Relaxed);
}

#[cfg(test)]
pub(crate) fn raise_for_test() {
    TERMINATE.store(true, Ordering::Relaxed);
}

fn install(signo: libc::c_int, handler: usize) -> io::Result<()> {
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = handler;
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };
    sa.sa_flags = 0;
    let rc = unsafe { libc::sigaction(signo, &sa, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Install the worker's handlers and block the termination signals.
/// Called once before any session state exists.
pub fn install_handlers() -> io::Result<()> {
    install(libc::SIGTERM, handle_term as usize)?;
    install(libc::SIGINT, handle_term as usize)?;
    install(libc::SIGHUP, libc::SIG_IGN)?;
    install(libc::SIGALRM, handle_alarm as usize)?;
    set_term_blocked(true)
}

fn set_term_blocked(blocked: bool) -> io::Result<()> {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::sigaddset(&mut set, libc::SIGINT);
    }
    let how = if blocked {
        libc::SIG_BLOCK
    } else {
        libc::SIG_UNBLOCK
    };
    let rc = unsafe { libc::sigprocmask(how, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Opens the delivery window for `SIGTERM`/`SIGINT` for its lifetime.
/// Held only across the tunnel loop's readiness wait; a signal landing
/// inside the window interrupts the wait, one landing at the window edge
/// is caught by the alarm backstop.
pub struct UnblockGuard;

impl UnblockGuard {
    pub fn new() -> io::Result<Self> {
        set_term_blocked(false)?;
        Ok(UnblockGuard)
    }
}

impl Drop for UnblockGuard {
    fn drop(&mut self) {
        let _ = set_term_blocked(true);
    }
}

/// Arm the HTTP-phase deadline. 0 disables it.
pub fn arm_auth_timeout(secs: u32) {
    if secs > 0 {
        unsafe { libc::alarm(secs) };
    }
}

/// Cancel any pending alarm (entering the tunnel loop).
pub fn clear_alarm() {
    unsafe { libc::alarm(0) };
}
