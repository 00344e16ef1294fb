// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory record channel.
//!
//! A loopback implementation of the record-layer contract with no
//! cryptography and no sockets. The worker side holds the
//! [`MemoryChannel`]; the driving side holds the [`MemoryPeer`] and
//! injects frames, scripted errors and handshake outcomes. This is the
//! backing for the engine's unit tests and for protocol harnesses that
//! want to exercise the tunnel state machines deterministically.

use std::collections::VecDeque;
use std::io;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex};

use super::{
    Alert, DatagramChannel, DatagramFactory, DatagramParams, RecordChannel, RecordError,
    RecordResult,
};

#[derive(Default)]
struct Shared {
    /// Frames waiting for the worker to receive.
    inbox: VecDeque<Vec<u8>>,
    /// Errors to surface from `recv` before touching the inbox.
    recv_script: VecDeque<RecordError>,
    /// Frames the worker sent.
    sent: Vec<Vec<u8>>,
    /// Scripted handshake outcomes; empty means immediate success.
    handshake_script: VecDeque<RecordResult<()>>,
    handshake_calls: usize,
    /// Sends larger than this fail with `LargePacket`.
    max_datagram: Option<usize>,
    /// Alerts delivered through `send_alert`.
    alerts: Vec<(Alert, bool)>,
    /// Peer closed its side (worker's recv returns `Ok(0)`).
    peer_closed: bool,
    /// Worker called `close`.
    closed: bool,
    data_mtu: u16,
    negotiated_data_mtu: u16,
    link_mtu: u16,
    record_overhead: u16,
    ciphersuite: Option<String>,
}

/// Worker-side endpoint.
pub struct MemoryChannel {
    shared: Arc<Mutex<Shared>>,
}

/// Test/driver-side endpoint.
pub struct MemoryPeer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryPeer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            MemoryChannel {
                shared: shared.clone(),
            },
            MemoryPeer { shared },
        )
    }
}

impl MemoryPeer {
    /// Queue a frame for the worker to receive.
    pub fn push_frame(&self, frame: impl Into<Vec<u8>>) {
        self.shared.lock().unwrap().inbox.push_back(frame.into());
    }

    /// Queue an error to surface from the worker's next `recv`.
    pub fn push_recv_err(&self, err: RecordError) {
        self.shared.lock().unwrap().recv_script.push_back(err);
    }

    /// Queue a handshake outcome (FIFO); an empty script means success.
    pub fn script_handshake(&self, result: RecordResult<()>) {
        self.shared
            .lock()
            .unwrap()
            .handshake_script
            .push_back(result);
    }

    /// Drain everything the worker sent so far.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.shared.lock().unwrap().sent)
    }

    pub fn alerts(&self) -> Vec<(Alert, bool)> {
        self.shared.lock().unwrap().alerts.clone()
    }

    pub fn handshake_calls(&self) -> usize {
        self.shared.lock().unwrap().handshake_calls
    }

    /// Make sends above `max` fail with `LargePacket`.
    pub fn set_max_datagram(&self, max: usize) {
        self.shared.lock().unwrap().max_datagram = Some(max);
    }

    /// Simulate an orderly close by the peer.
    pub fn close_peer(&self) {
        self.shared.lock().unwrap().peer_closed = true;
    }

    pub fn worker_closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }

    pub fn set_negotiated_data_mtu(&self, mtu: u16) {
        self.shared.lock().unwrap().negotiated_data_mtu = mtu;
    }

    pub fn data_mtu(&self) -> u16 {
        self.shared.lock().unwrap().data_mtu
    }

    pub fn link_mtu(&self) -> u16 {
        self.shared.lock().unwrap().link_mtu
    }

    pub fn set_record_overhead(&self, overhead: u16) {
        self.shared.lock().unwrap().record_overhead = overhead;
    }

    pub fn set_ciphersuite(&self, desc: &str) {
        self.shared.lock().unwrap().ciphersuite = Some(desc.to_string());
    }
}

impl RecordChannel for MemoryChannel {
    fn recv(&mut self, buf: &mut [u8]) -> RecordResult<usize> {
        let mut sh = self.shared.lock().unwrap();
        if let Some(err) = sh.recv_script.pop_front() {
            return Err(err);
        }
        match sh.inbox.pop_front() {
            Some(frame) => {
                if frame.len() > buf.len() {
                    return Err(RecordError::fatal("receive buffer too small"));
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            None if sh.peer_closed => Ok(0),
            None => Err(RecordError::WouldBlock),
        }
    }

    fn send(&mut self, buf: &[u8]) -> RecordResult<usize> {
        let mut sh = self.shared.lock().unwrap();
        if let Some(max) = sh.max_datagram {
            if buf.len() > max {
                return Err(RecordError::LargePacket);
            }
        }
        sh.sent.push(buf.to_vec());
        Ok(buf.len())
    }

    fn pending(&self) -> bool {
        let sh = self.shared.lock().unwrap();
        !sh.inbox.is_empty() || !sh.recv_script.is_empty()
    }

    fn handshake(&mut self) -> RecordResult<()> {
        let mut sh = self.shared.lock().unwrap();
        sh.handshake_calls += 1;
        sh.handshake_script.pop_front().unwrap_or(Ok(()))
    }

    fn send_alert(&mut self, alert: Alert, fatal: bool) -> RecordResult<()> {
        self.shared.lock().unwrap().alerts.push((alert, fatal));
        Ok(())
    }

    fn close(&mut self) {
        self.shared.lock().unwrap().closed = true;
    }

    fn record_overhead(&self) -> u16 {
        self.shared.lock().unwrap().record_overhead
    }

    fn describe_ciphersuite(&self) -> Option<String> {
        self.shared.lock().unwrap().ciphersuite.clone()
    }
}

impl DatagramChannel for MemoryChannel {
    fn set_data_mtu(&mut self, mtu: u16) {
        self.shared.lock().unwrap().data_mtu = mtu;
    }

    fn negotiated_data_mtu(&self) -> u16 {
        self.shared.lock().unwrap().negotiated_data_mtu
    }

    fn set_link_mtu(&mut self, mtu: u16) {
        self.shared.lock().unwrap().link_mtu = mtu;
    }
}

/// Factory handing out one prepared in-memory datagram channel.
///
/// Records the seed parameters it was invoked with so harnesses can
/// assert on them.
pub struct MemoryFactory {
    prepared: Mutex<Option<MemoryChannel>>,
    seen_suite: Mutex<Option<&'static str>>,
}

impl MemoryFactory {
    pub fn new(channel: MemoryChannel) -> Self {
        Self {
            prepared: Mutex::new(Some(channel)),
            seen_suite: Mutex::new(None),
        }
    }

    /// A factory that refuses to open anything.
    pub fn empty() -> Self {
        Self {
            prepared: Mutex::new(None),
            seen_suite: Mutex::new(None),
        }
    }

    pub fn seen_suite(&self) -> Option<&'static str> {
        *self.seen_suite.lock().unwrap()
    }
}

impl DatagramFactory for MemoryFactory {
    fn open(
        &self,
        params: &DatagramParams,
        _socket: UdpSocket,
    ) -> io::Result<Box<dyn DatagramChannel>> {
        *self.seen_suite.lock().unwrap() = Some(params.suite.oc_name);
        self.prepared
            .lock()
            .unwrap()
            .take()
            .map(|ch| Box::new(ch) as Box<dyn DatagramChannel>)
            .ok_or_else(|| io::Error::other("no datagram session prepared"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flow() {
        let (mut ch, peer) = MemoryChannel::pair();
        peer.push_frame(b"hello".as_slice());

        assert!(ch.pending());
        let mut buf = [0u8; 64];
        assert_eq!(ch.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(!ch.pending());
        assert!(matches!(ch.recv(&mut buf), Err(RecordError::WouldBlock)));

        ch.send(b"reply").unwrap();
        assert_eq!(peer.take_sent(), vec![b"reply".to_vec()]);
    }

    #[test]
    fn test_large_packet_gate() {
        let (mut ch, peer) = MemoryChannel::pair();
        peer.set_max_datagram(4);
        assert!(matches!(ch.send(b"12345"), Err(RecordError::LargePacket)));
        assert_eq!(ch.send(b"1234").unwrap(), 4);
    }

    #[test]
    fn test_scripted_handshake() {
        let (mut ch, peer) = MemoryChannel::pair();
        peer.script_handshake(Err(RecordError::WouldBlock));
        peer.script_handshake(Ok(()));
        assert!(matches!(ch.handshake(), Err(RecordError::WouldBlock)));
        assert!(ch.handshake().is_ok());
        assert_eq!(peer.handshake_calls(), 2);
    }

    #[test]
    fn test_peer_close_is_eof() {
        let (mut ch, peer) = MemoryChannel::pair();
        peer.close_peer();
        let mut buf = [0u8; 8];
        assert_eq!(ch.recv(&mut buf).unwrap(), 0);
    }
}
