//! Test harness for D2DP integration tests
//!
//! [`FaultyLink`] wraps an in-memory datagram channel and drops, duplicates
//! or reorders DATA frames on the way out. [`RawPeer`] speaks the wire format
//! directly so tests can craft acknowledgements by hand.

use d2dp::protocol::params::{DATAGRAM_SIZE, MAX_PAYLOAD_SIZE};
use d2dp::protocol::{FrameHeader, SackPair, SeqId};
use d2dp::{DatagramSocket, MemorySocket, Session, SessionConfig};
use parking_lot::Mutex;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval used by every test socket
pub const POLL: Duration = Duration::from_millis(5);

/// Small window and fast timers
pub fn fast_config() -> SessionConfig {
    SessionConfig::default()
        .with_buffer_size(64 * 1024)
        .with_ack_period(Duration::from_millis(1))
        .with_flush_timeout(Duration::from_secs(5))
}

/// Deterministic fault schedule, counted over outgoing DATA frames
///
/// A value of `n` hits every `n`th frame; zero disables the fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub drop_every: usize,
    pub duplicate_every: usize,
    pub reorder_every: usize,
}

#[derive(Debug, Default)]
struct FaultState {
    data_frames: usize,
    dropped: usize,
    duplicated: usize,
    held: Option<Vec<u8>>,
}

/// Datagram channel that misbehaves on purpose
///
/// Only plaintext frames are recognised; anything that does not decode as a
/// DATA header passes through untouched.
pub struct FaultyLink {
    inner: MemorySocket,
    faults: Faults,
    state: Mutex<FaultState>,
}

impl FaultyLink {
    pub fn new(inner: MemorySocket, faults: Faults) -> Arc<Self> {
        Arc::new(FaultyLink {
            inner,
            faults,
            state: Mutex::new(FaultState::default()),
        })
    }

    /// DATA frames handed to the link so far
    pub fn data_frames(&self) -> usize {
        self.state.lock().data_frames
    }

    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }

    pub fn duplicated(&self) -> usize {
        self.state.lock().duplicated
    }
}

fn hits(every: usize, n: usize) -> bool {
    every > 0 && n % every == 0
}

fn is_data(buf: &[u8]) -> bool {
    FrameHeader::decode(buf, MAX_PAYLOAD_SIZE).is_ok_and(|(header, _)| !header.is_ack())
}

impl DatagramSocket for FaultyLink {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let mut duplicate = false;

        if is_data(buf) {
            state.data_frames += 1;
            let n = state.data_frames;

            if hits(self.faults.drop_every, n) {
                state.dropped += 1;
                return Ok(buf.len());
            }
            if hits(self.faults.reorder_every, n) && state.held.is_none() {
                state.held = Some(buf.to_vec());
                return Ok(buf.len());
            }
            duplicate = hits(self.faults.duplicate_every, n);
        }

        self.inner.send(buf)?;
        if duplicate {
            state.duplicated += 1;
            self.inner.send(buf)?;
        }
        if let Some(held) = state.held.take() {
            self.inner.send(&held)?;
        }
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf)
    }
}

/// Two plaintext sessions joined by faulty links in both directions
pub fn faulty_pair(
    faults: Faults,
    config: SessionConfig,
) -> (Session, Arc<FaultyLink>, Session, Arc<FaultyLink>) {
    let (a, b) = MemorySocket::pair();
    let a = FaultyLink::new(a.with_poll_interval(POLL), faults);
    let b = FaultyLink::new(b.with_poll_interval(POLL), faults);
    let session_a = Session::with_config(a.clone(), None, config.clone())
        .expect("session a");
    let session_b = Session::with_config(b.clone(), None, config).expect("session b");
    (session_a, a, session_b, b)
}

/// Hand-driven protocol endpoint
pub struct RawPeer {
    socket: MemorySocket,
    packet_id: u64,
}

impl RawPeer {
    /// A plaintext session talking to a raw peer
    pub fn connect(config: SessionConfig) -> (Session, RawPeer) {
        let (a, b) = MemorySocket::pair();
        let session = Session::with_config(a.with_poll_interval(POLL), None, config)
            .expect("session");
        let peer = RawPeer {
            socket: b.with_poll_interval(POLL),
            packet_id: 0,
        };
        (session, peer)
    }

    pub fn send_ack(&mut self, cumulative: u32, suspend: bool, sacks: Vec<SackPair>) {
        self.packet_id += 1;
        let header = FrameHeader::ack(SeqId::new(cumulative), self.packet_id, suspend, sacks);
        let mut frame = vec![0u8; header.encoded_len()];
        header.encode(&mut frame).expect("encode ack");
        self.socket.send(&frame).expect("send ack");
    }

    pub fn send_data(&mut self, seq_id: u32, payload: &[u8]) {
        self.packet_id += 1;
        let header = FrameHeader::data(SeqId::new(seq_id), self.packet_id, payload.len() as u16);
        let mut frame = vec![0u8; header.encoded_len() + payload.len()];
        let n = header.encode(&mut frame).expect("encode data");
        frame[n..].copy_from_slice(payload);
        self.socket.send(&frame).expect("send data");
    }

    /// Next decodable frame, or `None` once `timeout` elapses
    pub fn recv_frame(&self, timeout: Duration) -> Option<(FrameHeader, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; DATAGRAM_SIZE];
        while Instant::now() < deadline {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    if let Ok((header, consumed)) = FrameHeader::decode(&buf[..n], MAX_PAYLOAD_SIZE)
                    {
                        return Some((header, buf[consumed..n].to_vec()));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => panic!("raw peer recv failed: {e}"),
            }
        }
        None
    }

    /// Every DATA frame seen within `window`, as `(seq_id, payload)`
    pub fn collect_data(&self, window: Duration) -> Vec<(u32, Vec<u8>)> {
        let deadline = Instant::now() + window;
        let mut frames = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.recv_frame(deadline - now) {
                Some((header, payload)) if !header.is_ack() => {
                    frames.push((header.seq_id.as_raw(), payload))
                }
                Some(_) => {}
                None => break,
            }
        }
        frames
    }

    /// Collect DATA frames until `[0, bytes)` has been seen at least once
    pub fn receive_stream(&self, bytes: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut stream = vec![0u8; bytes];
        let mut seen = vec![false; bytes];
        while seen.iter().any(|s| !s) {
            let now = Instant::now();
            assert!(now < deadline, "stream not delivered in time");
            if let Some((header, payload)) = self.recv_frame(deadline - now) {
                if header.is_ack() {
                    continue;
                }
                let start = header.seq_id.as_raw() as usize;
                for (i, byte) in payload.iter().enumerate() {
                    if let Some(slot) = stream.get_mut(start + i) {
                        *slot = *byte;
                        seen[start + i] = true;
                    }
                }
            }
        }
        stream
    }
}

/// Deterministic test payload
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
