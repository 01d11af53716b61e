//! Transport threads and timer actions
//!
//! A session runs four threads around one [`Shared`] state:
//!
//! - `d2dp-tx` waits for sendable nodes or a pending ACK and writes frames
//! - `d2dp-rx` reads datagrams and feeds them into the windows
//! - `d2dp-ack-timer` periodically turns the receive window into an ACK
//! - `d2dp-rto-timer` schedules retransmissions and detects dead links
//!
//! Each window sits behind its own mutex and the two are never held at the
//! same time. Socket and crypto calls happen with both window locks
//! released. When a window lock is held together with a timer, the window
//! lock is always taken first.

use crate::config::SessionConfig;
use crate::error::{Error, LinkError};
use crate::options::Options;
use crate::stats::{bump, Counters};
use d2dp_crypto::{Decrypt, Encrypt, Security};
use d2dp_io::{DatagramSocket, Timer};
use d2dp_protocol::params::{DATAGRAM_SIZE, HEADER_SIZE, MAX_SACK_PAIRS, SACK_PAIR_SIZE};
use d2dp_protocol::{FrameHeader, FrameKind, PeekedNode, RxBuffer, RxPut, SackPair, SeqId, TxBuffer};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// ACK bookkeeping on the sending side
pub(crate) struct AckState {
    /// Next ACK to transmit; a newer ACK replaces an unsent one
    pub pending: Option<FrameHeader>,
    /// Cumulative ack carried by the last prepared ACK
    pub last_acked: SeqId,
    /// Suspend flag carried by the last prepared ACK
    pub last_limit_exceeded: bool,
}

pub(crate) struct TxHandler {
    pub buffer: TxBuffer,
    pub ack: AckState,
    /// Sequence id the peer must acknowledge before keys may rotate
    pub key_update: Option<SeqId>,
}

pub(crate) struct RxHandler {
    pub buffer: RxBuffer,
}

pub(crate) struct Crypto {
    pub overhead: usize,
    pub tx: Mutex<Box<dyn Encrypt>>,
    pub rx: Mutex<Box<dyn Decrypt>>,
}

impl From<Security> for Crypto {
    fn from(security: Security) -> Self {
        Crypto {
            overhead: security.overhead,
            tx: Mutex::new(security.encryptor),
            rx: Mutex::new(security.decryptor),
        }
    }
}

/// Everything the API, the transport threads and the timers share
pub(crate) struct Shared {
    pub socket: Box<dyn DatagramSocket>,
    pub crypto: Option<Crypto>,
    pub config: SessionConfig,
    pub max_payload: usize,
    pub max_sack_pairs: usize,

    pub tx: Mutex<TxHandler>,
    /// Nodes were freed in the send window
    pub tx_free: Condvar,
    /// The TX thread has work, or a key update was acknowledged
    pub tx_data: Condvar,
    pub rx: Mutex<RxHandler>,
    /// Data became readable
    pub rx_data: Condvar,

    pub fatal: OnceLock<LinkError>,
    pub closing: AtomicBool,
    pub interrupt_epoch: AtomicU64,
    pub force_ack: AtomicBool,
    pub state: RwLock<SessionState>,
    pub options: Mutex<Options>,
    pub counters: Counters,

    pub ack_timer: Timer,
    pub rto_timer: Timer,
}

/// Largest SACK list that fits a datagram next to the header and crypto
/// overhead
pub(crate) fn max_sack_pairs(overhead: usize) -> usize {
    let room = DATAGRAM_SIZE.saturating_sub(HEADER_SIZE + overhead);
    (room / SACK_PAIR_SIZE).min(MAX_SACK_PAIRS)
}

impl Shared {
    pub fn new(
        socket: Box<dyn DatagramSocket>,
        security: Option<Security>,
        config: SessionConfig,
        max_payload: usize,
        tx_buffer: TxBuffer,
        rx_buffer: RxBuffer,
    ) -> Self {
        let crypto = security.map(Crypto::from);
        let overhead = crypto.as_ref().map_or(0, |c| c.overhead);
        let start = rx_buffer.ack_id();

        Shared {
            socket,
            crypto,
            max_payload,
            max_sack_pairs: max_sack_pairs(overhead),
            tx: Mutex::new(TxHandler {
                buffer: tx_buffer,
                ack: AckState {
                    pending: None,
                    last_acked: start,
                    last_limit_exceeded: false,
                },
                key_update: None,
            }),
            tx_free: Condvar::new(),
            tx_data: Condvar::new(),
            rx: Mutex::new(RxHandler { buffer: rx_buffer }),
            rx_data: Condvar::new(),
            fatal: OnceLock::new(),
            closing: AtomicBool::new(false),
            interrupt_epoch: AtomicU64::new(0),
            force_ack: AtomicBool::new(false),
            state: RwLock::new(SessionState::Open),
            options: Mutex::new(Options::default()),
            counters: Counters::default(),
            ack_timer: Timer::new(config.ack_period),
            rto_timer: Timer::new(config.rto_period),
            config,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn fatal(&self) -> Option<LinkError> {
        self.fatal.get().copied()
    }

    pub fn epoch(&self) -> u64 {
        self.interrupt_epoch.load(Ordering::Acquire)
    }

    /// Common exit conditions of every blocking call
    pub fn check(&self, epoch: u64) -> Result<(), Error> {
        if let Some(err) = self.fatal() {
            return Err(Error::Protocol(err));
        }
        if self.is_closing() {
            return Err(Error::Closed);
        }
        if self.epoch() != epoch {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    /// Record the first link failure and wake everybody
    ///
    /// Must be called without any window lock held.
    pub fn set_fatal(&self, err: LinkError) {
        if self.fatal.set(err).is_ok() {
            tracing::error!(error = %err, "d2dp link failed");
        }
        self.wake_all();
    }

    pub fn notify_tx_data(&self) {
        let _tx = self.tx.lock();
        self.tx_data.notify_all();
    }

    /// Wake every waiter on every condition
    ///
    /// Must be called without any window lock held.
    pub fn wake_all(&self) {
        {
            let _tx = self.tx.lock();
            self.tx_free.notify_all();
            self.tx_data.notify_all();
        }
        let _rx = self.rx.lock();
        self.rx_data.notify_all();
    }

    /// Build the next ACK from the receive window
    ///
    /// The ACK is only queued when it says something new: a moved
    /// cumulative ack, a changed suspend flag, SACK pairs or a forced
    /// resend.
    pub fn prepare_ack(&self) {
        let (ack_id, sacks, limit_exceeded) = {
            let rx = self.rx.lock();
            (
                rx.buffer.ack_id(),
                rx.buffer.generate_sack_pairs(self.max_sack_pairs),
                rx.buffer.limit_exceeded(),
            )
        };
        let forced = self.force_ack.swap(false, Ordering::AcqRel);

        let mut tx = self.tx.lock();
        let ack = &mut tx.ack;
        let unchanged = ack_id.eq(ack.last_acked)
            && limit_exceeded == ack.last_limit_exceeded
            && sacks.is_empty()
            && !forced;

        if !unchanged {
            if forced {
                bump(&self.counters.forced_acks);
            }
            ack.last_acked = ack_id;
            ack.last_limit_exceeded = limit_exceeded;
            ack.pending = Some(FrameHeader::ack(ack_id, 0, limit_exceeded, sacks));
        }
        self.tx_data.notify_all();
    }

    /// Seal and write one frame
    fn transmit(&self, frame: &[u8], sealed: &mut [u8]) -> Result<(), LinkError> {
        let datagram = match &self.crypto {
            Some(crypto) => {
                let n = crypto.tx.lock().encrypt(frame, sealed).map_err(|err| {
                    tracing::error!(error = %err, "frame encryption failed");
                    LinkError::Crypto
                })?;
                &sealed[..n]
            }
            None => frame,
        };

        match self.socket.send(datagram) {
            Ok(_) => Ok(()),
            // the peer is not listening yet; same as a lost datagram
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                tracing::debug!("peer unreachable, datagram dropped");
                Ok(())
            }
            Err(err) => Err(LinkError::Socket(err.kind())),
        }
    }

    fn send_ack(
        &self,
        mut ack: FrameHeader,
        frame: &mut [u8],
        sealed: &mut [u8],
    ) -> Result<(), LinkError> {
        ack.packet_id = self.counters.next_tx_packet_id();
        let n = ack.encode(frame).map_err(|err| {
            tracing::error!(error = %err, "ack encoding failed");
            LinkError::Internal
        })?;
        tracing::trace!(ack = %ack.seq_id, packet_id = ack.packet_id, "sending ack");

        self.transmit(&frame[..n], sealed)?;
        bump(&self.counters.acks_sent);
        Ok(())
    }

    /// `frame[HEADER_SIZE..]` already holds the node payload
    fn send_data(
        &self,
        node: &PeekedNode,
        frame: &mut [u8],
        sealed: &mut [u8],
    ) -> Result<(), LinkError> {
        let packet_id = self.counters.next_tx_packet_id();
        let header = FrameHeader::data(node.seq_id(), packet_id, node.len() as u16);
        header.encode(frame).map_err(|err| {
            tracing::error!(error = %err, "data header encoding failed");
            LinkError::Internal
        })?;
        tracing::trace!(seq = %node.seq_id(), len = node.len(), packet_id, "sending data");

        self.transmit(&frame[..HEADER_SIZE + node.len()], sealed)?;
        bump(&self.counters.data_sent);
        Ok(())
    }

    /// Open a received datagram; `None` drops it
    fn open<'a>(&self, datagram: &'a [u8], plain: &'a mut [u8]) -> Option<&'a [u8]> {
        let Some(crypto) = &self.crypto else {
            return Some(datagram);
        };

        match crypto.rx.lock().decrypt(datagram, plain) {
            Ok(n) => Some(&plain[..n]),
            Err(err) => {
                tracing::debug!(error = %err, len = datagram.len(), "undecryptable datagram dropped");
                bump(&self.counters.dropped);
                // the peer may be waiting for an ACK to finish a key update
                self.force_ack.store(true, Ordering::Release);
                None
            }
        }
    }

    fn process_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        let (header, offset) = match FrameHeader::decode(frame, self.max_payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::trace!(error = %err, "malformed frame dropped");
                bump(&self.counters.dropped);
                return Ok(());
            }
        };

        // only this thread moves the receive packet id
        let last = self.counters.rx_packet_id.load(Ordering::Relaxed);
        if header.packet_id <= last {
            tracing::trace!(packet_id = header.packet_id, last, "replayed frame dropped");
            bump(&self.counters.dropped);
            return Ok(());
        }
        self.counters
            .rx_packet_id
            .store(header.packet_id, Ordering::Relaxed);

        match header.kind {
            FrameKind::Ack { suspend, sacks } => {
                self.process_ack(header.seq_id, suspend, &sacks);
                Ok(())
            }
            FrameKind::Data { .. } => self.process_data(header.seq_id, &frame[offset..]),
        }
    }

    fn process_ack(&self, ack_id: SeqId, suspend: bool, sacks: &[SackPair]) {
        bump(&self.counters.acks_received);

        let mut tx = self.tx.lock();
        let freed = tx.buffer.process_ack(ack_id, sacks);
        if tx.buffer.is_empty() {
            self.rto_timer.reset(Instant::now());
            self.rto_timer.disable();
        } else if freed > 0 {
            self.rto_timer.reset(Instant::now());
        }

        let resumed = tx.buffer.flow_control() && !suspend;
        if suspend && !tx.buffer.flow_control() {
            tracing::debug!(ack = %ack_id, "peer suspended transmission");
        }
        tx.buffer.set_flow_control(suspend);

        if let Some(barrier) = tx.key_update {
            if ack_id.ge(barrier) {
                tracing::debug!(barrier = %barrier, "key update acknowledged");
                tx.key_update = None;
                self.tx_data.notify_all();
            }
        }
        if resumed {
            tracing::debug!(ack = %ack_id, "peer resumed transmission");
            self.tx_data.notify_all();
        }
        if freed > 0 {
            self.tx_free.notify_all();
        }
    }

    fn process_data(&self, seq_id: SeqId, payload: &[u8]) -> Result<(), LinkError> {
        bump(&self.counters.data_received);

        let put = {
            let mut rx = self.rx.lock();
            let put = rx.buffer.put(seq_id, payload);
            if put == RxPut::Ok {
                self.rx_data.notify_all();
            }
            put
        };

        match put {
            RxPut::Ok => {}
            RxPut::Consumed | RxPut::Duplicate => {
                tracing::trace!(seq = %seq_id, ?put, "retransmission received");
                self.force_ack.store(true, Ordering::Release);
            }
            RxPut::Overflow => {
                tracing::trace!(seq = %seq_id, "receive window full, frame dropped");
                bump(&self.counters.dropped);
            }
            RxPut::BadPacket => {
                tracing::warn!(seq = %seq_id, len = payload.len(), "bad data packet");
                return Err(LinkError::BadPacket);
            }
        }

        self.ack_timer.enable();
        Ok(())
    }
}

/// Body of the `d2dp-tx` thread
pub(crate) fn tx_loop(shared: &Shared) -> Result<(), LinkError> {
    let mut frame = vec![0u8; DATAGRAM_SIZE];
    let mut sealed = vec![0u8; DATAGRAM_SIZE];

    let mut tx = shared.tx.lock();
    loop {
        loop {
            if shared.fatal().is_some() || shared.is_closing() {
                return Ok(());
            }
            if tx.ack.pending.is_some() || tx.buffer.has_sendable() {
                break;
            }
            shared.tx_data.wait(&mut tx);
        }

        let mut count = 0usize;
        loop {
            // an ACK goes out at least once per work cycle
            if let Some(ack) = tx.ack.pending.take() {
                MutexGuard::unlocked(&mut tx, || shared.send_ack(ack, &mut frame, &mut sealed))?;
            }

            let Some(node) = tx.buffer.peek_next(&mut frame[HEADER_SIZE..]) else {
                break;
            };
            shared.rto_timer.disable();
            MutexGuard::unlocked(&mut tx, || shared.send_data(&node, &mut frame, &mut sealed))?;

            let seq_id = node.seq_id();
            let awaiting_ack = tx.buffer.return_after_send(node).map_err(|err| {
                tracing::error!(error = %err, "send window corrupted");
                LinkError::Internal
            })?;
            if !awaiting_ack {
                tracing::trace!(seq = %seq_id, "acknowledged while in flight");
            }
            count += 1;
        }

        // an ACK may have emptied the window while a frame was in flight
        if tx.buffer.is_empty() {
            shared.rto_timer.disable();
        } else if count > 0 {
            shared.rto_timer.enable();
        }
    }
}

/// Body of the `d2dp-rx` thread
pub(crate) fn rx_loop(shared: &Shared) -> Result<(), LinkError> {
    // one spare byte tells oversized datagrams apart
    let mut datagram = vec![0u8; DATAGRAM_SIZE + 1];
    let mut plain = vec![0u8; DATAGRAM_SIZE + 1];

    loop {
        if shared.fatal().is_some() || shared.is_closing() {
            return Ok(());
        }

        let n = match shared.socket.recv(&mut datagram) {
            Ok(n) => n,
            Err(err) => match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ConnectionRefused => {
                    continue
                }
                ErrorKind::Interrupted if shared.is_closing() => return Ok(()),
                ErrorKind::Interrupted => return Err(LinkError::Interrupted),
                kind => return Err(LinkError::Socket(kind)),
            },
        };

        if n == 0 || n > DATAGRAM_SIZE {
            tracing::trace!(len = n, "datagram size out of range, ignored");
            bump(&shared.counters.dropped);
            continue;
        }

        let Some(frame) = shared.open(&datagram[..n], &mut plain) else {
            continue;
        };
        shared.process_frame(frame)?;
    }
}

/// ACK timer action
pub(crate) fn ack_timer_action(shared: &Shared) -> bool {
    shared.prepare_ack();
    true
}

/// RTO timer action
pub(crate) fn rto_timer_action(shared: &Shared) -> bool {
    if shared.fatal().is_some() || shared.is_closing() {
        return false;
    }

    bump(&shared.counters.rto_fires);
    shared.tx.lock().buffer.mark_need_resend_all();

    let retries = shared.rto_timer.backoff(shared.config.retry_limit_min);
    tracing::trace!(retries, delay = ?shared.rto_timer.delay(), "retransmission timeout");
    if retries > shared.config.retry_limit_max {
        shared.set_fatal(LinkError::RetryLimit);
        return false;
    }

    shared.notify_tx_data();
    true
}
