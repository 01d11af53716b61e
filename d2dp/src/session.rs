//! Public session API
//!
//! A [`Session`] turns a connected datagram socket into a reliable, ordered
//! byte stream. Any number of threads may call `send` and `recv` on a shared
//! `&Session`; the transport work happens on the session's own threads.

use crate::config::{ConfigError, SessionConfig};
use crate::error::{Error, LinkError, Result};
use crate::options::{OptionName, RecvFlags, SendFlags, SessionOption};
use crate::stats::SessionStats;
use crate::transport::{self, SessionState, Shared};
use d2dp_crypto::{CryptoError, Decrypt, Encrypt, Security};
use d2dp_io::{DatagramSocket, TimerTask};
use d2dp_protocol::params::{DATAGRAM_SIZE, HEADER_SIZE};
use d2dp_protocol::{RxBuffer, TxBuffer, TxBufferError};
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Reliable stream over a datagram socket
pub struct Session {
    shared: Arc<Shared>,
    tx_thread: Option<JoinHandle<()>>,
    rx_thread: Option<JoinHandle<()>>,
    ack_task: Option<TimerTask>,
    rto_task: Option<TimerTask>,
}

fn spawn_loop(
    shared: &Arc<Shared>,
    name: &'static str,
    body: fn(&Shared) -> std::result::Result<(), LinkError>,
) -> Result<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            tracing::debug!(thread = name, "transport thread started");
            if let Err(err) = body(&shared) {
                shared.set_fatal(err);
            }
            tracing::debug!(thread = name, "transport thread exited");
        })
        .map_err(|source| Error::Spawn { name, source })
}

impl Session {
    /// Create a session with the default configuration
    pub fn create<S>(socket: S, security: Option<Security>) -> Result<Self>
    where
        S: DatagramSocket + 'static,
    {
        Self::with_config(socket, security, SessionConfig::default())
    }

    pub fn with_config<S>(
        socket: S,
        security: Option<Security>,
        config: SessionConfig,
    ) -> Result<Self>
    where
        S: DatagramSocket + 'static,
    {
        config.validate()?;

        let overhead = security.as_ref().map_or(0, |s| s.overhead);
        let available = DATAGRAM_SIZE - HEADER_SIZE;
        if overhead >= available {
            return Err(ConfigError::CryptoOverhead(overhead).into());
        }
        let max_payload = available - overhead;

        let (tx_buffer, rx_buffer) = TxBuffer::new(config.buffer_size, max_payload)
            .and_then(|tx| Ok((tx, RxBuffer::new(config.buffer_size, max_payload)?)))
            .map_err(|err| {
                tracing::error!(error = %err, "window allocation failed");
                Error::OutOfMemory
            })?;

        let shared = Arc::new(Shared::new(
            Box::new(socket),
            security,
            config,
            max_payload,
            tx_buffer,
            rx_buffer,
        ));

        // a partially started session is torn down by Drop
        let mut session = Session {
            shared,
            tx_thread: None,
            rx_thread: None,
            ack_task: None,
            rto_task: None,
        };

        let shared = Arc::clone(&session.shared);
        session.ack_task = Some(
            session
                .shared
                .ack_timer
                .spawn("d2dp-ack-timer", move || transport::ack_timer_action(&shared))
                .map_err(|source| Error::Spawn {
                    name: "d2dp-ack-timer",
                    source,
                })?,
        );

        let shared = Arc::clone(&session.shared);
        session.rto_task = Some(
            session
                .shared
                .rto_timer
                .spawn("d2dp-rto-timer", move || transport::rto_timer_action(&shared))
                .map_err(|source| Error::Spawn {
                    name: "d2dp-rto-timer",
                    source,
                })?,
        );

        session.tx_thread = Some(spawn_loop(&session.shared, "d2dp-tx", transport::tx_loop)?);
        session.rx_thread = Some(spawn_loop(&session.shared, "d2dp-rx", transport::rx_loop)?);

        tracing::info!(
            max_payload,
            buffer_size = session.shared.config.buffer_size,
            encrypted = session.shared.crypto.is_some(),
            "d2dp session created"
        );

        Ok(session)
    }

    /// Send all of `data`, blocking while the send window is full
    pub fn send(&self, data: &[u8], flags: SendFlags) -> Result<usize> {
        self.send_vectored(&[data], flags)
    }

    /// Send the concatenation of `bufs` as one atomic append
    pub fn send_vectored(&self, bufs: &[&[u8]], flags: SendFlags) -> Result<usize> {
        let len: usize = bufs.iter().map(|b| b.len()).sum();
        if len == 0 {
            return Ok(0);
        }

        let shared = &*self.shared;
        let epoch = shared.epoch();
        let key_update = flags.contains(SendFlags::KEY_UPDATE);

        let mut tx = shared.tx.lock();
        let capacity = tx.buffer.size();
        if len > capacity {
            return Err(Error::InvalidSize {
                requested: len,
                capacity,
            });
        }

        loop {
            shared.check(epoch)?;
            if key_update && tx.key_update.is_some() {
                return Err(Error::KeyUpdatePending);
            }
            if tx.buffer.free_bytes() >= len {
                break;
            }
            shared.tx_free.wait(&mut tx);
        }

        let appended = tx.buffer.append(bufs, len).map_err(|err| match err {
            TxBufferError::OutOfMemory => Error::OutOfMemory,
            _ => Error::Protocol(LinkError::Internal),
        })?;
        if key_update {
            tx.key_update = tx.buffer.last_seq_id();
            tracing::debug!(barrier = ?tx.key_update, "key update barrier set");
        }
        shared.tx_data.notify_all();

        Ok(appended)
    }

    /// Receive into `buf`
    ///
    /// Blocks until any data is available or, with [`RecvFlags::WAITALL`],
    /// until `buf` can be filled completely.
    pub fn recv(&self, buf: &mut [u8], flags: RecvFlags) -> Result<usize> {
        self.recv_vectored(&mut [buf], flags)
    }

    /// Receive into `bufs`, filling them in order
    pub fn recv_vectored(&self, bufs: &mut [&mut [u8]], flags: RecvFlags) -> Result<usize> {
        let len: usize = bufs.iter().map(|b| b.len()).sum();
        if len == 0 {
            return Ok(0);
        }

        let shared = &*self.shared;
        let epoch = shared.epoch();
        let wait_all = flags.contains(RecvFlags::WAITALL);
        let deadline = shared.options.lock().recv_timeout.map(|t| Instant::now() + t);

        let mut rx = shared.rx.lock();
        let capacity = rx.buffer.size();
        if wait_all && len > capacity {
            return Err(Error::InvalidSize {
                requested: len,
                capacity,
            });
        }

        let ready = |rx: &transport::RxHandler| {
            if wait_all {
                rx.buffer.available_bytes() >= len
            } else {
                rx.buffer.has_data()
            }
        };

        // a failed link reports its error even with data still buffered
        loop {
            shared.check(epoch)?;
            if ready(&*rx) {
                break;
            }
            match deadline {
                Some(deadline) => {
                    let timed_out = shared.rx_data.wait_until(&mut rx, deadline).timed_out();
                    if timed_out && !ready(&*rx) {
                        return Err(Error::TimedOut);
                    }
                }
                None => shared.rx_data.wait(&mut rx),
            }
        }

        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = rx.buffer.get(buf);
            total += n;
            if n < buf.len() {
                break;
            }
        }

        tracing::trace!(total, "recv");
        Ok(total)
    }

    pub fn set_option(&self, option: SessionOption) -> Result<()> {
        self.shared.options.lock().set(option)
    }

    pub fn get_option(&self, name: OptionName) -> SessionOption {
        self.shared.options.lock().get(name)
    }

    /// Wait until the last key-update barrier is acknowledged and lock the
    /// encryptor
    ///
    /// The transmit thread cannot seal frames while the guard is alive.
    pub fn tx_key_lock(&self) -> Result<TxKeyGuard<'_>> {
        let shared = &*self.shared;
        let epoch = shared.epoch();

        let mut tx = shared.tx.lock();
        loop {
            shared.check(epoch)?;
            if tx.key_update.is_none() {
                break;
            }
            shared.tx_data.wait(&mut tx);
        }
        drop(tx);

        Ok(TxKeyGuard {
            guard: shared.crypto.as_ref().map(|c| c.tx.lock()),
        })
    }

    /// Lock the decryptor
    pub fn rx_key_lock(&self) -> RxKeyGuard<'_> {
        RxKeyGuard {
            guard: self.shared.crypto.as_ref().map(|c| c.rx.lock()),
        }
    }

    /// Wake every blocked caller with [`Error::Interrupted`]
    pub fn interrupt(&self) {
        self.shared.interrupt_epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.wake_all();
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    /// The stored link failure, if any
    pub fn error(&self) -> Option<LinkError> {
        self.shared.fatal()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Largest payload carried by one DATA frame
    pub fn max_payload(&self) -> usize {
        self.shared.max_payload
    }

    /// Capacity of each window in bytes
    pub fn window_size(&self) -> usize {
        self.shared.tx.lock().buffer.size()
    }

    /// Flush in-flight data, then shut the session down
    ///
    /// Teardown happens even when the flush fails; the flush error is
    /// returned afterwards.
    pub fn close(mut self) -> Result<()> {
        *self.shared.state.write() = SessionState::Closing;
        let flushed = self.flush();
        self.teardown();

        if let Err(err) = &flushed {
            tracing::warn!(error = %err, "session closed without a complete flush");
        }
        flushed
    }

    fn flushed(&self) -> bool {
        let ack_id = self.shared.rx.lock().buffer.ack_id();
        let tx = self.shared.tx.lock();
        tx.buffer.is_empty() && tx.ack.pending.is_none() && ack_id.eq(tx.ack.last_acked)
    }

    fn flush(&self) -> Result<()> {
        let shared = &*self.shared;
        let deadline = Instant::now() + shared.config.flush_timeout;

        loop {
            if let Some(err) = shared.fatal() {
                return Err(Error::Protocol(err));
            }
            if self.flushed() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::FlushTimedOut);
            }
            thread::sleep(shared.config.ack_period.min(deadline - now));
        }
    }

    fn teardown(&mut self) {
        if self.tx_thread.is_none()
            && self.rx_thread.is_none()
            && self.ack_task.is_none()
            && self.rto_task.is_none()
        {
            return;
        }

        let shared = &*self.shared;
        *shared.state.write() = SessionState::Closing;

        if let Some(mut task) = self.ack_task.take() {
            task.stop();
        }
        if let Some(mut task) = self.rto_task.take() {
            task.stop();
        }

        shared.closing.store(true, Ordering::Release);
        shared.wake_all();

        for handle in [self.tx_thread.take(), self.rx_thread.take()].into_iter().flatten() {
            if handle.join().is_err() {
                tracing::error!("transport thread panicked");
            }
        }

        shared.tx.lock().buffer.clear();
        shared.rx.lock().buffer.clear();
        *shared.state.write() = SessionState::Closed;

        let stats = shared.counters.snapshot();
        tracing::debug!(?stats, "d2dp session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("max_payload", &self.shared.max_payload)
            .field("error", &self.error())
            .finish()
    }
}

/// Exclusive access to the transmit key
///
/// Without a [`Security`] the guard holds nothing and key operations are
/// no-ops.
pub struct TxKeyGuard<'a> {
    guard: Option<MutexGuard<'a, Box<dyn Encrypt>>>,
}

impl TxKeyGuard<'_> {
    pub fn encryptor(&mut self) -> Option<&mut (dyn Encrypt + 'static)> {
        self.guard.as_mut().map(|g| &mut ***g)
    }

    pub fn set_key(&mut self, key: &[u8]) -> std::result::Result<(), CryptoError> {
        self.encryptor().map_or(Ok(()), |e| e.set_key(key))
    }

    pub fn rekey(&mut self) -> std::result::Result<(), CryptoError> {
        self.encryptor().map_or(Ok(()), |e| e.rekey())
    }
}

/// Exclusive access to the receive key
pub struct RxKeyGuard<'a> {
    guard: Option<MutexGuard<'a, Box<dyn Decrypt>>>,
}

impl RxKeyGuard<'_> {
    pub fn decryptor(&mut self) -> Option<&mut (dyn Decrypt + 'static)> {
        self.guard.as_mut().map(|g| &mut ***g)
    }

    pub fn set_key(&mut self, key: &[u8]) -> std::result::Result<(), CryptoError> {
        self.decryptor().map_or(Ok(()), |d| d.set_key(key))
    }

    pub fn rekey(&mut self) -> std::result::Result<(), CryptoError> {
        self.decryptor().map_or(Ok(()), |d| d.rekey())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use d2dp_crypto::Role;
    use d2dp_io::MemorySocket;
    use d2dp_protocol::params::MIN_BUFFER_SIZE;
    use std::time::Duration;

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
            .with_buffer_size(64 * 1024)
            .with_ack_period(Duration::from_millis(1))
            .with_flush_timeout(Duration::from_secs(5))
    }

    fn pair(config: SessionConfig) -> (Session, Session) {
        let (a, b) = MemorySocket::pair();
        let a = a.with_poll_interval(Duration::from_millis(10));
        let b = b.with_poll_interval(Duration::from_millis(10));
        (
            Session::with_config(a, None, config.clone()).unwrap(),
            Session::with_config(b, None, config).unwrap(),
        )
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let (a, _b) = MemorySocket::pair();
        let config = SessionConfig::default().with_buffer_size(MIN_BUFFER_SIZE - 1);
        assert!(matches!(
            Session::with_config(a, None, config),
            Err(Error::Config(ConfigError::BufferSize(_)))
        ));
    }

    #[test]
    fn test_create_rejects_huge_overhead() {
        let (a, _b) = MemorySocket::pair();
        let mut security = Security::chacha20(b"secret", Role::Initiator).unwrap();
        security.overhead = DATAGRAM_SIZE - HEADER_SIZE;
        assert!(matches!(
            Session::create(a, Some(security)),
            Err(Error::Config(ConfigError::CryptoOverhead(1456)))
        ));
    }

    #[test]
    fn test_max_payload_accounts_for_crypto() {
        let (a, _b) = MemorySocket::pair();
        let security = Security::chacha20(b"secret", Role::Initiator).unwrap();
        let session = Session::with_config(a, Some(security), fast_config()).unwrap();
        assert_eq!(session.max_payload(), 1472 - 16 - 24);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_empty_calls_return_zero() {
        let (a, _b) = pair(fast_config());
        assert_eq!(a.send(&[], SendFlags::NONE).unwrap(), 0);
        assert_eq!(a.recv(&mut [], RecvFlags::WAITALL).unwrap(), 0);
    }

    #[test]
    fn test_oversized_requests() {
        let (a, _b) = pair(fast_config());
        let window = a.window_size();

        let big = vec![0u8; window + 1];
        assert!(matches!(
            a.send(&big, SendFlags::NONE),
            Err(Error::InvalidSize { .. })
        ));

        let mut out = vec![0u8; window + 1];
        assert!(matches!(
            a.recv(&mut out, RecvFlags::WAITALL),
            Err(Error::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_send_recv_and_close() {
        let (a, b) = pair(fast_config());

        assert_eq!(a.send(b"hello d2dp", SendFlags::NONE).unwrap(), 10);
        let mut buf = [0u8; 10];
        assert_eq!(b.recv(&mut buf, RecvFlags::WAITALL).unwrap(), 10);
        assert_eq!(&buf, b"hello d2dp");

        let stats = a.stats();
        assert!(stats.data_sent >= 1);
        assert!(stats.tx_packet_id >= 1);

        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn test_recv_vectored_fills_in_order() {
        let (a, b) = pair(fast_config());
        a.send_vectored(&[&b"abc"[..], &b"defg"[..]], SendFlags::NONE)
            .unwrap();

        let mut first = [0u8; 2];
        let mut second = [0u8; 5];
        let n = b
            .recv_vectored(&mut [&mut first[..], &mut second[..]], RecvFlags::WAITALL)
            .unwrap();
        assert_eq!(n, 7);
        assert_eq!(&first, b"ab");
        assert_eq!(&second, b"cdefg");
    }

    #[test]
    fn test_recv_timeout() {
        let (a, _b) = pair(fast_config());
        a.set_option(SessionOption::RecvTimeout(20)).unwrap();
        assert_eq!(
            a.get_option(OptionName::RecvTimeout),
            SessionOption::RecvTimeout(20)
        );

        let mut buf = [0u8; 4];
        let started = Instant::now();
        assert!(matches!(
            a.recv(&mut buf, RecvFlags::NONE),
            Err(Error::TimedOut)
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));

        assert!(matches!(
            a.set_option(SessionOption::RecvTimeout(-5)),
            Err(Error::InvalidOption)
        ));
    }

    #[test]
    fn test_interrupt_wakes_reader() {
        let (a, _b) = pair(fast_config());

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut buf = [0u8; 4];
                a.recv(&mut buf, RecvFlags::NONE)
            });
            thread::sleep(Duration::from_millis(30));
            a.interrupt();
            assert!(matches!(reader.join().unwrap(), Err(Error::Interrupted)));
        });

        // later calls are not affected
        a.set_option(SessionOption::RecvTimeout(10)).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            a.recv(&mut buf, RecvFlags::NONE),
            Err(Error::TimedOut)
        ));
    }

    #[test]
    fn test_key_update_pending() {
        let (a, b) = pair(fast_config());

        a.send(b"rotate", SendFlags::KEY_UPDATE).unwrap();
        // the barrier clears once the peer acknowledges it
        let mut buf = [0u8; 6];
        b.recv(&mut buf, RecvFlags::WAITALL).unwrap();

        let mut guard = a.tx_key_lock().unwrap();
        assert!(guard.encryptor().is_none());
        guard.rekey().unwrap();
        drop(guard);

        a.send(b"again", SendFlags::KEY_UPDATE).unwrap();
        let second = a.send(b"third", SendFlags::KEY_UPDATE);
        // the peer may already have acknowledged the second barrier
        assert!(matches!(second, Ok(5) | Err(Error::KeyUpdatePending)));
    }

    #[test]
    fn test_recv_after_fatal_error() {
        let (a, b) = pair(fast_config());
        a.send(b"buffered", SendFlags::NONE).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while b.shared.rx.lock().buffer.available_bytes() < 8 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(b.shared.rx.lock().buffer.available_bytes(), 8);

        b.shared.set_fatal(LinkError::RetryLimit);
        let mut buf = [0u8; 8];
        for _ in 0..2 {
            assert!(matches!(
                b.recv(&mut buf, RecvFlags::NONE),
                Err(Error::Protocol(LinkError::RetryLimit))
            ));
        }
    }

    #[test]
    fn test_close_times_out_without_peer() {
        let (a, b) = MemorySocket::pair();
        drop(b);
        let config = fast_config().with_flush_timeout(Duration::from_millis(50));
        let session = Session::with_config(a, None, config).unwrap();

        session.send(b"nobody listens", SendFlags::NONE).unwrap();
        assert!(matches!(session.close(), Err(Error::FlushTimedOut)));
    }
}
