//! Application messages carried over a D2DP stream
//!
//! ```text
//! [ kind (1) | length (4, BE) | payload ]
//! ```
//!
//! `KeyUpdate` is the last message sealed under the old transmit key. The
//! sender rotates right after it has been acknowledged, the receiver right
//! after reading it.

use bytes::{Buf, BufMut};
use d2dp::{RecvFlags, SendFlags, Session};

const KIND_DATA: u8 = 1;
const KIND_KEY_UPDATE: u8 = 2;
const KIND_END: u8 = 3;

/// Message header size
pub const MESSAGE_HEADER_SIZE: usize = 5;

/// Application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data(Vec<u8>),
    KeyUpdate,
    End,
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Session error: {0}")]
    Session(#[from] d2dp::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] d2dp::crypto::CryptoError),

    #[error("Unknown message kind {0}")]
    UnknownKind(u8),

    #[error("Message of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

impl Message {
    fn kind(&self) -> u8 {
        match self {
            Message::Data(_) => KIND_DATA,
            Message::KeyUpdate => KIND_KEY_UPDATE,
            Message::End => KIND_END,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Message::Data(data) => data,
            _ => &[],
        }
    }

    pub fn encode_header(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut header = [0u8; MESSAGE_HEADER_SIZE];
        let mut buf = &mut header[..];
        buf.put_u8(self.kind());
        buf.put_u32(self.payload().len() as u32);
        header
    }
}

/// Write one message; `KeyUpdate` also rotates the transmit key
pub fn write_message(session: &Session, message: &Message) -> Result<(), FramingError> {
    let header = message.encode_header();
    let payload = message.payload();
    if MESSAGE_HEADER_SIZE + payload.len() > session.window_size() {
        return Err(FramingError::TooLarge(payload.len()));
    }

    match message {
        Message::KeyUpdate => {
            session.send(&header, SendFlags::KEY_UPDATE)?;
            let mut key = session.tx_key_lock()?;
            key.rekey()?;
            tracing::info!("transmit key rotated");
        }
        _ => {
            session.send_vectored(&[&header[..], payload], SendFlags::NONE)?;
        }
    }
    Ok(())
}

/// Read one message; `KeyUpdate` also rotates the receive key
pub fn read_message(session: &Session, max_payload: usize) -> Result<Message, FramingError> {
    let mut header = [0u8; MESSAGE_HEADER_SIZE];
    session.recv(&mut header, RecvFlags::WAITALL)?;

    let mut buf = &header[..];
    let kind = buf.get_u8();
    let len = buf.get_u32() as usize;
    if len > max_payload {
        return Err(FramingError::TooLarge(len));
    }

    match kind {
        KIND_DATA => {
            let mut data = vec![0u8; len];
            let mut filled = 0;
            // the payload may be larger than one WAITALL read can wait for
            while filled < len {
                let chunk = (len - filled).min(session.window_size() / 2);
                filled += session.recv(&mut data[filled..filled + chunk], RecvFlags::WAITALL)?;
            }
            Ok(Message::Data(data))
        }
        KIND_KEY_UPDATE => {
            session.rx_key_lock().rekey()?;
            tracing::info!("receive key rotated");
            Ok(Message::KeyUpdate)
        }
        KIND_END => Ok(Message::End),
        other => Err(FramingError::UnknownKind(other)),
    }
}
