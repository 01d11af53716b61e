//! ChaCha20-Poly1305 backend
//!
//! Sealed datagram layout:
//!
//! ```text
//! [ nonce counter (8, BE) | ciphertext | tag (16) ]
//! ```
//!
//! The 96-bit nonce is four zero bytes followed by the counter, which
//! increases by one per sealed datagram and never repeats under one key.
//! Keys ratchet forward with HKDF-SHA256, so both ends of a link can rotate
//! without exchanging key material.

use crate::{CryptoError, Decrypt, Encrypt};
use ring::{aead, hkdf};

/// Key length in bytes
pub const KEY_LEN: usize = 32;

const COUNTER_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// Bytes sealing adds to every datagram
pub const OVERHEAD: usize = COUNTER_LEN + TAG_LEN;

const DERIVE_SALT: &[u8] = b"d2dp key derivation v1";
const RATCHET_SALT: &[u8] = b"d2dp key ratchet v1";

/// Which end of a link derives which direction's key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"initiator to responder",
            Role::Responder => b"responder to initiator",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

fn expand(salt: &[u8], secret: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(secret);
    let info = [info];
    let okm = prk.expand(&info, hkdf::HKDF_SHA256)?;

    let mut key = [0u8; KEY_LEN];
    okm.fill(&mut key)?;
    Ok(key)
}

/// Derive the key for traffic sent by `role` from a shared secret
pub fn derive_key(secret: &[u8], role: Role) -> Result<[u8; KEY_LEN], CryptoError> {
    expand(DERIVE_SALT, secret, role.label())
}

/// Next key of the ratchet
pub fn next_key(key: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
    expand(RATCHET_SALT, key, b"next")
}

fn make_key(key: &[u8]) -> Result<aead::LessSafeKey, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey(key.len()));
    }
    let unbound = aead::UnboundKey::new(&aead::CHACHA20_POLY1305, key)
        .map_err(|_| CryptoError::InvalidKey(key.len()))?;
    Ok(aead::LessSafeKey::new(unbound))
}

fn nonce(counter: u64) -> aead::Nonce {
    let mut bytes = [0u8; aead::NONCE_LEN];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    aead::Nonce::assume_unique_for_key(bytes)
}

fn to_array(key: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    key.try_into().map_err(|_| CryptoError::InvalidKey(key.len()))
}

/// Sealing half of a ChaCha20-Poly1305 link
pub struct ChaChaSealer {
    secret: [u8; KEY_LEN],
    key: aead::LessSafeKey,
    counter: u64,
}

impl ChaChaSealer {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        Ok(ChaChaSealer {
            secret: to_array(key)?,
            key: make_key(key)?,
            counter: 0,
        })
    }

    /// Datagrams sealed under the current key
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Encrypt for ChaChaSealer {
    fn encrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CryptoError> {
        let needed = src.len() + OVERHEAD;
        if dst.len() < needed {
            return Err(CryptoError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }

        let counter = self.counter;
        self.counter = counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;

        let (head, rest) = dst.split_at_mut(COUNTER_LEN);
        head.copy_from_slice(&counter.to_be_bytes());
        let (body, tail) = rest.split_at_mut(src.len());
        body.copy_from_slice(src);

        let tag = self
            .key
            .seal_in_place_separate_tag(nonce(counter), aead::Aad::empty(), body)?;
        tail[..TAG_LEN].copy_from_slice(tag.as_ref());

        Ok(needed)
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        self.key = make_key(key)?;
        self.secret = to_array(key)?;
        self.counter = 0;
        Ok(())
    }

    fn rekey(&mut self) -> Result<(), CryptoError> {
        let next = next_key(&self.secret)?;
        tracing::debug!(sealed = self.counter, "rotating sealing key");
        self.set_key(&next)
    }
}

/// Opening half of a ChaCha20-Poly1305 link
pub struct ChaChaOpener {
    secret: [u8; KEY_LEN],
    key: aead::LessSafeKey,
}

impl ChaChaOpener {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        Ok(ChaChaOpener {
            secret: to_array(key)?,
            key: make_key(key)?,
        })
    }
}

impl Decrypt for ChaChaOpener {
    fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CryptoError> {
        if src.len() < OVERHEAD {
            return Err(CryptoError::Truncated(src.len()));
        }

        let sealed_len = src.len() - COUNTER_LEN;
        if dst.len() < sealed_len {
            return Err(CryptoError::BufferTooSmall {
                needed: sealed_len,
                available: dst.len(),
            });
        }

        let mut counter = [0u8; COUNTER_LEN];
        counter.copy_from_slice(&src[..COUNTER_LEN]);
        let counter = u64::from_be_bytes(counter);

        let sealed = &mut dst[..sealed_len];
        sealed.copy_from_slice(&src[COUNTER_LEN..]);
        let plain = self
            .key
            .open_in_place(nonce(counter), aead::Aad::empty(), sealed)?;

        Ok(plain.len())
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        self.key = make_key(key)?;
        self.secret = to_array(key)?;
        Ok(())
    }

    fn rekey(&mut self) -> Result<(), CryptoError> {
        let next = next_key(&self.secret)?;
        tracing::debug!("rotating opening key");
        self.set_key(&next)
    }
}
