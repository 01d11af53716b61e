//! D2DP Encryption
//!
//! The transport seals every datagram right before it is handed to the
//! socket and opens every datagram right after it is received. This crate
//! defines that pluggable capability ([`Encrypt`], [`Decrypt`] and the
//! [`Security`] bundle) and ships a ChaCha20-Poly1305 backend built on ring.

pub mod aead;

use thiserror::Error;

pub use aead::{derive_key, next_key, ChaChaOpener, ChaChaSealer, Role, KEY_LEN, OVERHEAD};

/// Crypto errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Sealed datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("Authentication failed")]
    Authentication,

    #[error("Nonce counter exhausted")]
    NonceExhausted,

    #[error("Invalid key length: {0}")]
    InvalidKey(usize),
}

impl From<ring::error::Unspecified> for CryptoError {
    fn from(_: ring::error::Unspecified) -> Self {
        CryptoError::Authentication
    }
}

/// Seals outgoing datagrams
pub trait Encrypt: Send {
    /// Seal `src` into `dst`, returning the number of bytes written
    fn encrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CryptoError>;

    /// Replace the sealing key
    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError>;

    /// Move to the next key of the ratchet
    fn rekey(&mut self) -> Result<(), CryptoError>;
}

/// Opens incoming datagrams
pub trait Decrypt: Send {
    /// Open `src` into `dst`, returning the plaintext length
    fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CryptoError>;

    /// Replace the opening key
    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError>;

    /// Move to the next key of the ratchet
    fn rekey(&mut self) -> Result<(), CryptoError>;
}

/// Encryption capability handed to a session
///
/// `overhead` is the number of bytes sealing adds to a datagram; the
/// session shrinks its payload size by that much.
pub struct Security {
    pub overhead: usize,
    pub encryptor: Box<dyn Encrypt>,
    pub decryptor: Box<dyn Decrypt>,
}

impl Security {
    pub fn new(
        overhead: usize,
        encryptor: Box<dyn Encrypt>,
        decryptor: Box<dyn Decrypt>,
    ) -> Self {
        Security {
            overhead,
            encryptor,
            decryptor,
        }
    }

    /// ChaCha20-Poly1305 in both directions with keys derived from a
    /// shared secret
    ///
    /// The two ends of a link must use opposite roles.
    pub fn chacha20(secret: &[u8], role: Role) -> Result<Self, CryptoError> {
        let tx_key = derive_key(secret, role)?;
        let rx_key = derive_key(secret, role.opposite())?;

        Ok(Security::new(
            OVERHEAD,
            Box::new(ChaChaSealer::new(&tx_key)?),
            Box::new(ChaChaOpener::new(&rx_key)?),
        ))
    }
}

impl std::fmt::Debug for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Security")
            .field("overhead", &self.overhead)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_roles_interoperate() {
        let mut a = Security::chacha20(b"shared secret", Role::Initiator).unwrap();
        let mut b = Security::chacha20(b"shared secret", Role::Responder).unwrap();
        assert_eq!(a.overhead, OVERHEAD);

        let mut sealed = [0u8; 64];
        let mut opened = [0u8; 64];

        let n = a.encryptor.encrypt(b"a to b", &mut sealed).unwrap();
        let m = b.decryptor.decrypt(&sealed[..n], &mut opened).unwrap();
        assert_eq!(&opened[..m], b"a to b");

        let n = b.encryptor.encrypt(b"b to a", &mut sealed).unwrap();
        let m = a.decryptor.decrypt(&sealed[..n], &mut opened).unwrap();
        assert_eq!(&opened[..m], b"b to a");
    }

    #[test]
    fn test_same_role_cannot_talk() {
        let mut a = Security::chacha20(b"shared secret", Role::Initiator).unwrap();
        let mut b = Security::chacha20(b"shared secret", Role::Initiator).unwrap();

        let mut sealed = [0u8; 64];
        let mut opened = [0u8; 64];
        let n = a.encryptor.encrypt(b"hello", &mut sealed).unwrap();
        assert_eq!(
            b.decryptor.decrypt(&sealed[..n], &mut opened),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn test_rekey_in_lockstep() {
        let mut a = Security::chacha20(b"k", Role::Initiator).unwrap();
        let mut b = Security::chacha20(b"k", Role::Responder).unwrap();
        let mut sealed = [0u8; 64];
        let mut opened = [0u8; 64];

        a.encryptor.rekey().unwrap();
        let n = a.encryptor.encrypt(b"new key", &mut sealed).unwrap();
        assert!(b.decryptor.decrypt(&sealed[..n], &mut opened).is_err());

        b.decryptor.rekey().unwrap();
        let m = b.decryptor.decrypt(&sealed[..n], &mut opened).unwrap();
        assert_eq!(&opened[..m], b"new key");
    }
}
