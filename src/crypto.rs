//! Symmetric packet cipher: AES-256-CTR with a random per-record IV.
//!
//! A record is `iv(16) || keystream XOR plaintext`. The cipher carries no
//! authentication tag; channel integrity comes from the TLS transport.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;

type Aes256Ctr = Ctr128BE<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
    #[error("ciphertext too short ({0} bytes)")]
    ShortCiphertext(usize),
}

/// Per-session packet cipher. The key is shared today, but each session
/// holds its own instance so per-session keys stay possible.
#[derive(Clone)]
pub struct PacketCipher {
    key: [u8; KEY_LEN],
}

impl PacketCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::BadKeyLength(key.len()));
        }
        let mut k = [0u8; KEY_LEN];
        k.copy_from_slice(key);
        Ok(Self { key: k })
    }

    /// Encrypt one packet into a fresh record with a random IV prefix.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut record = vec![0u8; IV_LEN + plaintext.len()];
        rand::thread_rng().fill_bytes(&mut record[..IV_LEN]);
        record[IV_LEN..].copy_from_slice(plaintext);
        let iv: [u8; IV_LEN] = record[..IV_LEN].try_into().expect("iv length");
        let mut ctr = Aes256Ctr::new(&self.key.into(), &iv.into());
        ctr.apply_keystream(&mut record[IV_LEN..]);
        record
    }

    /// Recover the packet from a record.
    pub fn decrypt(&self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < IV_LEN {
            return Err(CryptoError::ShortCiphertext(record.len()));
        }
        let iv: [u8; IV_LEN] = record[..IV_LEN].try_into().expect("iv length");
        let mut plaintext = record[IV_LEN..].to_vec();
        let mut ctr = Aes256Ctr::new(&self.key.into(), &iv.into());
        ctr.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }
}

/// Constant-time comparison for shared-key material.
pub fn keys_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
