// crates/memvault-gateway/src/crypto.rs
// ChaCha20-Poly1305 sealing of memory content

use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use memvault_vault::SecureBuffer;
use thiserror::Error;
use zeroize::Zeroizing;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// Name recorded in key metadata
pub const ALGORITHM: &str = "chacha20poly1305";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length {0}, expected {KEY_SIZE}")]
    InvalidKeyLength(usize),

    #[error("invalid nonce length {0}, expected {NONCE_SIZE}")]
    InvalidNonceLength(usize),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: wrong key or tampered ciphertext")]
    DecryptionFailed,
}

/// Ciphertext plus the nonce it was sealed with
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// Fresh random data key.
pub fn generate_key() -> SecureBuffer {
    let mut key = SecureBuffer::new(KEY_SIZE);
    OsRng.fill_bytes(key.expose_mut());
    key
}

fn cipher(key: &SecureBuffer) -> Result<ChaCha20Poly1305, CryptoError> {
    ChaCha20Poly1305::new_from_slice(key.expose())
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}

/// Encrypt under a new random nonce. `aad` is authenticated but not stored.
pub fn seal(key: &SecureBuffer, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = cipher(key)?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(Sealed {
        ciphertext,
        nonce: nonce.into(),
    })
}

/// Decrypt and authenticate. The plaintext is wiped when dropped.
pub fn open(
    key: &SecureBuffer,
    ciphertext: &[u8],
    nonce: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonceLength(nonce.len()));
    }
    let cipher = cipher(key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_key();
        let sealed = seal(&key, b"hello world", b"m1").unwrap();
        let plain = open(&key, &sealed.ciphertext, &sealed.nonce, b"m1").unwrap();
        assert_eq!(plain.as_slice(), b"hello world");
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let key = generate_key();
        let a = seal(&key, b"same", b"").unwrap();
        let b = seal(&key, b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(open(&key, &a.ciphertext, &a.nonce, b"").unwrap().as_slice(), b"same");
        assert_eq!(open(&key, &b.ciphertext, &b.nonce, b"").unwrap().as_slice(), b"same");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&generate_key(), b"secret", b"").unwrap();
        let err = open(&generate_key(), &sealed.ciphertext, &sealed.nonce, b"").unwrap_err();
        assert_eq!(err, CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let key = generate_key();
        let sealed = seal(&key, b"secret", b"m1").unwrap();
        assert!(open(&key, &sealed.ciphertext, &sealed.nonce, b"m2").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_key();
        let mut sealed = seal(&key, b"secret", b"").unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(open(&key, &sealed.ciphertext, &sealed.nonce, b"").is_err());
    }

    #[test]
    fn test_bad_lengths() {
        let short = SecureBuffer::from_slice(&[0u8; 16]);
        assert_eq!(
            seal(&short, b"x", b"").unwrap_err(),
            CryptoError::InvalidKeyLength(16)
        );
        let key = generate_key();
        assert_eq!(
            open(&key, b"whatever", &[0u8; 8], b"").unwrap_err(),
            CryptoError::InvalidNonceLength(8)
        );
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(a.len(), KEY_SIZE);
        assert_ne!(a, b);
    }
}
