//! Image encryption uses AES-256 in CBC mode with PKCS#7 padding, authenticated
//! with HMAC-SHA256 (encrypt-then-MAC).
//!
//! The user's passphrase is the only secret. It's hashed with SHA-256 into a
//! 256-bit key, so the same passphrase always reproduces the same key and
//! nothing secret has to be stored on the server. That key is never used
//! directly: HKDF-SHA256 expands it into an AES key and an HMAC key.
//!
//! Every encryption draws a fresh random 128-bit IV. The stored unit is:
//!
//! - IV (128 bits)
//! - tag (256 bits) - HMAC-SHA256 of IV followed by ciphertext
//! - ciphertext - a non-empty multiple of the AES block size
//!
//! On decryption the tag is checked before any block is decrypted, so a wrong
//! passphrase and a corrupted blob produce the same [`CryptoError::DecryptionFailed`]
//! and padding errors can't be observed separately. A ciphertext with an
//! impossible length is reported as [`CryptoError::MalformedCiphertext`] because
//! no key could have produced it.

mod cipher;
mod kdf;

pub use {
    cipher::{Cipher, EncryptedImage},
    kdf::{KeyMaterial, derive_key},
};

/// AES block size, also the IV length.
pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption key is empty")]
    InvalidKeyInput,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("ciphertext length is not a positive multiple of the block size")]
    MalformedCiphertext,
}
