//! Per-transfer chunk encryption.
//!
//! Each transfer gets a fresh AES-256-GCM key, exported as base64 inside the
//! transfer's start message. Every chunk is sealed under its own random
//! 96-bit nonce; the nonce is drawn inside [`encrypt_chunk`] and callers
//! cannot provide one.

mod cipher;
mod keys;

pub use cipher::{ChunkNonce, EncryptedChunk, NONCE_LEN, decrypt_chunk, encrypt_chunk};
pub use keys::{ChunkKey, KEY_LEN, export_key, generate_key, import_key};

/// Errors produced by the encryption module.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid nonce length: expected 12 bytes, got {0}")]
    InvalidNonce(usize),

    #[error("encryption failed")]
    Encryption,

    /// Authentication failed: wrong key, corrupted ciphertext or a nonce
    /// that does not belong to the ciphertext.
    #[error("decryption failed")]
    Decryption,
}
