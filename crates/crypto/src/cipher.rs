use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};

use crate::CryptoError;
use crate::keys::ChunkKey;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Nonce that sealed one chunk.
///
/// Only [`encrypt_chunk`] creates fresh nonces; [`ChunkNonce::from_slice`]
/// exists to read one back off the wire for decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkNonce([u8; NONCE_LEN]);

impl ChunkNonce {
    /// Parses a received nonce.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let nonce: [u8; NONCE_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidNonce(bytes.len()))?;
        Ok(Self(nonce))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// Ciphertext (with GCM tag) and the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    pub ciphertext: Vec<u8>,
    pub nonce: ChunkNonce,
}

/// Encrypts one chunk under a freshly drawn nonce.
pub fn encrypt_chunk(plaintext: &[u8], key: &ChunkKey) -> Result<EncryptedChunk, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    Ok(EncryptedChunk {
        ciphertext,
        nonce: ChunkNonce(nonce_bytes),
    })
}

/// Decrypts and authenticates one chunk.
pub fn decrypt_chunk(
    ciphertext: &[u8],
    key: &ChunkKey,
    nonce: &ChunkNonce,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&nonce.0), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}
