use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::CryptoError;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Symmetric key for one transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkKey([u8; KEY_LEN]);

impl ChunkKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChunkKey(..)")
    }
}

/// Generates a random 256-bit key.
pub fn generate_key() -> ChunkKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    ChunkKey(key)
}

/// Encodes the raw key as base64 for the start message.
pub fn export_key(key: &ChunkKey) -> String {
    BASE64.encode(key.0)
}

/// Decodes a key exported by [`export_key`].
pub fn import_key(encoded: &str) -> Result<ChunkKey, CryptoError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let key: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))?;
    Ok(ChunkKey(key))
}
