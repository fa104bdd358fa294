use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::TransferError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Number of chunks needed for `size` bytes: `ceil(size / chunk_size)`.
///
/// `None` when the count does not fit a chunk index.
pub fn total_chunks(size: u64, chunk_size: usize) -> Option<u32> {
    let chunk_size = chunk_size.max(1) as u64;
    u32::try_from(size.div_ceil(chunk_size)).ok()
}

/// Splits a file body into fixed-size, indexed plaintext slices.
///
/// Every chunk is `chunk_size` bytes except possibly the last one. An empty
/// body yields no chunks.
pub struct ChunkReader<'a> {
    data: &'a [u8],
    chunk_size: usize,
    index: u32,
    offset: usize,
}

impl<'a> ChunkReader<'a> {
    /// If `chunk_size` is 0, [`crate::CHUNK_SIZE`] is used.
    pub fn new(data: &'a [u8], chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            crate::CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            data,
            chunk_size,
            index: 0,
            offset: 0,
        }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl<'a> Iterator for ChunkReader<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = &self.data[self.offset..end];
        let index = self.index;
        self.offset = end;
        self.index += 1;
        Some((index, chunk))
    }
}

/// A file queued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    /// MIME type, may be empty.
    pub content_type: String,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Reads a file from disk. The name is the path's final component.
    pub fn from_path(path: &Path, content_type: impl Into<String>) -> Result<Self, TransferError> {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, content_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// SHA-256 hex digest of the whole body.
    pub fn checksum(&self) -> String {
        checksum_bytes(&self.data)
    }
}
