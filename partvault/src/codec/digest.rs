//! SHA-256 digesting for partition payloads.

use sha2::{Digest, Sha256};
use std::io::{self, Read};

/// Digest of a byte slice as lower-case hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// First 8 hex characters, for log lines.
pub fn short_digest(hex_digest: &str) -> &str {
    hex_digest.get(..8).unwrap_or(hex_digest)
}

/// Drain a reader, returning its SHA-256 (hex) and length.
pub fn sha256_reader<R: Read>(reader: R, chunk_size: usize) -> io::Result<(String, u64)> {
    let mut hashing = HashingReader::new(reader);
    crate::transfer::copy_chunked(&mut hashing, &mut io::sink(), chunk_size)?;
    Ok(hashing.finalize())
}

/// Reader wrapper that hashes and counts everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Consume the wrapper, returning the hex digest and byte count.
    pub fn finalize(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes_read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}
