//! Composable byte-stream transforms for partition image files.
//!
//! Writing: plaintext → gzip → AES-256-CBC (IV prepended) → file.
//! Reading: file → IV + AES-256-CBC → gunzip → plaintext.
//!
//! Every layer is a streaming adapter; nothing buffers a whole partition.

pub mod compress;
pub mod crypto;
pub mod digest;

pub use digest::{sha256_hex, sha256_reader, short_digest, HashingReader};

use crypto::{CbcDecryptReader, CbcEncryptWriter, Key};
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, Read, Write};

/// A writer that must be finished explicitly, layer by layer.
///
/// Dropping a layered writer without finishing it loses the gzip trailer or
/// the final cipher block.
pub trait LayeredWrite: Write + Send {
    /// Finish this layer, then the one beneath it.
    fn finish_layer(self: Box<Self>) -> io::Result<()>;
}

impl LayeredWrite for File {
    fn finish_layer(mut self: Box<Self>) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl LayeredWrite for GzEncoder<Box<dyn LayeredWrite>> {
    fn finish_layer(self: Box<Self>) -> io::Result<()> {
        let inner = (*self).finish()?;
        inner.finish_layer()
    }
}

impl LayeredWrite for CbcEncryptWriter<Box<dyn LayeredWrite>> {
    fn finish_layer(self: Box<Self>) -> io::Result<()> {
        let inner = (*self).finish()?;
        inner.finish_layer()
    }
}

/// Which transforms apply to one entry file.
#[derive(Clone, Default)]
pub struct Pipeline {
    compress: bool,
    key: Option<Key>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.debug_struct("Pipeline")
            .field("compress", &self.compress)
            .field("encrypt", &self.key.is_some())
            .finish()
    }
}

impl Pipeline {
    pub fn new(compress: bool, key: Option<Key>) -> Self {
        Self { compress, key }
    }

    /// Raw bytes, no transforms.
    pub fn plain() -> Self {
        Self::default()
    }

    /// Pipeline for a manifest entry, deriving the key from `serial` when
    /// the entry is encrypted.
    pub fn for_entry(is_compressed: bool, is_encrypted: bool, serial: &str) -> Self {
        let key = is_encrypted.then(|| crypto::derive_key(serial));
        Self::new(is_compressed, key)
    }

    pub fn compresses(&self) -> bool {
        self.compress
    }

    pub fn encrypts(&self) -> bool {
        self.key.is_some()
    }

    /// Build the read chain over `source`.
    ///
    /// For encrypted files this consumes the 16-byte IV immediately.
    pub fn reader<'a>(
        &self,
        source: Box<dyn Read + Send + 'a>,
    ) -> io::Result<Box<dyn Read + Send + 'a>> {
        let mut stream = source;

        if let Some(key) = &self.key {
            let iv = crypto::read_iv(&mut stream)?;
            stream = Box::new(CbcDecryptReader::new(stream, key, &iv));
        }

        if self.compress {
            stream = Box::new(compress::decompress_reader(stream));
        }

        Ok(stream)
    }

    /// Build the write chain over `sink`.
    ///
    /// For encrypted files a fresh IV is written to `sink` immediately.
    pub fn writer(&self, sink: Box<dyn LayeredWrite>) -> io::Result<Box<dyn LayeredWrite>> {
        let mut stream = sink;

        if let Some(key) = &self.key {
            let iv = crypto::random_iv();
            stream.write_all(&iv)?;
            stream = Box::new(CbcEncryptWriter::new(stream, key, &iv));
        }

        if self.compress {
            stream = Box::new(compress::compress_writer(stream));
        }

        Ok(stream)
    }
}
