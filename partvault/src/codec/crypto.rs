//! AES-256-CBC stream adapters and serial-based key derivation.
//!
//! The key is derived from the device serial with a fixed salt. Anyone who
//! knows the serial can derive it, so this layer is obfuscation, not
//! confidentiality. It is kept bit-for-bit so existing encrypted backups stay
//! restorable.
//!
//! Encrypted file layout: 16-byte random IV, then AES-256-CBC ciphertext with
//! PKCS#7 padding.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::Sha256;
use std::io::{self, Read, Write};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const BLOCK_SIZE: usize = 16;
pub const IV_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

const KEY_SALT: &[u8] = b"DeepEyeSalt";
const KEY_ITERATIONS: u32 = 1000;

/// Ciphertext pulled from the inner reader per refill.
const READ_CHUNK: usize = 64 * 1024;

pub type Key = [u8; KEY_LEN];
pub type Iv = [u8; IV_LEN];

/// PBKDF2-HMAC-SHA256(serial, fixed salt, 1000 rounds) -> 32-byte key.
pub fn derive_key(serial: &str) -> Key {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(serial.as_bytes(), KEY_SALT, KEY_ITERATIONS, &mut key);
    key
}

/// Fresh random IV for a new encrypted file.
pub fn random_iv() -> Iv {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Read the IV that prefixes an encrypted file.
pub fn read_iv<R: Read>(source: &mut R) -> io::Result<Iv> {
    let mut iv = [0u8; IV_LEN];
    source.read_exact(&mut iv).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => invalid_data("encrypted stream shorter than its IV"),
        _ => e,
    })?;
    Ok(iv)
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Push-based encryptor. Call [`CbcEncryptWriter::finish`] to emit the final
/// padded block; dropping it without finishing truncates the ciphertext.
pub struct CbcEncryptWriter<W: Write> {
    inner: W,
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl<W: Write> CbcEncryptWriter<W> {
    /// Wrap `inner`. The IV is not written here; callers prefix it.
    pub fn new(inner: W, key: &Key, iv: &Iv) -> Self {
        Self {
            inner,
            cipher: Aes256CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
            pending: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Pad, encrypt the tail and hand back the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        let pad = BLOCK_SIZE - self.pending.len() % BLOCK_SIZE;
        self.pending.extend(std::iter::repeat(pad as u8).take(pad));

        let mut tail = std::mem::take(&mut self.pending);
        self.encrypt_in_place(&mut tail);
        self.inner.write_all(&tail)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn encrypt_in_place(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

impl<W: Write> Write for CbcEncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);

        let full = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        if full > 0 {
            let mut ready = std::mem::take(&mut self.pending);
            self.pending = ready.split_off(full);
            self.encrypt_in_place(&mut ready);
            self.inner.write_all(&ready)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // A partial block can only be written by finish()
        self.inner.flush()
    }
}

/// Pull-based decryptor. The last ciphertext block is held back until the
/// inner reader is exhausted so its padding can be stripped.
pub struct CbcDecryptReader<R: Read> {
    inner: R,
    cipher: Aes256CbcDec,
    ciphertext: Vec<u8>,
    plaintext: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> CbcDecryptReader<R> {
    /// Wrap `inner`, positioned just after the IV.
    pub fn new(inner: R, key: &Key, iv: &Iv) -> Self {
        Self {
            inner,
            cipher: Aes256CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
            ciphertext: Vec::with_capacity(READ_CHUNK + BLOCK_SIZE),
            plaintext: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn decrypt_in_place(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    /// Refill `plaintext`. Returns false once the stream is fully drained.
    fn refill(&mut self) -> io::Result<bool> {
        if self.finished {
            return Ok(false);
        }

        let mut chunk = vec![0u8; READ_CHUNK];
        let n = loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.finished = true;
            if self.ciphertext.is_empty() || self.ciphertext.len() % BLOCK_SIZE != 0 {
                return Err(invalid_data("truncated ciphertext"));
            }

            let mut last = std::mem::take(&mut self.ciphertext);
            self.decrypt_in_place(&mut last);

            let pad = *last.last().unwrap_or(&0) as usize;
            if pad == 0 || pad > BLOCK_SIZE || !last[last.len() - pad..].iter().all(|&b| b as usize == pad) {
                return Err(invalid_data("invalid padding"));
            }
            last.truncate(last.len() - pad);

            self.plaintext = last;
            self.pos = 0;
            return Ok(true);
        }

        self.ciphertext.extend_from_slice(&chunk[..n]);

        // Keep at least one whole block (the candidate padding block) back
        let full = self.ciphertext.len() - self.ciphertext.len() % BLOCK_SIZE;
        if full > BLOCK_SIZE {
            let release = full - BLOCK_SIZE;
            let rest = self.ciphertext.split_off(release);
            let mut ready = std::mem::replace(&mut self.ciphertext, rest);
            self.decrypt_in_place(&mut ready);
            self.plaintext = ready;
            self.pos = 0;
        }

        Ok(true)
    }
}

impl<R: Read> Read for CbcDecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos >= self.plaintext.len() {
            if !self.refill()? {
                return Ok(0);
            }
        }

        let n = buf.len().min(self.plaintext.len() - self.pos);
        buf[..n].copy_from_slice(&self.plaintext[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
