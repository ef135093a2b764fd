//! Backup integrity validation, run before any restore write.

use crate::codec::{sha256_reader, Pipeline};
use crate::manifest::archive::OpenedBackup;
use crate::manifest::{self, PartitionBackupEntry};
use crate::transfer::COPY_CHUNK_SIZE;
use crate::{Result, VaultError};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// Decides whether a backup may be restored onto a device.
pub trait BackupValidator {
    /// `manifest_path` is a backup directory, its `manifest.json`, or an
    /// archive.
    fn validate(&self, manifest_path: &Path, device_serial: &str) -> bool;
}

impl<F> BackupValidator for F
where
    F: Fn(&Path, &str) -> bool,
{
    fn validate(&self, manifest_path: &Path, device_serial: &str) -> bool {
        self(manifest_path, device_serial)
    }
}

/// Checks the serial match, then hashes every entry through its pipeline.
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    chunk_size: usize,
}

impl Default for IntegrityValidator {
    fn default() -> Self {
        Self {
            chunk_size: COPY_CHUNK_SIZE,
        }
    }
}

impl IntegrityValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Like [`BackupValidator::validate`], but says why a backup was rejected.
    pub fn check(&self, manifest_path: &Path, device_serial: &str) -> Result<()> {
        let backup = OpenedBackup::open(manifest_path)?;
        let manifest = manifest::load(backup.dir())?;

        if manifest.device_serial != device_serial {
            return Err(VaultError::Validation(format!(
                "backup serial {} does not match device serial {}",
                manifest.device_serial, device_serial
            )));
        }

        for entry in &manifest.partitions {
            let path = entry.resolve_file(backup.dir())?;
            if !path.is_file() {
                return Err(VaultError::Validation(format!(
                    "missing file {} for {}",
                    entry.file_name, entry.name
                )));
            }

            match entry_digest(entry, &path, device_serial, self.chunk_size) {
                Ok((digest, len)) if digest == entry.sha256 && len == entry.size_bytes => {
                    debug!("Verified {}", entry.name);
                }
                Ok((_, len)) if len != entry.size_bytes => {
                    return Err(VaultError::Validation(format!(
                        "{} decodes to {} bytes, manifest says {}",
                        entry.name, len, entry.size_bytes
                    )))
                }
                Ok(_) => {
                    return Err(VaultError::Validation(format!(
                        "integrity check failed for {}",
                        entry.name
                    )))
                }
                Err(e) => {
                    return Err(VaultError::Validation(format!(
                        "cannot decode {}: {}",
                        entry.name, e
                    )))
                }
            }
        }

        Ok(())
    }
}

impl BackupValidator for IntegrityValidator {
    fn validate(&self, manifest_path: &Path, device_serial: &str) -> bool {
        match self.check(manifest_path, device_serial) {
            Ok(()) => true,
            Err(e) => {
                warn!("Backup rejected: {}", e);
                false
            }
        }
    }
}

/// SHA-256 and length of an entry's plaintext, read back through decrypt
/// and decompress as the entry flags require.
pub(crate) fn entry_digest(
    entry: &PartitionBackupEntry,
    path: &Path,
    serial: &str,
    chunk_size: usize,
) -> io::Result<(String, u64)> {
    let pipeline = Pipeline::for_entry(entry.is_compressed, entry.is_encrypted, serial);
    let file = BufReader::new(File::open(path)?);
    let reader = pipeline.reader(Box::new(file))?;
    sha256_reader(reader, chunk_size)
}
