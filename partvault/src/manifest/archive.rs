//! Single-file backup containers.
//!
//! Both `.zip` and `.pvb` backups are plain zip files holding the backup
//! directory unmodified: `manifest.json` plus the `.img` entries at the root.

use super::MANIFEST_FILE_NAME;
use crate::transfer::{copy_chunked, COPY_CHUNK_SIZE};
use crate::{Result, VaultError};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: [u8; 4] = *b"PK\x05\x06";

/// A backup made available as a directory.
///
/// Archives are extracted into a unique `restore_<uuid>` directory under the
/// system temp dir, removed again when this value is dropped.
#[derive(Debug)]
pub struct OpenedBackup {
    dir: PathBuf,
    extracted: bool,
}

impl OpenedBackup {
    /// Open a backup directory, a `manifest.json` inside one, or an archive.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(VaultError::NotFound(format!("backup {}", path.display())));
        }

        if path.is_dir() {
            return Ok(Self {
                dir: path.to_path_buf(),
                extracted: false,
            });
        }

        if is_archive(path) {
            let dir = std::env::temp_dir().join(format!("restore_{}", Uuid::new_v4().simple()));
            let opened = Self {
                dir,
                extracted: true,
            };
            // Dropping `opened` on failure removes a partial extraction
            extract(path, &opened.dir)?;
            return Ok(opened);
        }

        if path.file_name().is_some_and(|n| n == MANIFEST_FILE_NAME) {
            let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            return Ok(Self {
                dir,
                extracted: false,
            });
        }

        Err(VaultError::Parse(format!(
            "{} is neither a backup directory nor a backup archive",
            path.display()
        )))
    }

    /// Directory holding `manifest.json` and the entry files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_extracted(&self) -> bool {
        self.extracted
    }
}

impl Drop for OpenedBackup {
    fn drop(&mut self) {
        if self.extracted && self.dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!("Failed to remove {}: {}", self.dir.display(), e);
            }
        }
    }
}

/// Whether `path` is a zip container, judged by its leading bytes.
pub fn is_archive(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => magic == ZIP_MAGIC || magic == ZIP_EMPTY_MAGIC,
        Err(_) => false,
    }
}

/// Zip every file under `dir` into `dest`. Returns the number of files
/// stored.
pub fn pack_directory(dir: &Path, dest: &Path) -> Result<usize> {
    let mut writer = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut count = 0;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| VaultError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        writer.start_file(name, options)?;
        let mut source = File::open(entry.path())?;
        copy_chunked(&mut source, &mut writer, COPY_CHUNK_SIZE)?;
        count += 1;
    }

    writer.finish()?;
    debug!("Packed {} files into {}", count, dest.display());
    Ok(count)
}

/// Unpack `archive` into `dest`, creating it if needed.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
    zip.extract(dest)?;
    debug!("Extracted {} entries to {}", zip.len(), dest.display());
    Ok(())
}

/// Read only the root manifest entry out of `archive`. A `manifest.json`
/// in a subdirectory does not count.
pub fn read_manifest_entry(archive: &Path) -> Result<String> {
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;

    let mut entry = zip.by_name(MANIFEST_FILE_NAME).map_err(|e| match e {
        ZipError::FileNotFound => {
            VaultError::NotFound(format!("{} in {}", MANIFEST_FILE_NAME, archive.display()))
        }
        other => VaultError::Archive(other),
    })?;

    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(content)
}
