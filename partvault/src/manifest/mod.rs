//! Backup manifest model.
//!
//! A manifest is serialized as `manifest.json` next to the `<partition>.img`
//! files it describes. Field names are PascalCase so manifests written by
//! earlier releases of the tool still parse.

pub mod archive;

use crate::device::DeviceIdentity;
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const MANIFEST_VERSION: &str = "1.0";

/// Which partitions a backup selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr")]
pub enum BackupType {
    /// Every partition in the table
    Full,
    /// Firmware/auth partitions, large filesystems excluded
    Critical,
    /// Only `userdata`
    Userdata,
    /// Caller-supplied allow-list
    Custom,
}

/// How a backup is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr")]
pub enum BackupFormat {
    /// Loose directory of `.img` files
    Raw,
    /// Directory zipped into `<dir>.zip`
    Compressed,
    /// Directory zipped into `<dir>.pvb`
    Packaged,
}

/// Older manifests store enums as their integer code.
#[derive(Deserialize)]
#[serde(untagged)]
enum EnumRepr {
    Index(u8),
    Name(String),
}

impl TryFrom<EnumRepr> for BackupType {
    type Error = String;

    fn try_from(repr: EnumRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            EnumRepr::Index(0) => Ok(Self::Full),
            EnumRepr::Index(1) => Ok(Self::Critical),
            EnumRepr::Index(2) => Ok(Self::Userdata),
            EnumRepr::Index(3) => Ok(Self::Custom),
            EnumRepr::Index(n) => Err(format!("unknown backup type code {}", n)),
            EnumRepr::Name(name) => name.parse(),
        }
    }
}

impl TryFrom<EnumRepr> for BackupFormat {
    type Error = String;

    fn try_from(repr: EnumRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            EnumRepr::Index(0) => Ok(Self::Raw),
            EnumRepr::Index(1) => Ok(Self::Compressed),
            EnumRepr::Index(2) => Ok(Self::Packaged),
            EnumRepr::Index(n) => Err(format!("unknown backup format code {}", n)),
            EnumRepr::Name(name) => name.parse(),
        }
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "critical" => Ok(Self::Critical),
            "userdata" => Ok(Self::Userdata),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("unknown backup type '{}'", s)),
        }
    }
}

impl FromStr for BackupFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "compressed" | "zip" => Ok(Self::Compressed),
            // Legacy name of the packaged format
            "packaged" | "deepeyebackup" => Ok(Self::Packaged),
            _ => Err(format!("unknown backup format '{}'", s)),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Full => "full",
            Self::Critical => "critical",
            Self::Userdata => "userdata",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::Compressed => "compressed",
            Self::Packaged => "packaged",
        };
        f.write_str(name)
    }
}

impl BackupFormat {
    /// Archive extension for packaged formats, `None` for loose directories.
    pub fn archive_extension(&self) -> Option<&'static str> {
        match self {
            Self::Raw => None,
            Self::Compressed => Some("zip"),
            Self::Packaged => Some("pvb"),
        }
    }
}

/// Catalog of one backup and the device it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupManifest {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub device_brand: String,

    #[serde(default)]
    pub device_model: String,

    #[serde(default)]
    pub device_serial: String,

    #[serde(default)]
    pub chipset: String,

    pub created_at: DateTime<Utc>,

    #[serde(rename = "Type")]
    pub backup_type: BackupType,

    pub format: BackupFormat,

    #[serde(default = "default_sector_size")]
    pub sector_size: u32,

    /// In capture order
    #[serde(default)]
    pub partitions: Vec<PartitionBackupEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One captured partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartitionBackupEntry {
    pub name: String,

    pub start_lba: u64,

    /// Bytes actually captured; may be less than the live partition
    pub size_bytes: u64,

    /// Relative to the manifest directory
    pub file_name: String,

    /// Lower-case hex of the plaintext, before compression
    pub sha256: String,

    pub backed_up_at: DateTime<Utc>,

    pub verified: bool,

    #[serde(default)]
    pub is_compressed: bool,

    #[serde(default)]
    pub is_encrypted: bool,
}

impl PartitionBackupEntry {
    /// Path of the entry file inside `dir`. Names that would escape `dir`
    /// are rejected.
    pub fn resolve_file(&self, dir: &Path) -> Result<PathBuf> {
        let relative = Path::new(&self.file_name);
        let plain = !self.file_name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, std::path::Component::Normal(_)));
        if !plain {
            return Err(VaultError::Validation(format!(
                "entry {} has unsafe file name '{}'",
                self.name, self.file_name
            )));
        }
        Ok(dir.join(relative))
    }
}

fn default_version() -> String {
    MANIFEST_VERSION.to_string()
}

fn default_sector_size() -> u32 {
    512
}

fn or_unknown(value: &str) -> String {
    if value.trim().is_empty() {
        "Unknown".to_string()
    } else {
        value.to_string()
    }
}

impl BackupManifest {
    /// Empty manifest for a new backup of `identity`.
    pub fn new(
        identity: &DeviceIdentity,
        backup_type: BackupType,
        format: BackupFormat,
        sector_size: u32,
    ) -> Self {
        Self {
            version: default_version(),
            device_brand: or_unknown(&identity.brand),
            device_model: or_unknown(&identity.model),
            device_serial: or_unknown(&identity.serial),
            chipset: or_unknown(&identity.chipset),
            created_at: Utc::now(),
            backup_type,
            format,
            sector_size,
            partitions: Vec::new(),
            notes: None,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            brand: self.device_brand.clone(),
            model: self.device_model.clone(),
            serial: self.device_serial.clone(),
            chipset: self.chipset.clone(),
        }
    }

    /// Look an entry up by partition name, ignoring ASCII case.
    pub fn entry(&self, name: &str) -> Option<&PartitionBackupEntry> {
        self.partitions
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Sum of captured plaintext bytes.
    pub fn total_bytes(&self) -> u64 {
        self.partitions.iter().map(|e| e.size_bytes).sum()
    }

    /// Entries whose file is missing from `dir`.
    pub fn missing_files(&self, dir: &Path) -> Vec<String> {
        self.partitions
            .iter()
            .filter(|e| !dir.join(&e.file_name).is_file())
            .map(|e| e.file_name.clone())
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| VaultError::Parse(e.to_string()))
    }
}

/// Load a manifest from a backup directory, a `manifest.json` file, or a
/// backup archive. Archives are opened in place; only the manifest entry is
/// read.
pub fn load<P: AsRef<Path>>(path: P) -> Result<BackupManifest> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(VaultError::NotFound(format!("backup {}", path.display())));
    }

    let content = if path.is_dir() {
        read_manifest_file(&path.join(MANIFEST_FILE_NAME))?
    } else if archive::is_archive(path) {
        archive::read_manifest_entry(path)?
    } else {
        read_manifest_file(path)?
    };

    let manifest = BackupManifest::from_json(&content)?;
    debug!(
        "Loaded manifest from {} ({} entries)",
        path.display(),
        manifest.partitions.len()
    );
    Ok(manifest)
}

fn read_manifest_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => VaultError::NotFound(format!("manifest {}", path.display())),
        _ => VaultError::Io(e),
    })
}

/// Write `manifest.json` into `dir`.
///
/// Every file the manifest references must already be on disk. The manifest
/// goes to a temporary name first and is renamed into place, so a reader never
/// sees a partial file.
pub fn save(manifest: &BackupManifest, dir: &Path) -> Result<PathBuf> {
    let json = manifest.to_json()?;
    let final_path = dir.join(MANIFEST_FILE_NAME);
    let tmp_path = dir.join(format!(".{}.tmp", MANIFEST_FILE_NAME));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;

    Ok(final_path)
}
