//! Configuration management for partvault.
//!
//! Loads configuration from a TOML file. Every section and key is optional;
//! command-line flags override whatever the file sets.

use crate::manifest::BackupFormat;
use crate::transfer::COPY_CHUNK_SIZE;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub flash: FlashConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Parent directory for new backups
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// raw, compressed or packaged
    #[serde(default = "default_format")]
    pub format: BackupFormat,

    #[serde(default)]
    pub encrypt: bool,

    #[serde(default)]
    pub compress: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Save high-risk partitions here before overwriting them
    #[serde(default)]
    pub safety_backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    #[serde(default = "default_true")]
    pub safe_mode: bool,

    #[serde(default = "default_true")]
    pub reboot_on_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes (default: 1MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_output_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_format() -> BackupFormat {
    BackupFormat::Raw
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    COPY_CHUNK_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            format: default_format(),
            encrypt: false,
            compress: false,
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            safe_mode: true,
            reboot_on_success: true,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| VaultError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| VaultError::Config(e.to_string()))?;
        if config.transfer.chunk_size == 0 {
            return Err(VaultError::Config("transfer.chunk_size must be positive".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backup.format, BackupFormat::Raw);
        assert!(!config.backup.encrypt);
        assert!(config.restore.safety_backup_dir.is_none());
        assert!(config.flash.safe_mode);
        assert!(config.flash.reboot_on_success);
        assert_eq!(config.transfer.chunk_size, 1024 * 1024);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_empty_file_is_default() -> Result<()> {
        let config = Config::from_toml("")?;
        assert!(config.flash.safe_mode);
        assert_eq!(config.backup.output_dir, PathBuf::from("backups"));
        Ok(())
    }

    #[test]
    fn test_partial_sections() -> Result<()> {
        let config = Config::from_toml(
            r#"
            [backup]
            output_dir = "/srv/backups"
            format = "packaged"
            encrypt = true

            [restore]
            safety_backup_dir = "/srv/safety"

            [flash]
            safe_mode = false

            [log]
            level = "debug"
            "#,
        )?;

        assert_eq!(config.backup.output_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.backup.format, BackupFormat::Packaged);
        assert!(config.backup.encrypt);
        assert!(!config.backup.compress);
        assert_eq!(config.restore.safety_backup_dir, Some(PathBuf::from("/srv/safety")));
        assert!(!config.flash.safe_mode);
        assert!(config.flash.reboot_on_success);
        assert_eq!(config.log.level, "debug");
        Ok(())
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_toml("[backup]\nformat = \"tarball\""),
            Err(VaultError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[transfer]\nchunk_size = 0"),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("partvault.toml");
        std::fs::write(&path, "[transfer]\nchunk_size = 65536\n")?;

        assert_eq!(Config::from_file(&path)?.transfer.chunk_size, 65536);
        assert!(matches!(
            Config::from_file(temp_dir.path().join("missing.toml")),
            Err(VaultError::Config(_))
        ));
        Ok(())
    }
}
