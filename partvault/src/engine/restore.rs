//! Restore engine: replay a backup onto a device.
//!
//! The backup must pass the integrity validator before any byte is written.
//! After that gate, entries are restored best-effort: a bad entry is counted
//! and skipped, the device partition it targets left untouched.

use super::validate::{entry_digest, BackupValidator, IntegrityValidator};
use super::{step_percent, FailurePolicy, ProgressCallback, Reporter};
use crate::codec::Pipeline;
use crate::device::{DeviceIo, PartitionInfo, PartitionTable, WriteTarget};
use crate::manifest::archive::OpenedBackup;
use crate::manifest::{self, PartitionBackupEntry};
use crate::transfer::{copy_chunked, format_bytes, TransferMeter, COPY_CHUNK_SIZE};
use crate::{Result, VaultError};
use chrono::Local;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Name fragments of partitions worth a safety copy before overwriting.
const HIGH_RISK_FRAGMENTS: &[&str] = &["efs", "modem", "nv", "persist", "vbmeta"];

/// What to restore.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// Backup directory, its `manifest.json`, or a backup archive
    pub source: PathBuf,
    /// Entries to restore; empty means all
    pub partitions: Vec<String>,
    /// Serial for validation and key derivation; defaults to the device's
    pub device_serial: Option<String>,
    /// Where to save pre-restore copies of high-risk partitions
    pub safety_backup_dir: Option<PathBuf>,
}

impl RestorePlan {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            partitions: Vec::new(),
            device_serial: None,
            safety_backup_dir: None,
        }
    }
}

/// Outcome of a restore run
#[derive(Debug)]
pub struct RestoreResult {
    pub success: bool,
    pub partitions_restored: usize,
    pub partitions_failed: usize,
    pub duration: Duration,
    pub error: Option<String>,
}

fn is_high_risk(partition: &PartitionInfo) -> bool {
    let lower = partition.name.to_ascii_lowercase();
    partition.is_high_risk || HIGH_RISK_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Restore engine
pub struct RestoreEngine<'a> {
    device: &'a mut dyn DeviceIo,
    validator: Box<dyn BackupValidator + 'a>,
    progress: Reporter,
    cancel_token: CancellationToken,
    policy: FailurePolicy,
    chunk_size: usize,
}

impl<'a> RestoreEngine<'a> {
    /// Create a restore engine (no cancellation support)
    pub fn new(device: &'a mut dyn DeviceIo) -> Self {
        Self::with_cancel(device, CancellationToken::new())
    }

    /// Create a restore engine with cancellation support
    pub fn with_cancel(device: &'a mut dyn DeviceIo, cancel_token: CancellationToken) -> Self {
        Self {
            device,
            validator: Box::new(IntegrityValidator::new()),
            progress: Reporter::default(),
            cancel_token,
            policy: FailurePolicy::BestEffort,
            chunk_size: COPY_CHUNK_SIZE,
        }
    }

    /// Replace the default [`IntegrityValidator`].
    pub fn with_validator(mut self, validator: impl BackupValidator + 'a) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress.set_callback(callback);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Run a restore.
    ///
    /// Returns `Err` when nothing was written: device not ready, backup not
    /// found or unparsable, or validation rejected the backup.
    pub fn execute(&mut self, plan: &RestorePlan) -> Result<RestoreResult> {
        let mut meter = TransferMeter::new();

        if !self.device.is_ready() {
            return Err(VaultError::NotReady("device session is not ready".to_string()));
        }

        self.progress.info(0, "Starting verification...");
        let backup = OpenedBackup::open(&plan.source)?;
        if backup.is_extracted() {
            info!("Extracted {} to {}", plan.source.display(), backup.dir().display());
        }
        let manifest = manifest::load(backup.dir())?;
        info!(
            "Restoring backup of {} {} from {}",
            manifest.device_brand,
            manifest.device_model,
            manifest.created_at.format("%Y-%m-%d %H:%M")
        );

        let serial = plan
            .device_serial
            .clone()
            .unwrap_or_else(|| self.device.identity().serial);

        if !self.validator.validate(backup.dir(), &serial) {
            error!("Backup integrity validation failed, restore aborted");
            self.progress.error(0, "Backup integrity validation failed");
            return Err(VaultError::Validation(
                "backup integrity validation failed; nothing was written".to_string(),
            ));
        }
        self.progress.info(10, "Verification passed. Starting restore...");

        let table = self.device.partition_table()?;

        let selected: Vec<&PartitionBackupEntry> = manifest
            .partitions
            .iter()
            .filter(|e| {
                plan.partitions.is_empty()
                    || plan.partitions.iter().any(|p| p.eq_ignore_ascii_case(&e.name))
            })
            .collect();

        let mut result = RestoreResult {
            success: false,
            partitions_restored: 0,
            partitions_failed: 0,
            duration: Duration::ZERO,
            error: None,
        };

        for (completed, entry) in selected.iter().enumerate() {
            if self.cancel_token.is_cancelled() {
                warn!("Restore cancelled after {} entries", completed);
                result.error = Some("Restore cancelled".to_string());
                break;
            }

            let percent = step_percent(completed, selected.len(), 90, 10);
            self.progress.info(percent, format!("Restoring {}...", entry.name));

            match self.restore_entry(entry, backup.dir(), &table, &serial, plan) {
                Ok(bytes) => {
                    info!("Restored {}: {}", entry.name, format_bytes(bytes));
                    meter.record(bytes);
                    result.partitions_restored += 1;
                }
                Err(e) => {
                    error!("Restore of {} failed: {}", entry.name, e);
                    self.progress
                        .error(percent, format!("Restore of {} failed: {}", entry.name, e));
                    result.partitions_failed += 1;

                    if self.policy.should_abort() {
                        result.error = Some(format!("Restore aborted at {}: {}", entry.name, e));
                        break;
                    }
                }
            }
        }

        result.success = result.partitions_failed == 0 && result.error.is_none();
        result.duration = meter.elapsed();

        if result.error.is_none() {
            self.progress.info(
                100,
                format!("Restore complete: {} partitions", result.partitions_restored),
            );
        }
        info!(
            "Restore finished: {} restored, {} failed, {}",
            result.partitions_restored,
            result.partitions_failed,
            meter.summary()
        );

        Ok(result)
    }

    /// Verify then write one entry. Returns the plaintext bytes written.
    fn restore_entry(
        &mut self,
        entry: &PartitionBackupEntry,
        dir: &Path,
        table: &PartitionTable,
        serial: &str,
        plan: &RestorePlan,
    ) -> Result<u64> {
        let path = entry.resolve_file(dir)?;
        if !path.is_file() {
            return Err(VaultError::NotFound(format!("partition file {}", entry.file_name)));
        }

        let live = table
            .find(&entry.name)
            .ok_or_else(|| VaultError::NotFound(format!("partition {} on device", entry.name)))?;

        // Full hash pass before the device sees a single byte. Sizes come
        // from the decoded stream, not the manifest.
        let (digest, len) = entry_digest(entry, &path, serial, self.chunk_size)
            .map_err(|e| VaultError::Validation(format!("cannot decode {}: {}", entry.name, e)))?;
        if len > live.size_bytes {
            return Err(VaultError::SizeMismatch {
                partition: entry.name.clone(),
                image_size: len,
                capacity: live.size_bytes,
            });
        }
        if len != entry.size_bytes {
            return Err(VaultError::Validation(format!(
                "{} decodes to {} bytes, manifest says {}",
                entry.name, len, entry.size_bytes
            )));
        }
        if digest != entry.sha256 {
            return Err(VaultError::Validation(format!("hash mismatch for {}", entry.name)));
        }

        if let Some(safety_dir) = &plan.safety_backup_dir {
            if is_high_risk(live) {
                self.safety_backup(&live.name, safety_dir)?;
            }
        }

        let pipeline = Pipeline::for_entry(entry.is_compressed, entry.is_encrypted, serial);
        let file = BufReader::new(File::open(&path)?);
        let mut source = pipeline.reader(Box::new(file))?;

        let mut sink = self
            .device
            .open_writable_sink(&WriteTarget::Partition(entry.name.clone()))?;
        let written = copy_chunked(&mut source, &mut sink, self.chunk_size)?;
        sink.flush()?;
        if !sink.close()? {
            return Err(VaultError::DeviceWrite(format!(
                "device rejected write to {}",
                entry.name
            )));
        }

        Ok(written)
    }

    /// Copy the live partition to `<name>_PRE_<timestamp>.img` in `dir`.
    fn safety_backup(&mut self, name: &str, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}_PRE_{}.img",
            name,
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        match self.copy_partition_to(name, &path) {
            Ok(bytes) => {
                info!(
                    "Safety backup of {} saved to {} ({})",
                    name,
                    path.display(),
                    format_bytes(bytes)
                );
                Ok(path)
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(VaultError::Device(format!("safety backup of {} failed: {}", name, e)))
            }
        }
    }

    fn copy_partition_to(&mut self, name: &str, path: &Path) -> Result<u64> {
        let mut source = self.device.open_reader(name)?;
        let mut file = File::create(path)?;
        let copied = copy_chunked(&mut source, &mut file, self.chunk_size)?;
        file.sync_all()?;
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::MemoryDevice;
    use crate::engine::backup::{BackupEngine, BackupPlan};
    use crate::manifest::{BackupFormat, BackupType};
    use tempfile::TempDir;

    const SERIAL: &str = "R58M12";

    fn boot() -> Vec<u8> {
        (0..40_000u32).map(|i| (i % 199) as u8).collect()
    }

    fn source_device() -> MemoryDevice {
        MemoryDevice::new(SERIAL)
            .with_partition("boot", boot(), 0)
            .with_partition("persist", vec![0x55; 4096], 0)
    }

    /// Same layout, blank content
    fn target_device() -> MemoryDevice {
        MemoryDevice::new(SERIAL)
            .with_partition("boot", Vec::new(), 40_000)
            .with_partition("persist", Vec::new(), 4096)
    }

    fn make_backup(root: &Path, format: BackupFormat, layered: bool) -> Result<PathBuf> {
        let mut device = source_device();
        let mut plan = BackupPlan::new(root, BackupType::Full, format);
        plan.encrypt = layered;
        plan.compress = layered;
        let result = BackupEngine::new(&mut device).execute(&plan)?;
        Ok(result.output_path)
    }

    fn accept_all(_: &Path, _: &str) -> bool {
        true
    }

    #[test]
    fn test_restore_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, true)?;
        let mut device = target_device();

        let result = RestoreEngine::new(&mut device)
            .with_chunk_size(4096)
            .execute(&RestorePlan::new(&source))?;

        assert!(result.success);
        assert_eq!(result.partitions_restored, 2);
        assert_eq!(device.committed("boot"), Some(boot()));
        assert_eq!(device.committed("persist"), Some(vec![0x55; 4096]));
        Ok(())
    }

    #[test]
    fn test_restore_from_archive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Packaged, false)?;
        let mut device = target_device();

        let result = RestoreEngine::new(&mut device).execute(&RestorePlan::new(&source))?;

        assert!(result.success);
        assert_eq!(device.committed("boot"), Some(boot()));
        assert_eq!(device.committed("persist"), Some(vec![0x55; 4096]));
        Ok(())
    }

    #[test]
    fn test_validation_gate_blocks_all_writes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, false)?;
        let mut device = target_device();

        let outcome = RestoreEngine::new(&mut device)
            .with_validator(|_: &Path, _: &str| false)
            .execute(&RestorePlan::new(&source));

        assert!(matches!(outcome, Err(VaultError::Validation(_))));
        assert!(device.written_targets().is_empty());
        Ok(())
    }

    #[test]
    fn test_serial_mismatch_blocks_restore() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, true)?;
        let mut device = target_device();
        device.identity.serial = "SOMEONE_ELSE".to_string();

        let outcome = RestoreEngine::new(&mut device).execute(&RestorePlan::new(&source));

        assert!(matches!(outcome, Err(VaultError::Validation(_))));
        assert!(device.written_targets().is_empty());
        Ok(())
    }

    #[test]
    fn test_flipped_ciphertext_byte_fails_only_that_entry() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, true)?;

        let boot_img = source.join("boot.img");
        let mut bytes = fs::read(&boot_img)?;
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&boot_img, &bytes)?;

        let mut device = target_device();
        let result = RestoreEngine::new(&mut device)
            .with_validator(accept_all)
            .execute(&RestorePlan::new(&source))?;

        assert!(!result.success);
        assert_eq!(result.partitions_failed, 1);
        assert_eq!(result.partitions_restored, 1);
        assert!(device.committed("boot").is_none());
        assert!(!device.written_targets().contains(&"boot".to_string()));
        assert_eq!(device.committed("persist"), Some(vec![0x55; 4096]));
        Ok(())
    }

    #[test]
    fn test_allow_list_is_case_insensitive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, false)?;
        let mut device = target_device();
        let mut plan = RestorePlan::new(&source);
        plan.partitions = vec!["PERSIST".to_string()];

        let result = RestoreEngine::new(&mut device).execute(&plan)?;

        assert!(result.success);
        assert_eq!(result.partitions_restored, 1);
        assert_eq!(device.written_targets(), vec!["persist".to_string()]);
        Ok(())
    }

    #[test]
    fn test_oversized_entry_is_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, false)?;
        let mut device = MemoryDevice::new(SERIAL)
            .with_partition("boot", Vec::new(), 1024)
            .with_partition("persist", Vec::new(), 4096);

        let result = RestoreEngine::new(&mut device).execute(&RestorePlan::new(&source))?;

        assert_eq!(result.partitions_failed, 1);
        assert_eq!(result.partitions_restored, 1);
        assert!(device.committed("boot").is_none());
        Ok(())
    }

    fn set_entry_size(dir: &Path, name: &str, size_bytes: u64) -> Result<()> {
        let mut m = manifest::load(dir)?;
        if let Some(entry) = m.partitions.iter_mut().find(|p| p.name == name) {
            entry.size_bytes = size_bytes;
        }
        manifest::save(&m, dir)?;
        Ok(())
    }

    #[test]
    fn test_capacity_checked_against_decoded_size() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, true)?;
        set_entry_size(&source, "boot", 100)?;
        let mut device = MemoryDevice::new(SERIAL)
            .with_partition("boot", Vec::new(), 1024)
            .with_partition("persist", Vec::new(), 4096);

        let result = RestoreEngine::new(&mut device)
            .with_validator(accept_all)
            .with_failure_policy(FailurePolicy::FailFast)
            .execute(&RestorePlan::new(&source))?;

        assert_eq!(result.partitions_failed, 1);
        assert_eq!(result.partitions_restored, 0);
        assert!(device.written_targets().is_empty());
        let error = result.error.unwrap_or_default();
        assert!(error.contains("image is 40000 bytes, partition holds 1024 bytes"), "{}", error);
        Ok(())
    }

    #[test]
    fn test_size_disagreeing_with_manifest_is_not_written() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, false)?;
        set_entry_size(&source, "persist", 8192)?;
        let mut device = MemoryDevice::new(SERIAL)
            .with_partition("boot", Vec::new(), 40_000)
            .with_partition("persist", Vec::new(), 8192);

        let result = RestoreEngine::new(&mut device)
            .with_validator(accept_all)
            .with_failure_policy(FailurePolicy::FailFast)
            .execute(&RestorePlan::new(&source))?;

        assert_eq!(result.partitions_failed, 1);
        assert!(device.committed("persist").is_none());
        assert_eq!(device.written_targets(), vec!["boot".to_string()]);
        let error = result.error.unwrap_or_default();
        assert!(error.contains("manifest says 8192"), "{}", error);
        Ok(())
    }

    #[test]
    fn test_rejected_write_counts_as_failure() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, false)?;
        let mut device = target_device();
        device.failing_writes.insert("boot".to_string());

        let result = RestoreEngine::new(&mut device)
            .with_failure_policy(FailurePolicy::FailFast)
            .execute(&RestorePlan::new(&source))?;

        assert!(!result.success);
        assert_eq!(result.partitions_failed, 1);
        assert_eq!(result.partitions_restored, 0);
        assert!(result.error.is_some());
        Ok(())
    }

    #[test]
    fn test_safety_backup_of_high_risk_partition() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, false)?;
        let safety = temp_dir.path().join("safety");

        let mut device = MemoryDevice::new(SERIAL)
            .with_partition("boot", vec![1u8; 100], 40_000)
            .with_partition("persist", vec![2u8; 4096], 4096);
        let mut plan = RestorePlan::new(&source);
        plan.safety_backup_dir = Some(safety.clone());

        let result = RestoreEngine::new(&mut device).execute(&plan)?;
        assert!(result.success);

        let saved: Vec<_> = fs::read_dir(&safety)?.filter_map(|e| e.ok()).collect();
        assert_eq!(saved.len(), 1);
        let name = saved[0].file_name().to_string_lossy().to_string();
        assert!(name.starts_with("persist_PRE_"));
        assert_eq!(fs::read(saved[0].path())?, vec![2u8; 4096]);
        Ok(())
    }

    #[test]
    fn test_cancelled_restore_writes_nothing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = make_backup(temp_dir.path(), BackupFormat::Raw, false)?;
        let mut device = target_device();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = RestoreEngine::with_cancel(&mut device, cancel).execute(&RestorePlan::new(&source))?;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Restore cancelled"));
        assert!(device.written_targets().is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_backup_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let mut device = target_device();
        let outcome =
            RestoreEngine::new(&mut device).execute(&RestorePlan::new(temp_dir.path().join("gone")));
        assert!(matches!(outcome, Err(VaultError::NotFound(_))));
    }
}
