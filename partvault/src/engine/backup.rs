//! Backup engine: live device → manifest-described directory or archive.
//!
//! Failure policy is best-effort by default: a partition that cannot be read
//! is counted and skipped, and whatever was captured is still persisted.

use super::{step_percent, FailurePolicy, ProgressCallback, Reporter};
use crate::codec::{short_digest, HashingReader, LayeredWrite, Pipeline};
use crate::device::{DeviceIo, PartitionInfo, PartitionTable};
use crate::manifest::{self, archive, BackupFormat, BackupManifest, BackupType, PartitionBackupEntry};
use crate::transfer::{copy_chunked, format_bytes, TransferMeter, COPY_CHUNK_SIZE};
use crate::{Result, VaultError};
use chrono::{Local, Utc};
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Firmware/auth partitions captured by a critical backup, matched as name
/// fragments.
const CRITICAL_PARTITIONS: &[&str] = &[
    "boot", "recovery", "sbl1", "sbl2", "aboot", "rpm", "tz", "hyp", "keymaster", "cmnlib",
    "cmnlib64", "devcfg", "modem", "dsp", "bluetooth", "persist", "frp", "misc", "fsc", "fsg",
    "modemst1", "modemst2",
];

/// Large filesystem partitions a critical backup leaves out.
const LARGE_PARTITIONS: &[&str] = &[
    "system", "system_a", "system_b", "vendor", "vendor_a", "vendor_b", "product", "product_a",
    "product_b", "odm", "cache", "userdata",
];

/// What to back up and how.
#[derive(Debug, Clone)]
pub struct BackupPlan {
    /// Parent directory; the backup gets its own subdirectory
    pub output_dir: PathBuf,
    pub backup_type: BackupType,
    pub format: BackupFormat,
    /// Allow-list for [`BackupType::Custom`]
    pub partitions: Vec<String>,
    pub encrypt: bool,
    pub compress: bool,
    pub notes: Option<String>,
}

impl BackupPlan {
    pub fn new(output_dir: impl Into<PathBuf>, backup_type: BackupType, format: BackupFormat) -> Self {
        Self {
            output_dir: output_dir.into(),
            backup_type,
            format,
            partitions: Vec::new(),
            encrypt: false,
            compress: false,
            notes: None,
        }
    }
}

/// Outcome of a backup run
#[derive(Debug)]
pub struct BackupResult {
    pub success: bool,
    /// Backup directory, or the archive when packaged
    pub output_path: PathBuf,
    /// Present once the manifest has been written
    pub manifest: Option<BackupManifest>,
    pub partitions_backed_up: usize,
    pub partitions_failed: usize,
    pub total_bytes: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Partitions of `table` selected by `plan`, in table order.
pub fn select_partitions<'t>(table: &'t PartitionTable, plan: &BackupPlan) -> Vec<&'t PartitionInfo> {
    table
        .partitions
        .iter()
        .filter(|p| match plan.backup_type {
            BackupType::Full => true,
            BackupType::Critical => is_critical_candidate(&p.name),
            BackupType::Userdata => p.name.eq_ignore_ascii_case("userdata"),
            BackupType::Custom => plan
                .partitions
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(&p.name)),
        })
        .collect()
}

fn is_critical_candidate(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    CRITICAL_PARTITIONS.iter().any(|c| lower.contains(c))
        || !LARGE_PARTITIONS.contains(&lower.as_str())
}

/// `backup_<brand>_<model>_<timestamp>` with path-unsafe characters replaced.
fn backup_dir_name(brand: &str, model: &str) -> String {
    let raw = format!(
        "backup_{}_{}_{}",
        brand,
        model,
        Local::now().format("%Y%m%d_%H%M%S")
    );
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn archive_path(dir: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(dir.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Remove the loose backup directory once its archive is complete. The
/// archive stays the output either way.
fn discard_loose_dir(dir: &Path) -> Option<String> {
    match fs::remove_dir_all(dir) {
        Ok(()) => None,
        Err(e) => {
            warn!("Archive written but {} could not be removed: {}", dir.display(), e);
            Some(format!("Cleanup of {} failed: {}", dir.display(), e))
        }
    }
}

/// Backup engine
pub struct BackupEngine<'a> {
    device: &'a mut dyn DeviceIo,
    progress: Reporter,
    cancel_token: CancellationToken,
    policy: FailurePolicy,
    chunk_size: usize,
}

impl<'a> BackupEngine<'a> {
    /// Create a backup engine (no cancellation support)
    pub fn new(device: &'a mut dyn DeviceIo) -> Self {
        Self::with_cancel(device, CancellationToken::new())
    }

    /// Create a backup engine with cancellation support
    pub fn with_cancel(device: &'a mut dyn DeviceIo, cancel_token: CancellationToken) -> Self {
        Self {
            device,
            progress: Reporter::default(),
            cancel_token,
            policy: FailurePolicy::BestEffort,
            chunk_size: COPY_CHUNK_SIZE,
        }
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

    /// Run a backup.
    ///
    /// Returns `Err` only when nothing could be attempted (device not ready,
    /// partition table unreadable, output directory not creatable).
    pub fn execute(&mut self, plan: &BackupPlan) -> Result<BackupResult> {
        let mut meter = TransferMeter::new();

        if !self.device.is_ready() {
            return Err(VaultError::NotReady("device session is not ready".to_string()));
        }

        self.progress.info(5, "Reading partition table...");
        let table = self.device.partition_table()?;
        info!("Found {} partitions", table.len());

        if plan.backup_type == BackupType::Custom && plan.partitions.is_empty() {
            warn!("Custom backup requested with an empty partition list");
        }
        let selected: Vec<PartitionInfo> = select_partitions(&table, plan)
            .into_iter()
            .cloned()
            .collect();
        info!(
            "Backing up {} partitions ({} backup, {} format)",
            selected.len(),
            plan.backup_type,
            plan.format
        );

        let identity = self.device.identity();
        let mut manifest =
            BackupManifest::new(&identity, plan.backup_type, plan.format, table.sector_size);
        manifest.notes = plan.notes.clone();

        let backup_dir = plan
            .output_dir
            .join(backup_dir_name(&manifest.device_brand, &manifest.device_model));
        fs::create_dir_all(&backup_dir)?;
        debug!("Backup directory: {}", backup_dir.display());

        let pipeline = Pipeline::for_entry(plan.compress, plan.encrypt, &manifest.device_serial);

        let mut result = BackupResult {
            success: false,
            output_path: backup_dir.clone(),
            manifest: None,
            partitions_backed_up: 0,
            partitions_failed: 0,
            total_bytes: 0,
            duration: Duration::ZERO,
            error: None,
        };

        for (completed, partition) in selected.iter().enumerate() {
            if self.cancel_token.is_cancelled() {
                warn!("Backup cancelled after {} partitions", completed);
                self.progress.warn(step_percent(completed, selected.len(), 90, 5), "Backup cancelled");
                result.error = Some("Backup cancelled".to_string());
                result.duration = meter.elapsed();
                return Ok(result);
            }

            let percent = step_percent(completed, selected.len(), 90, 5);
            self.progress
                .info(percent, format!("Backing up {}...", partition.name));

            match self.backup_partition(partition, &backup_dir, &pipeline) {
                Ok(Some(entry)) => {
                    info!(
                        "Backed up {}: {} (sha256 {})",
                        entry.name,
                        format_bytes(entry.size_bytes),
                        short_digest(&entry.sha256)
                    );
                    meter.record(entry.size_bytes);
                    result.total_bytes += entry.size_bytes;
                    result.partitions_backed_up += 1;
                    manifest.partitions.push(entry);
                }
                Ok(None) => {
                    warn!("No data read from {}", partition.name);
                    self.progress
                        .warn(percent, format!("No data read from {}", partition.name));
                    result.partitions_failed += 1;
                }
                Err(e) => {
                    error!("Failed to back up {}: {}", partition.name, e);
                    self.progress
                        .error(percent, format!("Failed to back up {}: {}", partition.name, e));
                    result.partitions_failed += 1;
                }
            }

            if result.partitions_failed > 0 && self.policy.should_abort() {
                result.error = Some(format!("Backup aborted at {}", partition.name));
                result.duration = meter.elapsed();
                return Ok(result);
            }
        }

        // Every entry file is on disk; only now may the manifest appear
        self.progress.info(95, "Saving manifest...");
        manifest::save(&manifest, &backup_dir)?;

        if let Some(extension) = plan.format.archive_extension() {
            self.progress.info(97, "Packaging backup...");
            let archive = archive_path(&backup_dir, extension);
            match archive::pack_directory(&backup_dir, &archive) {
                Ok(_) => {
                    result.error = discard_loose_dir(&backup_dir);
                    result.output_path = archive;
                }
                Err(e) => {
                    error!("Failed to package backup: {}", e);
                    let _ = fs::remove_file(&archive);
                    result.error = Some(format!("Packaging failed: {}", e));
                }
            }
        }

        result.success = result.partitions_failed == 0 && result.error.is_none();
        result.duration = meter.elapsed();
        result.manifest = Some(manifest);

        self.progress.info(
            100,
            format!("Backup complete: {} partitions", result.partitions_backed_up),
        );
        info!(
            "Backup finished: {} backed up, {} failed, {} -> {}",
            result.partitions_backed_up,
            result.partitions_failed,
            meter.summary(),
            result.output_path.display()
        );

        Ok(result)
    }

    /// Capture one partition to `<name>.img`. `Ok(None)` means the device
    /// returned no data. The file never outlives a failed capture.
    fn backup_partition(
        &mut self,
        partition: &PartitionInfo,
        dir: &Path,
        pipeline: &Pipeline,
    ) -> Result<Option<PartitionBackupEntry>> {
        let file_name = format!("{}.img", partition.name);
        let path = dir.join(&file_name);

        let (sha256, size) = match self.capture(&partition.name, &path, pipeline) {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        if size == 0 {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        Ok(Some(PartitionBackupEntry {
            name: partition.name.clone(),
            start_lba: partition.start_lba,
            size_bytes: size,
            file_name,
            sha256,
            backed_up_at: Utc::now(),
            verified: true,
            is_compressed: pipeline.compresses(),
            is_encrypted: pipeline.encrypts(),
        }))
    }

    /// Stream the partition through the write pipeline, hashing the plaintext.
    fn capture(&mut self, name: &str, path: &Path, pipeline: &Pipeline) -> Result<(String, u64)> {
        let source = self.device.open_reader(name)?;
        let mut hashing = HashingReader::new(source);

        let file = File::create(path)?;
        let mut sink: Box<dyn LayeredWrite> = pipeline.writer(Box::new(file))?;
        copy_chunked(&mut hashing, &mut sink, self.chunk_size)?;
        sink.finish_layer()?;

        Ok(hashing.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sha256_hex;
    use crate::device::memory::MemoryDevice;
    use crate::engine::ProgressUpdate;
    use crate::manifest::MANIFEST_FILE_NAME;
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn sample_device() -> MemoryDevice {
        MemoryDevice::new("SER123")
            .with_partition("boot", vec![0xB0; 32 * 1024], 0)
            .with_partition("persist", vec![0x9E; 1024], 0)
            .with_partition("userdata", vec![0x0D; 80 * 1024], 0)
    }

    fn manifest_exists(root: &Path) -> bool {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name() == MANIFEST_FILE_NAME)
    }

    #[test]
    fn test_critical_backup_skips_large_partitions() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut device = sample_device();
        let plan = BackupPlan::new(temp_dir.path(), BackupType::Critical, BackupFormat::Raw);

        let result = BackupEngine::new(&mut device).execute(&plan)?;

        assert!(result.success);
        assert_eq!(result.partitions_backed_up, 2);
        assert_eq!(result.partitions_failed, 0);
        assert_eq!(result.total_bytes, 33 * 1024);

        let manifest = manifest::load(&result.output_path)?;
        let names: Vec<_> = manifest.partitions.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["boot", "persist"]);
        for entry in &manifest.partitions {
            let bytes = fs::read(result.output_path.join(&entry.file_name))?;
            assert_eq!(entry.sha256, sha256_hex(&bytes));
            assert!(entry.verified);
        }
        assert!(!result.output_path.join("userdata.img").exists());
        Ok(())
    }

    #[test]
    fn test_best_effort_accounting() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut device = sample_device().with_partition("misc", Vec::new(), 512);
        device.failing_reads.insert("persist".to_string());
        let plan = BackupPlan::new(temp_dir.path(), BackupType::Full, BackupFormat::Raw);

        let result = BackupEngine::new(&mut device).execute(&plan)?;

        assert!(!result.success);
        assert_eq!(result.partitions_backed_up + result.partitions_failed, 4);
        assert_eq!(result.partitions_failed, 2);

        // Failures leave no files and no entries behind
        assert!(!result.output_path.join("persist.img").exists());
        assert!(!result.output_path.join("misc.img").exists());
        let manifest = result.manifest.expect("manifest written");
        assert_eq!(manifest.partitions.len(), 2);
        assert!(manifest.missing_files(&result.output_path).is_empty());
        Ok(())
    }

    #[test]
    fn test_not_ready_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let mut device = sample_device();
        device.ready = false;
        let plan = BackupPlan::new(temp_dir.path(), BackupType::Full, BackupFormat::Raw);

        let result = BackupEngine::new(&mut device).execute(&plan);

        assert!(matches!(result, Err(VaultError::NotReady(_))));
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cancelled_backup_writes_no_manifest() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut device = sample_device();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let plan = BackupPlan::new(temp_dir.path(), BackupType::Full, BackupFormat::Raw);

        let result = BackupEngine::with_cancel(&mut device, cancel).execute(&plan)?;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Backup cancelled"));
        assert!(result.manifest.is_none());
        assert!(!manifest_exists(temp_dir.path()));
        Ok(())
    }

    #[test]
    fn test_manifest_written_last() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();
        let early_manifest = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&early_manifest);

        let mut device = sample_device();
        let plan = BackupPlan::new(&root, BackupType::Full, BackupFormat::Raw);
        let result = BackupEngine::new(&mut device)
            .with_progress(Arc::new(move |u: &ProgressUpdate| {
                if u.percent < 95 && manifest_exists(&root) {
                    *flag.lock().unwrap() = true;
                }
            }))
            .execute(&plan)?;

        assert!(result.success);
        assert!(!*early_manifest.lock().unwrap());
        assert!(result.output_path.join(MANIFEST_FILE_NAME).is_file());
        Ok(())
    }

    #[test]
    fn test_packaged_backup_replaces_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut device = sample_device();
        let plan = BackupPlan::new(temp_dir.path(), BackupType::Userdata, BackupFormat::Packaged);

        let result = BackupEngine::new(&mut device).execute(&plan)?;

        assert!(result.success);
        assert_eq!(result.output_path.extension().unwrap(), "pvb");
        assert!(result.output_path.is_file());
        assert_eq!(fs::read_dir(temp_dir.path())?.count(), 1);

        let manifest = manifest::load(&result.output_path)?;
        assert_eq!(manifest.partitions.len(), 1);
        assert_eq!(manifest.partitions[0].name, "userdata");
        assert_eq!(manifest.format, BackupFormat::Packaged);
        Ok(())
    }

    #[test]
    fn test_cleanup_failure_is_reported_not_raised() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let loose = temp_dir.path().join("Brand_Model_20260101_000000");
        fs::create_dir(&loose)?;
        fs::write(loose.join("boot.img"), b"x")?;

        assert!(discard_loose_dir(&loose).is_none());
        assert!(!loose.exists());

        let error = discard_loose_dir(&loose);
        assert!(error.is_some_and(|e| e.starts_with("Cleanup of")));
        Ok(())
    }

    #[test]
    fn test_encrypted_compressed_entries_decode() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut device = sample_device();
        let mut plan = BackupPlan::new(temp_dir.path(), BackupType::Custom, BackupFormat::Raw);
        plan.partitions = vec!["BOOT".to_string()];
        plan.encrypt = true;
        plan.compress = true;

        let result = BackupEngine::new(&mut device).with_chunk_size(4096).execute(&plan)?;
        let manifest = result.manifest.expect("manifest written");
        let entry = &manifest.partitions[0];
        assert!(entry.is_encrypted && entry.is_compressed);
        assert_eq!(entry.sha256, sha256_hex(&vec![0xB0; 32 * 1024]));

        let file = File::open(result.output_path.join(&entry.file_name))?;
        let mut plain = Vec::new();
        Pipeline::for_entry(true, true, "SER123")
            .reader(Box::new(file))?
            .read_to_end(&mut plain)?;
        assert_eq!(plain, vec![0xB0; 32 * 1024]);
        Ok(())
    }

    #[test]
    fn test_custom_with_empty_list_selects_nothing() {
        let device = sample_device();
        let plan = BackupPlan::new("/tmp", BackupType::Custom, BackupFormat::Raw);
        assert!(select_partitions(&device.table, &plan).is_empty());
    }

    #[test]
    fn test_critical_selection_by_fragment() {
        let device = MemoryDevice::new("S")
            .with_partition("boot_a", vec![1], 0)
            .with_partition("system_a", vec![1], 0)
            .with_partition("modemst1", vec![1], 0)
            .with_partition("USERDATA", vec![1], 0);
        let plan = BackupPlan::new("/tmp", BackupType::Critical, BackupFormat::Raw);

        let names: Vec<_> = select_partitions(&device.table, &plan)
            .into_iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["boot_a", "modemst1"]);
    }

    #[test]
    fn test_fail_fast_stops_at_first_failure() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut device = sample_device();
        device.failing_reads.insert("boot".to_string());
        let plan = BackupPlan::new(temp_dir.path(), BackupType::Full, BackupFormat::Raw);

        let result = BackupEngine::new(&mut device)
            .with_failure_policy(FailurePolicy::FailFast)
            .execute(&plan)?;

        assert!(!result.success);
        assert_eq!(result.partitions_failed, 1);
        assert_eq!(result.partitions_backed_up, 0);
        assert!(result.error.is_some());
        assert!(!manifest_exists(temp_dir.path()));
        Ok(())
    }

    #[test]
    fn test_backup_dir_name_is_path_safe() {
        let name = backup_dir_name("Acme", "Phone 1/Pro");
        assert!(name.starts_with("backup_Acme_Phone_1_Pro_"));
        assert!(!name.contains(' '));
        assert!(!name.contains('/'));
    }
}
