//! Flash engine: write a firmware package onto a device.
//!
//! The live partition table is the baseline for every guard. An oversized
//! image stops the run before anything else is written, and by default so
//! does any rejected write.

use super::{step_percent, FailurePolicy, ProgressCallback, ProgressUpdate, Reporter};
use crate::codec::{sha256_reader, short_digest};
use crate::device::{DeviceIo, PartitionInfo, PartitionTable, WriteTarget};
use crate::firmware::{FirmwareManifest, FirmwarePartition};
use crate::transfer::{copy_chunked, format_bytes, TransferMeter, COPY_CHUNK_SIZE};
use crate::{Result, VaultError};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashPlan {
    /// Skip critical and high-risk partitions
    pub safe_mode: bool,
    pub reboot_on_success: bool,
}

impl Default for FlashPlan {
    fn default() -> Self {
        Self {
            safe_mode: true,
            reboot_on_success: true,
        }
    }
}

/// Outcome of a flash run
#[derive(Debug)]
pub struct FlashResult {
    pub success: bool,
    pub flashed: Vec<String>,
    pub skipped: Vec<String>,
    /// What stopped the run, if anything
    pub error: Option<VaultError>,
    /// Every progress update emitted during the run
    pub events: Vec<ProgressUpdate>,
    pub duration: Duration,
}

enum Step {
    Flashed(u64),
    Skipped,
}

/// Flash engine
pub struct FlashEngine<'a> {
    device: &'a mut dyn DeviceIo,
    progress: Reporter,
    cancel_token: CancellationToken,
    policy: FailurePolicy,
    chunk_size: usize,
}

impl<'a> FlashEngine<'a> {
    /// Create a flash engine (no cancellation support)
    pub fn new(device: &'a mut dyn DeviceIo) -> Self {
        Self::with_cancel(device, CancellationToken::new())
    }

    /// Create a flash engine with cancellation support
    pub fn with_cancel(device: &'a mut dyn DeviceIo, cancel_token: CancellationToken) -> Self {
        Self {
            device,
            progress: Reporter::default(),
            cancel_token,
            policy: FailurePolicy::FailFast,
            chunk_size: COPY_CHUNK_SIZE,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress.set_callback(callback);
        self
    }

    /// Only affects write failures; an oversized image always aborts.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Flash every selected entry of `firmware`, in order.
    ///
    /// Returns `Err` only when the device is not ready or its partition table
    /// cannot be read or is unusable. Anything that goes wrong later is in
    /// the result.
    pub fn execute(&mut self, firmware: &FirmwareManifest, plan: &FlashPlan) -> Result<FlashResult> {
        let mut meter = TransferMeter::new();

        if !self.device.is_ready() {
            return Err(VaultError::NotReady("device session is not ready".to_string()));
        }

        self.progress.info(0, "Reading partition table...");
        let table = self.device.partition_table()?;
        table.validate()?;

        let entries: Vec<&FirmwarePartition> = firmware.selected().collect();
        info!(
            "Flashing {} ({} images, safe mode {})",
            firmware.name,
            entries.len(),
            if plan.safe_mode { "on" } else { "off" }
        );

        let mut result = FlashResult {
            success: false,
            flashed: Vec::new(),
            skipped: Vec::new(),
            error: None,
            events: Vec::new(),
            duration: Duration::ZERO,
        };

        for (completed, entry) in entries.iter().enumerate() {
            if self.cancel_token.is_cancelled() {
                warn!("Flash cancelled after {} images", completed);
                self.progress.warn(
                    step_percent(completed, entries.len(), 95, 0),
                    "Flash cancelled",
                );
                result.error = Some(VaultError::Cancelled);
                break;
            }

            let percent = step_percent(completed, entries.len(), 95, 0);
            self.progress
                .info(percent, format!("Flashing {}...", entry.partition_name));

            match self.flash_entry(entry, &table, plan, percent) {
                Ok(Step::Flashed(bytes)) => {
                    meter.record(bytes);
                    result.flashed.push(entry.partition_name.clone());
                }
                Ok(Step::Skipped) => result.skipped.push(entry.partition_name.clone()),
                Err(e @ VaultError::SizeMismatch { .. }) => {
                    error!("Flash aborted: {}", e);
                    self.progress.error(percent, format!("Aborted: {}", e));
                    result.error = Some(e);
                    break;
                }
                Err(e) => {
                    error!("Flash of {} failed: {}", entry.partition_name, e);
                    self.progress.error(
                        percent,
                        format!("Flash of {} failed: {}", entry.partition_name, e),
                    );
                    let abort = self.policy.should_abort();
                    if result.error.is_none() {
                        result.error = Some(e);
                    }
                    if abort {
                        break;
                    }
                }
            }
        }

        result.success = result.error.is_none();
        if result.success {
            self.progress.info(
                100,
                format!("Flash complete: {} partitions", result.flashed.len()),
            );
            if plan.reboot_on_success {
                match self.device.reboot() {
                    Ok(()) => info!("Reboot requested"),
                    Err(e) => {
                        warn!("Reboot request failed: {}", e);
                        self.progress.warn(100, format!("Reboot failed: {}", e));
                    }
                }
            }
        }

        info!(
            "Flash finished: {} flashed, {} skipped, {}",
            result.flashed.len(),
            result.skipped.len(),
            meter.summary()
        );
        result.duration = meter.elapsed();
        result.events = self.progress.take_events();
        Ok(result)
    }

    fn flash_entry(
        &mut self,
        entry: &FirmwarePartition,
        table: &PartitionTable,
        plan: &FlashPlan,
        percent: u8,
    ) -> Result<Step> {
        let name = &entry.partition_name;

        let image_size = match fs::metadata(&entry.file_path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                warn!("Image for {} not found at {}", name, entry.file_path.display());
                self.progress
                    .warn(percent, format!("Image file missing for {}, skipped", name));
                return Ok(Step::Skipped);
            }
        };

        let (target, flagged) = match entry.start_sector {
            Some(start_sector) => {
                let sector_count = image_size.div_ceil(table.sector_size as u64);
                let covered = table.overlapping(start_sector, sector_count);
                check_range_fits(name, image_size, start_sector, sector_count, &covered, table)?;

                let flagged =
                    entry.is_critical || covered.iter().any(|p| p.is_critical || p.is_high_risk);
                let target = WriteTarget::Lba {
                    start_sector,
                    sector_count,
                };
                (target, flagged)
            }
            None => {
                let live = table.find(name);
                if let Some(live) = live {
                    if image_size > live.size_bytes {
                        return Err(VaultError::SizeMismatch {
                            partition: name.clone(),
                            image_size,
                            capacity: live.size_bytes,
                        });
                    }
                }
                let flagged =
                    entry.is_critical || live.is_some_and(|p| p.is_critical || p.is_high_risk);
                (WriteTarget::Partition(name.clone()), flagged)
            }
        };

        if plan.safe_mode && flagged {
            info!("Safe mode: skipping {}", name);
            self.progress
                .warn(percent, format!("Safe mode: skipping critical partition {}", name));
            return Ok(Step::Skipped);
        }

        let (digest, _) = sha256_reader(BufReader::new(File::open(&entry.file_path)?), self.chunk_size)?;
        info!("{} image sha256 {}", name, digest);
        self.progress
            .info(percent, format!("{}: sha256 {}", name, short_digest(&digest)));

        let mut source = BufReader::new(File::open(&entry.file_path)?);
        let mut sink = self.device.open_writable_sink(&target)?;
        let written = copy_chunked(&mut source, &mut sink, self.chunk_size)?;
        sink.flush()?;
        if !sink.close()? {
            return Err(VaultError::DeviceWrite(format!("device rejected write to {}", target)));
        }

        info!("Flashed {} to {} ({})", name, target, format_bytes(written));
        Ok(Step::Flashed(written))
    }
}

/// A raw sector write must stay inside a single live partition. Ranges that
/// touch no partition at all (GPT headers, gaps) are allowed.
fn check_range_fits(
    name: &str,
    image_size: u64,
    start_sector: u64,
    sector_count: u64,
    covered: &[&PartitionInfo],
    table: &PartitionTable,
) -> Result<()> {
    let Some(first) = covered.first() else {
        return Ok(());
    };

    let end = start_sector + sector_count;
    let fits = covered.len() == 1
        && first.start_lba <= start_sector
        && end <= first.end_lba(table.sector_size);
    if fits {
        return Ok(());
    }

    let capacity = if first.start_lba <= start_sector {
        (first.end_lba(table.sector_size) - start_sector) * table.sector_size as u64
    } else {
        0
    };
    warn!(
        "{} at lba {}+{} crosses the bounds of {}",
        name, start_sector, sector_count, first.name
    );
    Err(VaultError::SizeMismatch {
        partition: first.name.clone(),
        image_size,
        capacity,
    })
}
