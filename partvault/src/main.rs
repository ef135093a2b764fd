//! Partvault - command-line entry point
//!
//! Back up, restore and flash partitions of a device described by an image
//! layout file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use partvault::codec::short_digest;
use partvault::config::Config;
use partvault::device::image::ImageDevice;
use partvault::engine::backup::{BackupEngine, BackupPlan};
use partvault::engine::flash::{FlashEngine, FlashPlan};
use partvault::engine::restore::{RestoreEngine, RestorePlan};
use partvault::engine::validate::IntegrityValidator;
use partvault::engine::{ProgressCallback, ProgressLevel, ProgressUpdate};
use partvault::firmware::FirmwareManifest;
use partvault::manifest::{self, BackupFormat, BackupType};
use partvault::shutdown::ShutdownCoordinator;
use partvault::transfer::{format_bytes, format_duration};
use partvault::utils;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up device partitions
    Backup {
        /// Device layout file
        #[arg(long, value_name = "LAYOUT")]
        device: PathBuf,

        /// Parent directory for the backup (overrides config)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// full, critical, userdata or custom
        #[arg(long = "type", default_value = "full")]
        backup_type: BackupType,

        /// raw, compressed or packaged (overrides config)
        #[arg(long)]
        format: Option<BackupFormat>,

        /// Partition to include with --type custom
        #[arg(short, long = "partition", value_name = "NAME")]
        partitions: Vec<String>,

        #[arg(long)]
        encrypt: bool,

        #[arg(long)]
        compress: bool,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Restore a backup onto the device
    Restore {
        #[arg(long, value_name = "LAYOUT")]
        device: PathBuf,

        /// Backup directory, manifest.json or archive
        source: PathBuf,

        /// Only restore these partitions
        #[arg(short, long = "partition", value_name = "NAME")]
        partitions: Vec<String>,

        /// Save high-risk partitions here before overwriting (overrides config)
        #[arg(long)]
        safety_backup_dir: Option<PathBuf>,
    },

    /// Flash a firmware package
    Flash {
        #[arg(long, value_name = "LAYOUT")]
        device: PathBuf,

        /// Image folder, scatter file, partition list or single image
        firmware: PathBuf,

        /// Also write critical and high-risk partitions
        #[arg(long)]
        no_safe_mode: bool,

        /// Do not reboot after a successful flash
        #[arg(long)]
        no_reboot: bool,
    },

    /// Print a backup's manifest
    Inspect { source: PathBuf },

    /// Check a backup's integrity without touching any device
    Verify {
        #[arg(long)]
        serial: String,

        source: PathBuf,
    },
}

fn print_progress() -> ProgressCallback {
    Arc::new(|update: &ProgressUpdate| {
        let marker = match update.level {
            ProgressLevel::Info => " ",
            ProgressLevel::Warn => "!",
            ProgressLevel::Error => "x",
        };
        println!("[{:>3}%]{} {}", update.percent, marker, update.message);
    })
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("partvault v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new();
    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.wait_for_signal().await }
    });

    let chunk_size = config.transfer.chunk_size;
    let token = shutdown.token();

    let code = match args.command {
        Command::Backup {
            device,
            out,
            backup_type,
            format,
            partitions,
            encrypt,
            compress,
            notes,
        } => {
            let mut plan = BackupPlan::new(
                out.unwrap_or(config.backup.output_dir.clone()),
                backup_type,
                format.unwrap_or(config.backup.format),
            );
            plan.partitions = partitions;
            plan.encrypt = encrypt || config.backup.encrypt;
            plan.compress = compress || config.backup.compress;
            plan.notes = notes;

            let result = tokio::task::spawn_blocking(move || {
                let mut device = ImageDevice::open(&device)?;
                let mut engine = BackupEngine::with_cancel(&mut device, token)
                    .with_progress(print_progress())
                    .with_chunk_size(chunk_size);
                engine.execute(&plan)
            })
            .await??;

            println!(
                "Backed up {} partitions ({} failed), {} in {}",
                result.partitions_backed_up,
                result.partitions_failed,
                format_bytes(result.total_bytes),
                format_duration(result.duration.as_secs())
            );
            if result.manifest.is_some() {
                println!("Output: {}", result.output_path.display());
            }
            if let Some(error) = &result.error {
                eprintln!("Error: {}", error);
            }
            exit_code(result.success)
        }

        Command::Restore {
            device,
            source,
            partitions,
            safety_backup_dir,
        } => {
            let mut plan = RestorePlan::new(source);
            plan.partitions = partitions;
            plan.safety_backup_dir = safety_backup_dir.or(config.restore.safety_backup_dir.clone());

            let result = tokio::task::spawn_blocking(move || {
                let mut device = ImageDevice::open(&device)?;
                let mut engine = RestoreEngine::with_cancel(&mut device, token)
                    .with_validator(IntegrityValidator::new().with_chunk_size(chunk_size))
                    .with_progress(print_progress())
                    .with_chunk_size(chunk_size);
                engine.execute(&plan)
            })
            .await??;

            println!(
                "Restored {} partitions ({} failed) in {}",
                result.partitions_restored,
                result.partitions_failed,
                format_duration(result.duration.as_secs())
            );
            if let Some(error) = &result.error {
                eprintln!("Error: {}", error);
            }
            exit_code(result.success)
        }

        Command::Flash {
            device,
            firmware,
            no_safe_mode,
            no_reboot,
        } => {
            let firmware = FirmwareManifest::from_path(&firmware)
                .with_context(|| format!("loading firmware {}", firmware.display()))?;
            let plan = FlashPlan {
                safe_mode: config.flash.safe_mode && !no_safe_mode,
                reboot_on_success: config.flash.reboot_on_success && !no_reboot,
            };
            if !plan.safe_mode {
                tracing::warn!("Safe mode disabled: critical partitions will be written");
            }

            let result = tokio::task::spawn_blocking(move || {
                let mut device = ImageDevice::open(&device)?;
                let mut engine = FlashEngine::with_cancel(&mut device, token)
                    .with_progress(print_progress())
                    .with_chunk_size(chunk_size);
                engine.execute(&firmware, &plan)
            })
            .await??;

            println!(
                "Flashed {} partitions, skipped {} in {}",
                result.flashed.len(),
                result.skipped.len(),
                format_duration(result.duration.as_secs())
            );
            if !result.skipped.is_empty() {
                println!("Skipped: {}", result.skipped.join(", "));
            }
            if let Some(error) = &result.error {
                eprintln!("Error: {}", error);
            }
            exit_code(result.success)
        }

        Command::Inspect { source } => {
            let manifest = manifest::load(&source)?;

            println!(
                "{} {} (serial {}, chipset {})",
                manifest.device_brand, manifest.device_model, manifest.device_serial, manifest.chipset
            );
            println!(
                "Created {}, type {}, format {}, version {}",
                manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
                manifest.backup_type,
                manifest.format,
                manifest.version
            );
            if let Some(notes) = &manifest.notes {
                println!("Notes: {}", notes);
            }
            for entry in &manifest.partitions {
                let mut flags = Vec::new();
                if entry.is_compressed {
                    flags.push("gzip");
                }
                if entry.is_encrypted {
                    flags.push("aes");
                }
                println!(
                    "  {:<20} {:>12}  {}  {}",
                    entry.name,
                    format_bytes(entry.size_bytes),
                    short_digest(&entry.sha256),
                    flags.join(",")
                );
            }
            println!(
                "{} partitions, {}",
                manifest.partitions.len(),
                format_bytes(manifest.total_bytes())
            );

            let missing = if source.is_dir() {
                manifest.missing_files(&source)
            } else {
                Vec::new()
            };
            for name in &missing {
                eprintln!("Missing file {}", name);
            }
            exit_code(missing.is_empty())
        }

        Command::Verify { serial, source } => {
            let outcome = tokio::task::spawn_blocking(move || {
                IntegrityValidator::new()
                    .with_chunk_size(chunk_size)
                    .check(&source, &serial)
            })
            .await?;

            match outcome {
                Ok(()) => {
                    println!("Backup verified");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Verification failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    };

    signals.abort();
    Ok(code)
}
