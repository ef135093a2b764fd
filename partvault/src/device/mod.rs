//! Device partition I/O capability.
//!
//! Engines never talk to a transport directly. They receive a [`DeviceIo`]
//! implementation (Firehose session, ADB shell pipe, image file, test double)
//! and drive it strictly sequentially: one partition at a time, never two
//! outstanding requests against the same instance.

pub mod image;
#[cfg(test)]
pub(crate) mod memory;

use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor, Read, Write};

/// Provenance of the device a backup came from.
///
/// Free text, used for naming and serial match-checking only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub brand: String,
    pub model: String,
    pub serial: String,
    pub chipset: String,
}

/// One row of the live partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub start_lba: u64,
    pub size_bytes: u64,

    /// Firmware/auth partition
    #[serde(default)]
    pub is_critical: bool,

    /// Calibration or IMEI-bearing partition
    #[serde(default)]
    pub is_high_risk: bool,
}

impl PartitionInfo {
    /// Sectors occupied, rounding a partial last sector up.
    pub fn sector_count(&self, sector_size: u32) -> u64 {
        self.size_bytes.div_ceil(sector_size.max(1) as u64)
    }

    /// First sector past the end of the partition.
    pub fn end_lba(&self, sector_size: u32) -> u64 {
        self.start_lba + self.sector_count(sector_size)
    }
}

/// Snapshot of the device partition layout.
///
/// Queried fresh for every operation; never cached across operations that
/// may change device state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    pub partitions: Vec<PartitionInfo>,
}

fn default_sector_size() -> u32 {
    512
}

impl PartitionTable {
    pub fn new(sector_size: u32, partitions: Vec<PartitionInfo>) -> Self {
        Self {
            sector_size,
            partitions,
        }
    }

    /// Look a partition up by name, ignoring ASCII case.
    pub fn find(&self, name: &str) -> Option<&PartitionInfo> {
        self.partitions
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Partitions sharing at least one sector with
    /// `start_sector..start_sector + sector_count`, in table order.
    pub fn overlapping(&self, start_sector: u64, sector_count: u64) -> Vec<&PartitionInfo> {
        let end = start_sector.saturating_add(sector_count);
        self.partitions
            .iter()
            .filter(|p| p.start_lba < end && start_sector < p.end_lba(self.sector_size))
            .collect()
    }

    /// Reject layouts no transfer can be addressed against.
    pub fn validate(&self) -> Result<()> {
        if self.sector_size == 0 {
            return Err(VaultError::Device(
                "partition table reports a sector size of 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Where a write lands on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteTarget {
    /// A named partition from the partition table
    Partition(String),

    /// A raw sector range, for firmware formats that address by offset
    Lba { start_sector: u64, sector_count: u64 },
}

impl std::fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteTarget::Partition(name) => f.write_str(name),
            WriteTarget::Lba {
                start_sector,
                sector_count,
            } => write!(f, "lba {}+{}", start_sector, sector_count),
        }
    }
}

/// A writable stream bound to one device target.
///
/// Some receivers (a `dd` on the other end of a shell pipe, a Firehose
/// `<program>` transfer) only commit the write once the sink is closed, so
/// callers must always finish with [`PartitionSink::close`].
pub trait PartitionSink: Write + Send {
    /// Flush and close the sink. Returns `false` when the device reports the
    /// write as failed.
    fn close(self: Box<Self>) -> io::Result<bool>;
}

/// Partition-level access to a connected device.
pub trait DeviceIo: Send {
    /// Whether the underlying session is initialised and able to transfer.
    fn is_ready(&self) -> bool;

    /// Identity reported by the device.
    fn identity(&self) -> DeviceIdentity;

    /// Read the live partition table.
    fn partition_table(&mut self) -> Result<PartitionTable>;

    /// Read a whole partition into memory.
    fn read_partition(&mut self, name: &str) -> Result<Vec<u8>>;

    /// Stream a partition's content.
    ///
    /// Transports that can stream should override this; the default buffers
    /// through [`DeviceIo::read_partition`].
    fn open_reader(&mut self, name: &str) -> Result<Box<dyn Read + Send + '_>> {
        let data = self.read_partition(name)?;
        Ok(Box::new(Cursor::new(data)))
    }

    /// Write a complete buffer to a partition.
    fn write_partition(&mut self, name: &str, data: &[u8]) -> Result<bool>;

    /// Erase a partition.
    fn erase_partition(&mut self, name: &str) -> Result<bool>;

    /// Open a streaming sink for the given target.
    fn open_writable_sink(&mut self, target: &WriteTarget) -> Result<Box<dyn PartitionSink + '_>>;

    /// Request a device reboot.
    fn reboot(&mut self) -> Result<()>;
}
