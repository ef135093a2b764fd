//! Image-file backed device.
//!
//! Treats a raw disk image plus a JSON layout as a connected device. Useful
//! for working against a full-disk dump offline and as an end-to-end fixture.
//!
//! Layout file example:
//!
//! ```json
//! {
//!   "identity": { "brand": "Xiaomi", "model": "M2101K6G", "serial": "a1b2c3", "chipset": "SM7150" },
//!   "image": "disk.img",
//!   "sector_size": 512,
//!   "partitions": [
//!     { "name": "boot", "start_lba": 2048, "size_bytes": 67108864, "is_critical": true }
//!   ]
//! }
//! ```

use super::{DeviceIdentity, DeviceIo, PartitionSink, PartitionTable, WriteTarget};
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const ERASE_CHUNK: usize = 1024 * 1024;

/// On-disk description of an image device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLayout {
    pub identity: DeviceIdentity,

    /// Disk image path, relative to the layout file
    pub image: PathBuf,

    #[serde(flatten)]
    pub table: PartitionTable,
}

/// A raw disk image exposed through [`DeviceIo`].
pub struct ImageDevice {
    layout: ImageLayout,
    image_path: PathBuf,
    reboot_requested: bool,
}

impl ImageDevice {
    /// Open a device from its layout file.
    pub fn open<P: AsRef<Path>>(layout_path: P) -> Result<Self> {
        let layout_path = layout_path.as_ref();
        let content = fs::read_to_string(layout_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                VaultError::NotFound(format!("device layout {}", layout_path.display()))
            }
            _ => VaultError::Io(e),
        })?;
        let layout: ImageLayout = serde_json::from_str(&content)?;
        layout.table.validate()?;

        let base = layout_path.parent().unwrap_or_else(|| Path::new("."));
        let image_path = base.join(&layout.image);

        debug!(
            "Opened image device {} ({} partitions)",
            image_path.display(),
            layout.table.len()
        );

        Ok(Self {
            layout,
            image_path,
            reboot_requested: false,
        })
    }

    /// Create a zero-filled image and its layout file inside `dir`.
    pub fn create<P: AsRef<Path>>(
        dir: P,
        identity: DeviceIdentity,
        table: PartitionTable,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        table.validate()?;
        fs::create_dir_all(dir)?;

        let sector_size = table.sector_size as u64;
        let image_len = table
            .partitions
            .iter()
            .map(|p| p.start_lba * sector_size + p.size_bytes)
            .max()
            .unwrap_or(0);

        let image_path = dir.join("disk.img");
        let image = File::create(&image_path)?;
        image.set_len(image_len)?;

        let layout = ImageLayout {
            identity,
            image: PathBuf::from("disk.img"),
            table,
        };
        fs::write(
            dir.join("layout.json"),
            serde_json::to_string_pretty(&layout)?,
        )?;

        Ok(Self {
            layout,
            image_path,
            reboot_requested: false,
        })
    }

    /// Whether a reboot was requested since the device was opened.
    pub fn reboot_requested(&self) -> bool {
        self.reboot_requested
    }

    /// Byte offset and capacity of a write target inside the image.
    fn resolve(&self, target: &WriteTarget) -> Result<(u64, u64)> {
        let sector_size = self.layout.table.sector_size as u64;
        match target {
            WriteTarget::Partition(name) => {
                let part = self
                    .layout
                    .table
                    .find(name)
                    .ok_or_else(|| VaultError::NotFound(format!("partition {}", name)))?;
                Ok((part.start_lba * sector_size, part.size_bytes))
            }
            WriteTarget::Lba {
                start_sector,
                sector_count,
            } => Ok((start_sector * sector_size, sector_count * sector_size)),
        }
    }
}

impl DeviceIo for ImageDevice {
    fn is_ready(&self) -> bool {
        self.image_path.is_file()
    }

    fn identity(&self) -> DeviceIdentity {
        self.layout.identity.clone()
    }

    fn partition_table(&mut self) -> Result<PartitionTable> {
        Ok(self.layout.table.clone())
    }

    fn read_partition(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open_reader(name)?.read_to_end(&mut data)?;
        Ok(data)
    }

    fn open_reader(&mut self, name: &str) -> Result<Box<dyn Read + Send + '_>> {
        let (offset, size) = self.resolve(&WriteTarget::Partition(name.to_string()))?;
        let mut file = File::open(&self.image_path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file.take(size)))
    }

    fn write_partition(&mut self, name: &str, data: &[u8]) -> Result<bool> {
        let mut sink = self.open_writable_sink(&WriteTarget::Partition(name.to_string()))?;
        sink.write_all(data)?;
        Ok(sink.close()?)
    }

    fn erase_partition(&mut self, name: &str) -> Result<bool> {
        let (_, size) = self.resolve(&WriteTarget::Partition(name.to_string()))?;
        let mut sink = self.open_writable_sink(&WriteTarget::Partition(name.to_string()))?;

        let zeros = vec![0u8; ERASE_CHUNK];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(ERASE_CHUNK as u64) as usize;
            sink.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }

        Ok(sink.close()?)
    }

    fn open_writable_sink(&mut self, target: &WriteTarget) -> Result<Box<dyn PartitionSink + '_>> {
        let (offset, capacity) = self.resolve(target)?;
        let mut file = OpenOptions::new().write(true).open(&self.image_path)?;
        file.seek(SeekFrom::Start(offset))?;

        Ok(Box::new(ImageSink {
            file,
            remaining: capacity,
        }))
    }

    fn reboot(&mut self) -> Result<()> {
        info!("Reboot requested for image device {}", self.image_path.display());
        self.reboot_requested = true;
        Ok(())
    }
}

/// Sink that refuses to write past the end of its target.
struct ImageSink {
    file: File,
    remaining: u64,
}

impl Write for ImageSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() as u64 > self.remaining {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write exceeds target capacity",
            ));
        }
        self.file.write_all(buf)?;
        self.remaining -= buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl PartitionSink for ImageSink {
    fn close(mut self: Box<Self>) -> io::Result<bool> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(true)
    }
}
