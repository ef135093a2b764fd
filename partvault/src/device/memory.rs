//! In-memory device used by engine tests.

use super::{DeviceIdentity, DeviceIo, PartitionInfo, PartitionSink, PartitionTable, WriteTarget};
use crate::{Result, VaultError};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Every call that reached the device's write path, in order.
pub type WriteLog = Arc<Mutex<Vec<String>>>;

pub struct MemoryDevice {
    pub ready: bool,
    pub identity: DeviceIdentity,
    pub table: PartitionTable,
    pub contents: HashMap<String, Vec<u8>>,
    /// Partitions whose reads fail with a device error
    pub failing_reads: HashSet<String>,
    /// Targets whose sinks report failure on close
    pub failing_writes: HashSet<String>,
    pub writes: WriteLog,
    pub committed: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub reboots: usize,
}

impl MemoryDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            ready: true,
            identity: DeviceIdentity {
                brand: "Acme".to_string(),
                model: "Phone 1".to_string(),
                serial: serial.to_string(),
                chipset: "SM8250".to_string(),
            },
            table: PartitionTable::new(512, Vec::new()),
            contents: HashMap::new(),
            failing_reads: HashSet::new(),
            failing_writes: HashSet::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
            committed: Arc::new(Mutex::new(HashMap::new())),
            reboots: 0,
        }
    }

    /// Add a partition with explicit content; capacity equals content length
    /// unless `capacity` is larger.
    pub fn with_partition(mut self, name: &str, data: Vec<u8>, capacity: u64) -> Self {
        let start_lba = self
            .table
            .partitions
            .last()
            .map(|p| p.start_lba + p.size_bytes.div_ceil(512))
            .unwrap_or(34);
        self.table.partitions.push(PartitionInfo {
            name: name.to_string(),
            start_lba,
            size_bytes: capacity.max(data.len() as u64),
            is_critical: false,
            is_high_risk: false,
        });
        self.contents.insert(name.to_string(), data);
        self
    }

    pub fn mark_high_risk(mut self, name: &str) -> Self {
        if let Some(p) = self.table.partitions.iter_mut().find(|p| p.name == name) {
            p.is_high_risk = true;
        }
        self
    }

    pub fn mark_critical(mut self, name: &str) -> Self {
        if let Some(p) = self.table.partitions.iter_mut().find(|p| p.name == name) {
            p.is_critical = true;
        }
        self
    }

    pub fn written_targets(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn committed(&self, name: &str) -> Option<Vec<u8>> {
        self.committed.lock().unwrap().get(name).cloned()
    }
}

impl DeviceIo for MemoryDevice {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn partition_table(&mut self) -> Result<PartitionTable> {
        Ok(self.table.clone())
    }

    fn read_partition(&mut self, name: &str) -> Result<Vec<u8>> {
        if self.failing_reads.contains(name) {
            return Err(VaultError::Device(format!("read of {} failed", name)));
        }
        self.contents
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("partition {}", name)))
    }

    fn write_partition(&mut self, name: &str, data: &[u8]) -> Result<bool> {
        let mut sink = self.open_writable_sink(&WriteTarget::Partition(name.to_string()))?;
        sink.write_all(data)?;
        Ok(sink.close()?)
    }

    fn erase_partition(&mut self, name: &str) -> Result<bool> {
        self.writes.lock().unwrap().push(format!("erase:{}", name));
        self.contents.insert(name.to_string(), Vec::new());
        Ok(true)
    }

    fn open_writable_sink(&mut self, target: &WriteTarget) -> Result<Box<dyn PartitionSink + '_>> {
        let label = target.to_string();
        self.writes.lock().unwrap().push(label.clone());
        Ok(Box::new(MemorySink {
            fail: self.failing_writes.contains(&label),
            label,
            buffer: Vec::new(),
            committed: Arc::clone(&self.committed),
        }))
    }

    fn reboot(&mut self) -> Result<()> {
        self.reboots += 1;
        Ok(())
    }
}

struct MemorySink {
    label: String,
    buffer: Vec<u8>,
    fail: bool,
    committed: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PartitionSink for MemorySink {
    fn close(self: Box<Self>) -> io::Result<bool> {
        if self.fail {
            return Ok(false);
        }
        self.committed
            .lock()
            .unwrap()
            .insert(self.label.clone(), self.buffer.clone());
        Ok(true)
    }
}
