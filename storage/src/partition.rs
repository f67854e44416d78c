use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Geometry of a raw flash partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Program unit, reported to callers as the sector size.
    pub page_size: u32,
    /// Erase unit.
    pub block_size: u32,
    pub partition_size: u32,
}

impl PartitionInfo {
    pub fn num_blocks(&self) -> u32 {
        if self.block_size == 0 {
            0
        } else {
            self.partition_size / self.block_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("No partition named {0}")]
    NotFound(String),

    #[error("Access out of range: offset {offset}, length {length}")]
    OutOfRange { offset: u32, length: usize },

    #[error("Power lost during flash operation")]
    PowerLost,

    #[error("Device error: {0}")]
    Device(String),
}

/// Raw access to one named flash partition.
///
/// Programming follows NOR rules: a write can only clear bits, an erase
/// returns the whole block containing `offset` to `0xFF`.
pub trait Partition {
    fn info(&self) -> PartitionInfo;

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), PartitionError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), PartitionError>;

    fn erase(&mut self, offset: u32) -> Result<(), PartitionError>;

    /// Erase issued from the background scheduler. Devices with a
    /// suspendable erase override this; the default erases in place.
    fn erase_background(&mut self, offset: u32) -> Result<(), PartitionError> {
        self.erase(offset)
    }
}

/// Opens partitions by name.
pub trait PartitionManager {
    type Partition: Partition;

    fn open(&mut self, name: &str) -> Result<Self::Partition, PartitionError>;
}

#[derive(Debug)]
struct Flash {
    data: Vec<u8>,
    info: PartitionInfo,
    power_budget: Option<usize>,
    writes: u64,
    erases: u64,
}

impl Flash {
    fn check_range(&self, offset: u32, length: usize) -> Result<std::ops::Range<usize>, PartitionError> {
        let start = offset as usize;
        match start.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(PartitionError::OutOfRange { offset, length }),
        }
    }

    fn consume_power(&mut self) -> Result<(), PartitionError> {
        match self.power_budget.as_mut() {
            Some(0) => Err(PartitionError::PowerLost),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// In-memory NOR flash. Clones share the same storage, so a handle kept
/// by a test survives the file system instance that used it.
#[derive(Debug, Clone)]
pub struct RamPartition {
    flash: Arc<Mutex<Flash>>,
}

impl RamPartition {
    pub const DEFAULT_PAGE_SIZE: u32 = 256;

    /// A fully erased partition of `num_blocks` blocks.
    pub fn new(block_size: u32, num_blocks: u32) -> Self {
        let partition_size = block_size * num_blocks;
        Self {
            flash: Arc::new(Mutex::new(Flash {
                data: vec![0xFF; partition_size as usize],
                info: PartitionInfo {
                    page_size: Self::DEFAULT_PAGE_SIZE,
                    block_size,
                    partition_size,
                },
                power_budget: None,
                writes: 0,
                erases: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Flash> {
        self.flash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let `ops` more writes or erases succeed, then fail every later one
    /// with [`PartitionError::PowerLost`] until power is restored.
    pub fn cut_power_after(&self, ops: usize) {
        self.lock().power_budget = Some(ops);
    }

    /// True once the budget set by [`cut_power_after`](Self::cut_power_after)
    /// is used up.
    pub fn power_lost(&self) -> bool {
        self.lock().power_budget == Some(0)
    }

    pub fn restore_power(&self) {
        self.lock().power_budget = None;
    }

    /// Number of writes and erases that reached the flash.
    pub fn flash_ops(&self) -> u64 {
        let flash = self.lock();
        flash.writes + flash.erases
    }

    pub fn erase_count(&self) -> u64 {
        self.lock().erases
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Overwrite raw bytes without NOR semantics.
    pub fn poke(&self, offset: u32, bytes: &[u8]) -> Result<(), PartitionError> {
        let mut flash = self.lock();
        let range = flash.check_range(offset, bytes.len())?;
        flash.data[range].copy_from_slice(bytes);
        Ok(())
    }
}

impl Partition for RamPartition {
    fn info(&self) -> PartitionInfo {
        self.lock().info
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), PartitionError> {
        let flash = self.lock();
        let range = flash.check_range(offset, buf.len())?;
        buf.copy_from_slice(&flash.data[range]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), PartitionError> {
        let mut flash = self.lock();
        let range = flash.check_range(offset, data.len())?;
        flash.consume_power()?;
        for (dst, src) in flash.data[range].iter_mut().zip(data) {
            *dst &= *src;
        }
        flash.writes += 1;
        Ok(())
    }

    fn erase(&mut self, offset: u32) -> Result<(), PartitionError> {
        let mut flash = self.lock();
        let block_size = flash.info.block_size;
        let start = offset - offset % block_size;
        let range = flash.check_range(start, block_size as usize)?;
        flash.consume_power()?;
        flash.data[range].fill(0xFF);
        flash.erases += 1;
        Ok(())
    }
}

/// Named set of [`RamPartition`]s.
#[derive(Debug, Clone, Default)]
pub struct RamPartitionManager {
    partitions: HashMap<String, RamPartition>,
}

impl RamPartitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, partition: RamPartition) {
        self.partitions.insert(name.to_string(), partition);
    }

    pub fn get(&self, name: &str) -> Option<&RamPartition> {
        self.partitions.get(name)
    }
}

impl PartitionManager for RamPartitionManager {
    type Partition = RamPartition;

    fn open(&mut self, name: &str) -> Result<RamPartition, PartitionError> {
        self.partitions
            .get(name)
            .cloned()
            .ok_or_else(|| PartitionError::NotFound(name.to_string()))
    }
}
