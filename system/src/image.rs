//! Flash partitions backed by image files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rafs::{Partition, PartitionError, PartitionInfo, PartitionManager};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::SystemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub page_size: u32,
    pub block_size: u32,
    pub num_blocks: u32,
}

impl ImageGeometry {
    pub fn partition_size(&self) -> u32 {
        self.block_size * self.num_blocks
    }

    fn info(&self) -> PartitionInfo {
        PartitionInfo {
            page_size: self.page_size,
            block_size: self.block_size,
            partition_size: self.partition_size(),
        }
    }
}

impl Default for ImageGeometry {
    fn default() -> Self {
        Self {
            page_size: 256,
            block_size: 4096,
            num_blocks: 256,
        }
    }
}

fn device_error(e: std::io::Error) -> PartitionError {
    PartitionError::Device(e.to_string())
}

/// One image file with NOR flash semantics.
#[derive(Debug)]
pub struct FilePartition {
    file: File,
    info: PartitionInfo,
}

impl FilePartition {
    /// Create an erased image.
    pub fn create(path: &Path, geometry: ImageGeometry) -> Result<Self, SystemError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let erased = vec![0xFFu8; geometry.block_size as usize];
        for _ in 0..geometry.num_blocks {
            file.write_all(&erased)?;
        }
        file.sync_all()?;
        info!("Created image {} ({} bytes)", path.display(), geometry.partition_size());
        Ok(Self { file, info: geometry.info() })
    }

    pub fn open(path: &Path, geometry: ImageGeometry) -> Result<Self, SystemError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != u64::from(geometry.partition_size()) {
            return Err(SystemError::InvalidImage {
                path: path.display().to_string(),
                reason: format!("size {} does not match geometry {:?}", len, geometry),
            });
        }
        Ok(Self { file, info: geometry.info() })
    }

    fn check_range(&self, offset: u32, length: usize) -> Result<(), PartitionError> {
        match (offset as usize).checked_add(length) {
            Some(end) if end <= self.info.partition_size as usize => Ok(()),
            _ => Err(PartitionError::OutOfRange { offset, length }),
        }
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), PartitionError> {
        self.file.seek(SeekFrom::Start(u64::from(offset))).map_err(device_error)?;
        self.file.read_exact(buf).map_err(device_error)
    }

    fn write_at(&mut self, offset: u32, data: &[u8]) -> Result<(), PartitionError> {
        self.file.seek(SeekFrom::Start(u64::from(offset))).map_err(device_error)?;
        self.file.write_all(data).map_err(device_error)
    }
}

impl Partition for FilePartition {
    fn info(&self) -> PartitionInfo {
        self.info
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), PartitionError> {
        self.check_range(offset, buf.len())?;
        self.read_at(offset, buf)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), PartitionError> {
        self.check_range(offset, data.len())?;
        let mut current = vec![0u8; data.len()];
        self.read_at(offset, &mut current)?;
        for (dst, src) in current.iter_mut().zip(data) {
            *dst &= *src;
        }
        self.write_at(offset, &current)
    }

    fn erase(&mut self, offset: u32) -> Result<(), PartitionError> {
        let start = offset - offset % self.info.block_size;
        self.check_range(start, self.info.block_size as usize)?;
        let erased = vec![0xFFu8; self.info.block_size as usize];
        self.write_at(start, &erased)
    }
}

/// Maps partition names to `<dir>/<name>.img`.
#[derive(Debug, Clone)]
pub struct FilePartitionManager {
    dir: PathBuf,
    geometry: ImageGeometry,
    create_missing: bool,
}

impl FilePartitionManager {
    pub fn new(dir: impl Into<PathBuf>, geometry: ImageGeometry) -> Self {
        Self {
            dir: dir.into(),
            geometry,
            create_missing: false,
        }
    }

    /// Create erased images for unknown names instead of failing.
    pub fn create_missing(mut self, create: bool) -> Self {
        self.create_missing = create;
        self
    }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.img", name))
    }
}

impl PartitionManager for FilePartitionManager {
    type Partition = FilePartition;

    fn open(&mut self, name: &str) -> Result<FilePartition, PartitionError> {
        let path = self.image_path(name);
        let opened = if path.exists() {
            FilePartition::open(&path, self.geometry)
        } else if self.create_missing {
            FilePartition::create(&path, self.geometry)
        } else {
            return Err(PartitionError::NotFound(name.to_string()));
        };
        opened.map_err(|e| PartitionError::Device(e.to_string()))
    }
}
