use crate::filesystem::{IdleCallback, Rafs};
use crate::partition::PartitionManager;
use crate::path;
use crate::{RafsError, Result};

/// Raw I/O control codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IocType {
    GetPartitionHandle = 0,
    GetFileOffset = 1,
    SetAppStatusIdleCb = 2,
}

impl TryFrom<u32> for IocType {
    type Error = RafsError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(IocType::GetPartitionHandle),
            1 => Ok(IocType::GetFileOffset),
            2 => Ok(IocType::SetAppStatusIdleCb),
            other => Err(RafsError::UnsupportedIoControl(other)),
        }
    }
}

/// Argument passed with a raw control code.
pub enum IoArg<'a> {
    /// Partition path for code 0, file path for code 1.
    Path(&'a str),
    IdleCallback(IdleCallback),
}

/// Result of a raw control request.
#[derive(Debug)]
pub enum IoReply<'a, P> {
    Partition(&'a P),
    FileOffset(u32),
    Done,
}

impl<M: PartitionManager> Rafs<M> {
    /// Dispatch a raw control code. An argument of the wrong kind for the
    /// code is rejected like an unknown code.
    pub fn io_control(&mut self, code: u32, arg: IoArg<'_>) -> Result<IoReply<'_, M::Partition>> {
        match (IocType::try_from(code)?, arg) {
            (IocType::GetPartitionHandle, IoArg::Path(partition)) => {
                self.partition_handle(partition).map(IoReply::Partition)
            }
            (IocType::GetFileOffset, IoArg::Path(path)) => {
                self.file_offset(path).map(IoReply::FileOffset)
            }
            (IocType::SetAppStatusIdleCb, IoArg::IdleCallback(is_idle)) => {
                self.idle_callback = Some(is_idle);
                Ok(IoReply::Done)
            }
            _ => Err(RafsError::UnsupportedIoControl(code)),
        }
    }

    /// Borrow the raw partition backing the mounted volume.
    pub fn partition_handle(&self, partition: &str) -> Result<&M::Partition> {
        Ok(&self.mounted_ref(partition)?.partition)
    }

    /// Absolute byte offset of a file's first block within its partition.
    pub fn file_offset(&mut self, path: &str) -> Result<u32> {
        let volume = self.mounted(path)?;
        let name = path::filename(path)?;
        let limit = volume.free_dir_slot;
        let block_size = volume.info.block_size;
        let (_, entry) = volume.fat().find_by_name(limit, &name)?.ok_or(RafsError::FileNotFound)?;
        Ok(u32::from(entry.extents[0].offset) * block_size)
    }

    /// Install the predicate the idle timer asks before compacting.
    pub fn set_idle_callback<F>(&mut self, is_idle: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.idle_callback = Some(Box::new(is_idle));
    }
}
