use serde::Serialize;

use crate::fat::{FatCopy, FatTable, FIRST_FILE_SLOT};
use crate::partition::Partition;
use crate::volume::Volume;
use crate::{RafsError, Result};

/// Handle of the single open directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirStat {
    pub filename: String,
    pub file_size: u32,
    pub sequence_count: u16,
    pub access_count: u16,
}

#[derive(Debug)]
pub(crate) struct DirCursor {
    id: DirId,
    next_slot: usize,
    present: usize,
    read: usize,
}

impl<P: Partition> Volume<P> {
    pub(crate) fn open_directory(&mut self) -> Result<(DirId, usize)> {
        if self.directory.is_some() {
            return Err(RafsError::DirectoryOpen);
        }
        let present = self.count_live()?;
        self.next_dir_id = self.next_dir_id.wrapping_add(1);
        let id = DirId(self.next_dir_id);
        self.directory = Some(DirCursor {
            id,
            next_slot: FIRST_FILE_SLOT,
            present,
            read: 0,
        });
        Ok((id, present))
    }

    pub(crate) fn read_directory(&mut self, id: DirId) -> Result<DirStat> {
        let limit = self.free_dir_slot;
        let Volume { directory, partition, .. } = self;
        let cursor = directory.as_mut().filter(|c| c.id == id).ok_or(RafsError::BadId)?;
        if cursor.read == cursor.present {
            return Err(RafsError::NoMoreFiles);
        }

        let mut fat = FatTable::new(partition);
        while cursor.next_slot < limit {
            let entry = fat.read_entry(FatCopy::Primary, cursor.next_slot)?;
            cursor.next_slot += 1;
            if entry.is_live() {
                cursor.read += 1;
                return Ok(DirStat {
                    filename: entry.filename(),
                    file_size: entry.file_size,
                    sequence_count: entry.counters.sequence_count,
                    access_count: entry.access_count(),
                });
            }
        }
        Err(RafsError::NoMoreFiles)
    }

    pub(crate) fn close_directory(&mut self, id: DirId) -> Result<()> {
        if self.directory.as_ref().map(|c| c.id) != Some(id) {
            return Err(RafsError::BadId);
        }
        self.directory = None;
        Ok(())
    }
}
