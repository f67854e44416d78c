use std::fmt;

use tracing::{error, warn};

use crate::dirent::{DirEntry, Extent, Filename, ACCESS_OFFSET, MAX_DIR_ENTRIES, MAX_EXTENTS};
use crate::fat::FatCopy;
use crate::partition::Partition;
use crate::scheduler::Responder;
use crate::volume::Volume;
use crate::{RafsError, Result};

/// Index of an open file handle slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub(crate) usize);

impl FileId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug)]
pub(crate) struct OpenFile {
    pub(crate) entry: DirEntry,
    pub(crate) responder: Option<Responder>,
    pub(crate) dir_slot: usize,
    pub(crate) mode: OpenMode,
    pub(crate) position: u32,
    pub(crate) current_extent: usize,
    pub(crate) extent_position: u32,
}

impl OpenFile {
    fn new(entry: DirEntry, dir_slot: usize, mode: OpenMode, responder: Option<Responder>) -> Self {
        Self {
            entry,
            responder,
            dir_slot,
            mode,
            position: 0,
            current_extent: 0,
            extent_position: 0,
        }
    }

    fn extent_bytes(&self, block_size: u32) -> u32 {
        let extent = self.entry.extents[self.current_extent];
        if extent.is_unused() {
            0
        } else {
            u32::from(extent.length) * block_size
        }
    }

    fn current_offset(&self, block_size: u32) -> u32 {
        u32::from(self.entry.extents[self.current_extent].offset) * block_size + self.extent_position
    }
}

/// Fixed-capacity table of open handles.
#[derive(Debug)]
pub(crate) struct FileTable {
    slots: Vec<Option<OpenFile>>,
    writer_open: bool,
}

impl FileTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            writer_open: false,
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn get(&self, id: FileId) -> Result<&OpenFile> {
        self.slots.get(id.0).and_then(Option::as_ref).ok_or(RafsError::BadId)
    }

    pub(crate) fn get_mut(&mut self, id: FileId) -> Result<&mut OpenFile> {
        self.slots.get_mut(id.0).and_then(Option::as_mut).ok_or(RafsError::BadId)
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn remove(&mut self, id: FileId) -> Result<OpenFile> {
        self.slots.get_mut(id.0).and_then(Option::take).ok_or(RafsError::BadId)
    }

    pub(crate) fn find_by_name(&self, name: &Filename) -> Option<FileId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|f| f.entry.has_name(name)))
            .map(FileId)
    }
}

impl<P: Partition> Volume<P> {
    pub(crate) fn open_read(&mut self, name: &Filename, responder: Option<Responder>) -> Result<FileId> {
        let limit = self.free_dir_slot;
        let (slot, mut entry) = self.fat().find_by_name(limit, name)?.ok_or(RafsError::FileNotFound)?;
        let index = self.files.free_slot().ok_or(RafsError::MaxFilesOpened)?;

        entry.counters.access_count <<= 1;
        let access = entry.counters.access_count.to_le_bytes();
        let mut fat = self.fat();
        for copy in [FatCopy::Primary, FatCopy::Secondary] {
            if let Err(e) = fat.write_member(copy, slot, ACCESS_OFFSET, &access) {
                warn!("Updating access count of {} failed: {}", name, e);
            }
        }

        self.files.slots[index] = Some(OpenFile::new(entry, slot, OpenMode::Read, responder));
        Ok(FileId(index))
    }

    pub(crate) fn open_write(&mut self, name: &Filename, responder: Option<Responder>) -> Result<FileId> {
        let limit = self.free_dir_slot;
        if self.fat().find_by_name(limit, name)?.is_some() {
            return Err(RafsError::FileExists);
        }
        if self.files.writer_open {
            return Err(RafsError::MaxFilesOpened);
        }
        if self.free_dir_slot >= MAX_DIR_ENTRIES {
            return Err(RafsError::FileSystemFull);
        }
        let index = self.files.free_slot().ok_or(RafsError::MaxFilesOpened)?;
        let first = self.map.longest_free_run().ok_or(RafsError::FileSystemFull)?;

        let dir_slot = self.free_dir_slot;
        self.free_dir_slot += 1;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        let entry = DirEntry::new_file(name, first, self.sequence_number);

        self.files.slots[index] = Some(OpenFile::new(entry, dir_slot, OpenMode::Write, responder));
        self.files.writer_open = true;
        Ok(FileId(index))
    }

    /// Persist a write handle's entry and release the handle.
    pub(crate) fn close(&mut self, id: FileId) -> Result<()> {
        let file = self.files.remove(id)?;
        if file.mode == OpenMode::Read {
            return Ok(());
        }
        self.files.writer_open = false;

        let bs = self.info.block_size;
        let mut entry = file.entry;
        let last = &mut entry.extents[file.current_extent];
        last.length = file.extent_position.div_ceil(bs) as u16;
        if let Err(e) = self.map.add_extents(&[*last]) {
            error!("Finalising {} failed: {}", entry.filename(), e);
        }
        entry.file_size = file.position;

        self.fat().write_entry_both(file.dir_slot, &entry).map_err(|e| {
            error!("Persisting {} failed: {}", entry.filename(), e);
            RafsError::FatWriteFailed
        })
    }

    pub(crate) fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize> {
        let bs = self.info.block_size;
        let Volume { files, partition, .. } = self;
        let file = files.get_mut(id)?;

        let mut done = 0usize;
        while done < buf.len() && file.position < file.entry.file_size {
            let extent_free = file.extent_bytes(bs).saturating_sub(file.extent_position);
            if extent_free == 0 {
                let next = file.current_extent + 1;
                if next < MAX_EXTENTS && file.entry.extents[next].is_valid() {
                    file.current_extent = next;
                    file.extent_position = 0;
                    continue;
                }
                break;
            }

            let file_left = file.entry.file_size - file.position;
            let chunk = (buf.len() - done).min(file_left as usize).min(extent_free as usize);
            partition.read(file.current_offset(bs), &mut buf[done..done + chunk])?;
            done += chunk;
            file.position += chunk as u32;
            file.extent_position += chunk as u32;
        }

        if done == 0 {
            return Err(RafsError::NoMoreData);
        }
        Ok(done)
    }

    /// Write as much of `data` as fits. The count is valid even when the
    /// result is an error.
    pub(crate) fn write_some(&mut self, id: FileId, data: &[u8]) -> (usize, Result<()>) {
        let bs = self.info.block_size;
        let Volume { files, partition, map, .. } = self;
        let file = match files.get_mut(id) {
            Ok(file) if file.mode == OpenMode::Write => file,
            Ok(_) => return (0, Err(RafsError::BadId)),
            Err(e) => return (0, Err(e)),
        };

        let mut done = 0usize;
        while done < data.len() {
            let extent_free = file.extent_bytes(bs).saturating_sub(file.extent_position);
            let chunk = (data.len() - done).min(extent_free as usize);
            if chunk > 0 {
                if let Err(e) = partition.write(file.current_offset(bs), &data[done..done + chunk]) {
                    return (done, Err(e.into()));
                }
                done += chunk;
                file.position += chunk as u32;
                file.extent_position += chunk as u32;
            }
            if done == data.len() {
                break;
            }

            // Current extent is full: claim it and move on to a new run.
            let full: Extent = file.entry.extents[file.current_extent];
            if let Err(e) = map.add_extents(&[full]) {
                error!("Claiming extent {:?} failed: {}", full, e);
                return (done, Err(RafsError::FileSystemFull));
            }
            let next = file.current_extent + 1;
            let failure = match map.longest_free_run() {
                _ if next >= MAX_EXTENTS => Some(RafsError::FileFull),
                None => Some(RafsError::FileSystemFull),
                Some(run) => {
                    file.current_extent = next;
                    file.entry.extents[next] = run;
                    file.extent_position = 0;
                    None
                }
            };
            if let Some(err) = failure {
                if let Err(e) = map.remove_extents(&[full]) {
                    error!("Releasing extent {:?} failed: {}", full, e);
                }
                return (done, Err(err));
            }
        }
        (done, Ok(()))
    }

    pub(crate) fn write(&mut self, id: FileId, data: &[u8]) -> Result<usize> {
        let (written, result) = self.write_some(id, data);
        result.map(|()| written)
    }

    pub(crate) fn seek(&mut self, id: FileId, position: u32) -> Result<()> {
        let bs = self.info.block_size;
        let file = self.files.get_mut(id)?;
        if file.mode == OpenMode::Write {
            return Err(RafsError::NotSeekable);
        }
        if position >= file.entry.file_size {
            return Err(RafsError::InvalidSeek);
        }

        let mut left = position;
        for (i, extent) in file.entry.extents.iter().enumerate() {
            if !extent.is_valid() {
                break;
            }
            let bytes = u32::from(extent.length) * bs;
            if left < bytes {
                file.current_extent = i;
                file.extent_position = left;
                file.position = position;
                return Ok(());
            }
            left -= bytes;
        }
        Err(RafsError::InvalidSeek)
    }

    pub(crate) fn position(&self, id: FileId) -> Result<u32> {
        Ok(self.files.get(id)?.position)
    }
}
