//! Redundant metadata table ("FAT") access.
//!
//! Two byte-identical copies of the directory table live in blocks 0 and 1.
//! Slot 0 of each is a root record whose first byte doubles as the
//! compaction progress marker.

use crate::dirent::{DirEntry, Extent, Filename, DIRENT_SIZE, MAX_EXTENTS, MAX_FILENAME_LEN};
use crate::partition::Partition;
use crate::Result;

pub(crate) const ROOT_SLOT: usize = 0;
pub(crate) const FIRST_FILE_SLOT: usize = 1;
const ROOT_NAME: &[u8; MAX_FILENAME_LEN] = b"~QTIL-RAFS-V001\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatCopy {
    Primary,
    Secondary,
}

impl FatCopy {
    pub fn block(self) -> u16 {
        match self {
            FatCopy::Primary => 0,
            FatCopy::Secondary => 1,
        }
    }

    pub(crate) fn root_extent(self) -> Extent {
        Extent::new(self.block(), 1)
    }

    /// The root record a freshly formatted copy carries.
    pub fn root_entry(self) -> DirEntry {
        let mut extents = [Extent::UNUSED; MAX_EXTENTS];
        extents[0] = self.root_extent();
        DirEntry {
            name: *ROOT_NAME,
            file_size: crate::dirent::DIRECTORY_SIZE as u32,
            counters: Default::default(),
            extents,
        }
    }
}

/// First byte of a root record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FatMarker {
    CompactStart = 0x70,
    Valid = 0x7E,
    SecondaryMaster = 0xFE,
    Erased = 0xFF,
}

impl FatMarker {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x70 => Some(FatMarker::CompactStart),
            0x7E => Some(FatMarker::Valid),
            0xFE => Some(FatMarker::SecondaryMaster),
            0xFF => Some(FatMarker::Erased),
            _ => None,
        }
    }
}

/// Byte range of an entry touched by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryPart {
    Whole,
    /// The status byte alone.
    First,
    /// Everything except the status byte.
    Data,
}

pub(crate) struct FatTable<'p, P: Partition + ?Sized> {
    part: &'p mut P,
    block_size: u32,
}

impl<'p, P: Partition + ?Sized> FatTable<'p, P> {
    pub(crate) fn new(part: &'p mut P) -> Self {
        let block_size = part.info().block_size;
        Self { part, block_size }
    }

    fn offset(&self, copy: FatCopy, slot: usize) -> u32 {
        u32::from(copy.block()) * self.block_size + (slot * DIRENT_SIZE) as u32
    }

    pub(crate) fn read_entry(&mut self, copy: FatCopy, slot: usize) -> Result<DirEntry> {
        let mut raw = [0u8; DIRENT_SIZE];
        self.part.read(self.offset(copy, slot), &mut raw)?;
        Ok(DirEntry::decode(&raw))
    }

    pub(crate) fn read_marker(&mut self, copy: FatCopy, slot: usize) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.part.read(self.offset(copy, slot), &mut byte)?;
        Ok(byte[0])
    }

    pub(crate) fn write_part(
        &mut self,
        copy: FatCopy,
        slot: usize,
        entry: &DirEntry,
        part: EntryPart,
    ) -> Result<()> {
        let raw = entry.encode();
        let at = self.offset(copy, slot);
        match part {
            EntryPart::Whole => self.part.write(at, &raw)?,
            EntryPart::First => self.part.write(at, &raw[..1])?,
            EntryPart::Data => self.part.write(at + 1, &raw[1..])?,
        }
        Ok(())
    }

    /// Two-phase write: a power cut leaves the slot either untouched or
    /// complete, as seen through its status byte.
    pub(crate) fn write_entry(&mut self, copy: FatCopy, slot: usize, entry: &DirEntry) -> Result<()> {
        self.write_part(copy, slot, entry, EntryPart::Data)?;
        self.write_part(copy, slot, entry, EntryPart::First)
    }

    /// Write both copies, primary first.
    pub(crate) fn write_entry_both(&mut self, slot: usize, entry: &DirEntry) -> Result<()> {
        self.write_entry(FatCopy::Primary, slot, entry)?;
        self.write_entry(FatCopy::Secondary, slot, entry)
    }

    pub(crate) fn write_member(
        &mut self,
        copy: FatCopy,
        slot: usize,
        member_offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        self.part.write(self.offset(copy, slot) + member_offset as u32, bytes)?;
        Ok(())
    }

    pub(crate) fn write_marker(&mut self, copy: FatCopy, slot: usize, marker: u8) -> Result<()> {
        self.write_member(copy, slot, 0, &[marker])
    }

    pub(crate) fn erase(&mut self, copy: FatCopy) -> Result<()> {
        self.part.erase(u32::from(copy.block()) * self.block_size)?;
        Ok(())
    }

    pub(crate) fn write_root(&mut self, copy: FatCopy) -> Result<()> {
        self.write_entry(copy, ROOT_SLOT, &copy.root_entry())
    }

    /// Find a live entry by name among primary slots below `limit`.
    pub(crate) fn find_by_name(
        &mut self,
        limit: usize,
        name: &Filename,
    ) -> Result<Option<(usize, DirEntry)>> {
        for slot in FIRST_FILE_SLOT..limit {
            let entry = self.read_entry(FatCopy::Primary, slot)?;
            if entry.is_live() && entry.has_name(name) {
                return Ok(Some((slot, entry)));
            }
        }
        Ok(None)
    }

    /// Number of live entries among primary slots below `limit`.
    pub(crate) fn count_live(&mut self, limit: usize) -> Result<usize> {
        let mut count = 0;
        for slot in FIRST_FILE_SLOT..limit {
            if self.read_entry(FatCopy::Primary, slot)?.is_live() {
                count += 1;
            }
        }
        Ok(count)
    }
}
