use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::alloc::SectorMap;
use crate::directory::DirCursor;
use crate::dirent::{
    EntryStatus, Extent, Filename, DELETED_MARKER, DIRECTORY_SIZE, MAX_DIR_ENTRIES, MAX_EXTENTS,
};
use crate::fat::{FatCopy, FatTable, FIRST_FILE_SLOT};
use crate::file::FileTable;
use crate::integrity;
use crate::partition::{Partition, PartitionInfo};
use crate::{RafsError, Result};

const CLEAN_CHECK_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statfs {
    pub sector_size: u32,
    pub partition_size: u32,
    pub block_size: u32,
    pub available_space: u32,
    pub free_space: u32,
    pub contiguous_space: u32,
    /// Largest file that can be created with the three extent slots.
    pub file_space: u32,
    pub max_dir_entries: u32,
    pub num_dir_entries: u32,
}

/// A mounted partition.
pub(crate) struct Volume<P> {
    pub(crate) partition: P,
    pub(crate) name: String,
    pub(crate) info: PartitionInfo,
    pub(crate) map: SectorMap,
    pub(crate) files: FileTable,
    pub(crate) directory: Option<DirCursor>,
    pub(crate) next_dir_id: u32,
    /// First never-used directory slot.
    pub(crate) free_dir_slot: usize,
    pub(crate) sequence_number: u16,
    pub(crate) compact_needed: bool,
}

fn check_geometry(info: &PartitionInfo) -> Result<()> {
    let blocks = info.num_blocks();
    if (info.block_size as usize) < DIRECTORY_SIZE || blocks < 3 || blocks > u32::from(u16::MAX) {
        warn!("Unsupported partition geometry {:?}", info);
        return Err(RafsError::InvalidPartition);
    }
    Ok(())
}

/// Erase both metadata blocks and write fresh root records.
pub(crate) fn format<P: Partition>(partition: &mut P) -> Result<()> {
    check_geometry(&partition.info())?;
    let mut fat = FatTable::new(partition);
    for copy in [FatCopy::Primary, FatCopy::Secondary] {
        fat.erase(copy)
            .and_then(|_| fat.write_root(copy))
            .map_err(|e| {
                error!("Format failed on {:?} table: {}", copy, e);
                RafsError::InvalidFat
            })?;
    }
    Ok(())
}

impl<P: Partition> Volume<P> {
    /// Check and repair the tables, then rebuild the in-memory state.
    pub(crate) fn mount(mut partition: P, name: &str, max_open_files: usize) -> Result<Self> {
        let info = partition.info();
        check_geometry(&info)?;

        integrity::check_and_repair(&mut FatTable::new(&mut partition)).map_err(|e| {
            error!("Integrity check of {} failed: {}", name, e);
            RafsError::InvalidFat
        })?;

        let mut volume = Self {
            partition,
            name: name.to_string(),
            info,
            map: SectorMap::new(info.num_blocks()),
            files: FileTable::new(max_open_files),
            directory: None,
            next_dir_id: 0,
            free_dir_slot: MAX_DIR_ENTRIES,
            sequence_number: 0,
            compact_needed: false,
        };
        volume.scan_directory()?;
        info!(
            "Mounted {}: {} blocks, {} free, next slot {}",
            name,
            info.num_blocks(),
            volume.map.count_free(),
            volume.free_dir_slot
        );
        Ok(volume)
    }

    pub(crate) fn fat(&mut self) -> FatTable<'_, P> {
        FatTable::new(&mut self.partition)
    }

    /// Replay every live entry into the sector map.
    fn scan_directory(&mut self) -> Result<()> {
        self.map
            .add_extents(&[FatCopy::Primary.root_extent(), FatCopy::Secondary.root_extent()])
            .map_err(|_| RafsError::InvalidPartition)?;

        let mut fat = FatTable::new(&mut self.partition);
        for slot in FIRST_FILE_SLOT..MAX_DIR_ENTRIES {
            let entry = fat.read_entry(FatCopy::Primary, slot)?;
            match entry.status() {
                EntryStatus::Unused if entry.is_erased() => {
                    self.free_dir_slot = slot;
                    break;
                }
                EntryStatus::Unused => {
                    warn!("Slot {} holds an unfinished entry, skipping", slot);
                    self.compact_needed = true;
                }
                EntryStatus::Deleted => self.compact_needed = true,
                EntryStatus::Live => {
                    self.map.add_extents(&entry.extents).map_err(|e| {
                        error!("Entry {} in slot {} overlaps: {}", entry.filename(), slot, e);
                        RafsError::InvalidFat
                    })?;
                    self.sequence_number = self.sequence_number.max(entry.counters.sequence_count);
                }
            }
        }
        Ok(())
    }

    /// Mark `name` deleted in both tables and release its blocks. Returns
    /// the extents still to be erased.
    pub(crate) fn remove(&mut self, name: &Filename) -> Result<Vec<Extent>> {
        let limit = self.free_dir_slot;
        let (slot, entry) = self.fat().find_by_name(limit, name)?.ok_or(RafsError::FileNotFound)?;
        self.compact_needed = true;

        let mut fat = self.fat();
        fat.write_marker(FatCopy::Primary, slot, DELETED_MARKER)
            .and_then(|_| fat.write_marker(FatCopy::Secondary, slot, DELETED_MARKER))
            .map_err(|e| {
                error!("Marking {} deleted failed: {}", name, e);
                RafsError::InvalidFat
            })?;

        if let Err(e) = self.map.remove_extents(&entry.extents) {
            error!("Releasing blocks of {} failed: {}", name, e);
        }
        Ok(entry.extents.iter().take_while(|e| !e.is_unused()).copied().collect())
    }

    pub(crate) fn count_live(&mut self) -> Result<usize> {
        let limit = self.free_dir_slot;
        self.fat().count_live(limit)
    }

    fn block_is_clean(&mut self, block: u32) -> bool {
        let base = block * self.info.block_size;
        let mut chunk = [0u8; CLEAN_CHECK_CHUNK];
        let mut offset = 0;
        while offset < self.info.block_size {
            let len = CLEAN_CHECK_CHUNK.min((self.info.block_size - offset) as usize);
            if let Err(e) = self.partition.read(base + offset, &mut chunk[..len]) {
                warn!("Reading block {} failed: {}", block, e);
                return false;
            }
            if chunk[..len].iter().any(|b| *b != 0xFF) {
                return false;
            }
            offset += len as u32;
        }
        true
    }

    /// Background-erase the first free, dirty block at or after `from`.
    /// Returns the erased block, or `None` once the end is reached.
    pub(crate) fn clean_next_block(&mut self, from: u32) -> Option<u32> {
        for block in from..self.map.num_blocks() {
            if self.map.is_in_use(block) || self.block_is_clean(block) {
                continue;
            }
            debug!("Erasing dirty free block {}", block);
            if let Err(e) = self.partition.erase_background(block * self.info.block_size) {
                warn!("Background erase of block {} failed: {}", block, e);
            }
            return Some(block);
        }
        None
    }

    pub(crate) fn statfs(&mut self) -> Result<Statfs> {
        let bs = self.info.block_size;
        let runs = self.map.free_runs(MAX_EXTENTS);
        let file_blocks: u32 = runs.runs.iter().map(|r| u32::from(r.length)).sum();
        let contiguous = runs.runs.first().map_or(0, |r| u32::from(r.length));

        Ok(Statfs {
            sector_size: self.info.page_size,
            partition_size: self.info.partition_size,
            block_size: bs,
            available_space: self.info.partition_size - 2 * bs,
            free_space: self.map.count_free() * bs,
            contiguous_space: contiguous * bs,
            file_space: file_blocks * bs,
            max_dir_entries: (MAX_DIR_ENTRIES - 1) as u32,
            num_dir_entries: self.count_live()? as u32,
        })
    }
}
