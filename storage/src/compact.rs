//! Metadata table compaction.
//!
//! Each state performs at most one flash-touching action. The sequence is
//! ordered so that the root markers always tell the integrity checker
//! which copy is authoritative after a power cut:
//!
//! * primary `0x70`: primary still holds the full table.
//! * secondary `0xFE`: secondary holds the compacted table.
//! * primary `0x7E`: compaction committed.

use tracing::debug;

use crate::dirent::{DirEntry, EntryStatus, MAX_DIR_ENTRIES};
use crate::fat::{EntryPart, FatCopy, FatMarker, FatTable, FIRST_FILE_SLOT, ROOT_SLOT};
use crate::partition::Partition;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactState {
    Start,
    EraseSecondary,
    CopyToSecondary,
    SecondaryMaster,
    ErasePrimary,
    CopyToPrimary,
    WriteHeaderData,
    MarkValid,
    Complete,
}

impl CompactState {
    pub fn next(self) -> Self {
        match self {
            CompactState::Start => CompactState::EraseSecondary,
            CompactState::EraseSecondary => CompactState::CopyToSecondary,
            CompactState::CopyToSecondary => CompactState::SecondaryMaster,
            CompactState::SecondaryMaster => CompactState::ErasePrimary,
            CompactState::ErasePrimary => CompactState::CopyToPrimary,
            CompactState::CopyToPrimary => CompactState::WriteHeaderData,
            CompactState::WriteHeaderData => CompactState::MarkValid,
            CompactState::MarkValid | CompactState::Complete => CompactState::Complete,
        }
    }
}

/// Table shape after the live entries were packed into the secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Packed {
    pub files: u16,
    pub free_dir_slot: usize,
}

/// Run the action of `state`. Only the copy into the secondary reports
/// the new table shape.
pub(crate) fn run_step<P: Partition + ?Sized>(
    fat: &mut FatTable<'_, P>,
    state: CompactState,
    limit: usize,
) -> Result<Option<Packed>> {
    debug!("Compaction step {:?}", state);
    match state {
        CompactState::Start => {
            fat.write_marker(FatCopy::Primary, ROOT_SLOT, FatMarker::CompactStart as u8)?
        }
        CompactState::EraseSecondary => fat.erase(FatCopy::Secondary)?,
        CompactState::CopyToSecondary => return pack_into_secondary(fat, limit).map(Some),
        CompactState::SecondaryMaster => {
            fat.write_marker(FatCopy::Secondary, ROOT_SLOT, FatMarker::SecondaryMaster as u8)?
        }
        CompactState::ErasePrimary => fat.erase(FatCopy::Primary)?,
        CompactState::CopyToPrimary => copy_to_primary(fat)?,
        CompactState::WriteHeaderData => {
            for copy in [FatCopy::Primary, FatCopy::Secondary] {
                fat.write_part(copy, ROOT_SLOT, &copy.root_entry(), EntryPart::Data)?;
            }
        }
        CompactState::MarkValid => {
            for copy in [FatCopy::Secondary, FatCopy::Primary] {
                fat.write_part(copy, ROOT_SLOT, &copy.root_entry(), EntryPart::First)?;
            }
        }
        CompactState::Complete => {}
    }
    Ok(None)
}

/// Copy live primary entries below `limit` into consecutive secondary
/// slots, renumbering sequence counts densely from 1 in creation order.
fn pack_into_secondary<P: Partition + ?Sized>(
    fat: &mut FatTable<'_, P>,
    limit: usize,
) -> Result<Packed> {
    let mut live: Vec<DirEntry> = Vec::new();
    for slot in FIRST_FILE_SLOT..limit.min(MAX_DIR_ENTRIES) {
        let entry = fat.read_entry(FatCopy::Primary, slot)?;
        if entry.is_erased() {
            break;
        }
        if entry.status() == EntryStatus::Live {
            live.push(entry);
        }
    }

    let mut order: Vec<usize> = (0..live.len()).collect();
    order.sort_by_key(|i| live[*i].counters.sequence_count);
    for (rank, i) in order.into_iter().enumerate() {
        live[i].counters.sequence_count = rank as u16 + 1;
    }

    let mut slot = FIRST_FILE_SLOT;
    for entry in &live {
        fat.write_entry(FatCopy::Secondary, slot, entry)?;
        slot += 1;
    }

    Ok(Packed {
        files: live.len() as u16,
        free_dir_slot: slot,
    })
}

fn copy_to_primary<P: Partition + ?Sized>(fat: &mut FatTable<'_, P>) -> Result<()> {
    for slot in FIRST_FILE_SLOT..MAX_DIR_ENTRIES {
        let entry = fat.read_entry(FatCopy::Secondary, slot)?;
        if entry.is_erased() {
            break;
        }
        fat.write_entry(FatCopy::Primary, slot, &entry)?;
    }
    Ok(())
}

fn run_from<P: Partition + ?Sized>(
    fat: &mut FatTable<'_, P>,
    mut state: CompactState,
) -> Result<()> {
    while state != CompactState::Complete {
        run_step(fat, state, MAX_DIR_ENTRIES)?;
        state = state.next();
    }
    Ok(())
}

/// The primary is authoritative: rebuild the secondary from it, then the
/// primary from the secondary.
pub(crate) fn repair_from_primary<P: Partition + ?Sized>(fat: &mut FatTable<'_, P>) -> Result<()> {
    run_from(fat, CompactState::EraseSecondary)
}

/// The secondary is authoritative.
pub(crate) fn repair_from_secondary<P: Partition + ?Sized>(fat: &mut FatTable<'_, P>) -> Result<()> {
    run_from(fat, CompactState::ErasePrimary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirent::{Extent, Filename};
    use crate::partition::RamPartition;

    fn formatted() -> RamPartition {
        let mut part = RamPartition::new(4096, 16);
        let mut fat = FatTable::new(&mut part);
        fat.write_root(FatCopy::Primary).unwrap();
        fat.write_root(FatCopy::Secondary).unwrap();
        part
    }

    fn file(name: &str, block: u16, seq: u16) -> DirEntry {
        DirEntry::new_file(&Filename::new(name).unwrap(), Extent::new(block, 1), seq)
    }

    #[test]
    fn state_order() {
        let mut state = CompactState::Start;
        let mut seen = vec![state];
        while state != CompactState::Complete {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(seen[3], CompactState::SecondaryMaster);
    }

    #[test]
    fn full_pass_drops_deleted_and_renumbers() {
        let mut part = formatted();
        let mut fat = FatTable::new(&mut part);
        fat.write_entry_both(1, &file("A", 2, 4)).unwrap();
        fat.write_entry_both(2, &file("B", 3, 5)).unwrap();
        fat.write_entry_both(3, &file("C", 4, 9)).unwrap();
        for copy in [FatCopy::Primary, FatCopy::Secondary] {
            fat.write_marker(copy, 2, 0).unwrap();
        }

        let mut state = CompactState::Start;
        let mut packed = None;
        while state != CompactState::Complete {
            if let Some(p) = run_step(&mut fat, state, 4).unwrap() {
                packed = Some(p);
            }
            state = state.next();
        }
        assert_eq!(packed, Some(Packed { files: 2, free_dir_slot: 3 }));

        for copy in [FatCopy::Primary, FatCopy::Secondary] {
            assert_eq!(fat.read_entry(copy, ROOT_SLOT).unwrap(), copy.root_entry());
            let a = fat.read_entry(copy, 1).unwrap();
            let c = fat.read_entry(copy, 2).unwrap();
            assert_eq!((a.filename().as_str(), a.counters.sequence_count), ("A", 1));
            assert_eq!((c.filename().as_str(), c.counters.sequence_count), ("C", 2));
            assert!(fat.read_entry(copy, 3).unwrap().is_erased());
        }
    }

    #[test]
    fn renumbering_follows_sequence_not_slot() {
        let mut part = formatted();
        let mut fat = FatTable::new(&mut part);
        fat.write_entry(FatCopy::Primary, 1, &file("late", 2, 30)).unwrap();
        fat.write_entry(FatCopy::Primary, 2, &file("early", 3, 10)).unwrap();

        let packed = pack_into_secondary(&mut fat, 3).unwrap();
        assert_eq!(packed.files, 2);
        let late = fat.read_entry(FatCopy::Secondary, 1).unwrap();
        let early = fat.read_entry(FatCopy::Secondary, 2).unwrap();
        assert_eq!(late.counters.sequence_count, 2);
        assert_eq!(early.counters.sequence_count, 1);
    }
}
