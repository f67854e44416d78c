//! Mount-time consistency check of the two metadata copies.

use tracing::{info, warn};

use crate::compact::{repair_from_primary, repair_from_secondary};
use crate::dirent::{EntryStatus, DELETED_MARKER, MAX_DIR_ENTRIES};
use crate::fat::{FatCopy, FatMarker, FatTable, FIRST_FILE_SLOT, ROOT_SLOT};
use crate::partition::Partition;
use crate::{RafsError, Result};

const REPAIR_PASSES: usize = 2;

pub(crate) fn check_and_repair<P: Partition + ?Sized>(fat: &mut FatTable<'_, P>) -> Result<()> {
    check_fat_pair(fat)?;
    check_entries(fat)
}

/// Resolve an interrupted compaction from the two root markers.
fn check_fat_pair<P: Partition + ?Sized>(fat: &mut FatTable<'_, P>) -> Result<()> {
    if fat.read_entry(FatCopy::Primary, ROOT_SLOT)? == FatCopy::Primary.root_entry()
        && fat.read_entry(FatCopy::Secondary, ROOT_SLOT)? == FatCopy::Secondary.root_entry()
    {
        return Ok(());
    }

    for _ in 0..REPAIR_PASSES {
        let primary = FatMarker::from_byte(fat.read_marker(FatCopy::Primary, ROOT_SLOT)?);
        let secondary = FatMarker::from_byte(fat.read_marker(FatCopy::Secondary, ROOT_SLOT)?);

        match (primary, secondary) {
            (Some(FatMarker::Valid), Some(FatMarker::Valid)) => return Ok(()),
            (Some(FatMarker::Erased), Some(FatMarker::Erased)) => {
                warn!("Metadata tables are unformatted");
                return Err(RafsError::InvalidFat);
            }
            (
                Some(FatMarker::CompactStart),
                Some(FatMarker::Valid) | Some(FatMarker::Erased),
            ) => {
                warn!("Interrupted compaction, repairing from primary table");
                repair_from_primary(fat)?;
            }
            (_, Some(FatMarker::SecondaryMaster)) => {
                warn!("Interrupted compaction, repairing from secondary table");
                repair_from_secondary(fat)?;
            }
            (Some(FatMarker::Erased), Some(FatMarker::Valid)) => {
                warn!("Primary table left unmarked, committing");
                fat.write_marker(FatCopy::Primary, ROOT_SLOT, FatMarker::Valid as u8)?;
            }
            (primary, secondary) => {
                warn!("Unrecognised table markers {:?}/{:?}", primary, secondary);
                return Err(RafsError::InvalidFat);
            }
        }
    }

    Err(RafsError::InvalidFat)
}

/// Finish interrupted closes and removes slot by slot.
fn check_entries<P: Partition + ?Sized>(fat: &mut FatTable<'_, P>) -> Result<()> {
    for slot in FIRST_FILE_SLOT..MAX_DIR_ENTRIES {
        let primary = EntryStatus::from_marker(fat.read_marker(FatCopy::Primary, slot)?);
        let secondary = EntryStatus::from_marker(fat.read_marker(FatCopy::Secondary, slot)?);
        let (Some(primary), Some(secondary)) = (primary, secondary) else {
            warn!("Unrecognised entry marker in slot {}", slot);
            return Err(RafsError::InvalidFat);
        };

        match (primary, secondary) {
            (EntryStatus::Unused, EntryStatus::Unused) => {
                // A torn close leaves data behind an erased status byte.
                if fat.read_entry(FatCopy::Primary, slot)?.is_erased() {
                    break;
                }
            }
            (EntryStatus::Unused, _) | (EntryStatus::Live, EntryStatus::Deleted) => {
                warn!("Slot {} is {:?} in primary but {:?} in secondary", slot, primary, secondary);
                return Err(RafsError::InvalidFat);
            }
            (EntryStatus::Live, EntryStatus::Unused) => {
                info!("Completing interrupted close in slot {}", slot);
                let entry = fat.read_entry(FatCopy::Primary, slot)?;
                fat.write_entry(FatCopy::Secondary, slot, &entry)?;
            }
            (EntryStatus::Deleted, EntryStatus::Live | EntryStatus::Unused) => {
                info!("Completing interrupted remove in slot {}", slot);
                fat.write_marker(FatCopy::Secondary, slot, DELETED_MARKER)?;
            }
            (EntryStatus::Live, EntryStatus::Live) | (EntryStatus::Deleted, EntryStatus::Deleted) => {}
        }
    }
    Ok(())
}
