//! On-media directory entry layout.
//!
//! Every entry is 36 bytes, little endian, with no padding:
//!
//! | offset | size | field                     |
//! |--------|------|---------------------------|
//! | 0      | 16   | filename, NUL padded      |
//! | 16     | 4    | file size in bytes        |
//! | 20     | 2    | sequence count            |
//! | 22     | 2    | access count              |
//! | 24     | 12   | three extents (offset, length) |

use std::fmt;
use std::ops::Range;

use crate::{RafsError, Result};

pub const MAX_FILENAME_LEN: usize = 16;
pub const MAX_EXTENTS: usize = 3;
pub const DIRENT_SIZE: usize = 36;
pub const DIRECTORY_SIZE: usize = 4096;
pub const MAX_DIR_ENTRIES: usize = DIRECTORY_SIZE / DIRENT_SIZE;

pub(crate) const FILENAME_OFFSET: usize = 0;
pub(crate) const FILE_SIZE_OFFSET: usize = 16;
pub(crate) const SEQUENCE_OFFSET: usize = 20;
pub(crate) const ACCESS_OFFSET: usize = 22;
pub(crate) const EXTENTS_OFFSET: usize = 24;
const EXTENT_SIZE: usize = 4;

const _: () = assert!(FILE_SIZE_OFFSET == FILENAME_OFFSET + MAX_FILENAME_LEN);
const _: () = assert!(SEQUENCE_OFFSET == FILE_SIZE_OFFSET + 4);
const _: () = assert!(ACCESS_OFFSET == SEQUENCE_OFFSET + 2);
const _: () = assert!(EXTENTS_OFFSET == ACCESS_OFFSET + 2);
const _: () = assert!(EXTENTS_OFFSET + MAX_EXTENTS * EXTENT_SIZE == DIRENT_SIZE);
const _: () = assert!(MAX_DIR_ENTRIES == 113);

pub(crate) const ERASED_MARKER: u8 = 0xFF;
pub(crate) const DELETED_MARKER: u8 = 0x00;

/// Access count of a file that has never been opened for reading.
pub(crate) const INITIAL_ACCESS: u16 = 0xFFFF;

/// A contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub offset: u16,
    pub length: u16,
}

impl Extent {
    pub const UNUSED: Extent = Extent { offset: 0xFFFF, length: 0xFFFF };
    pub const DELETED: Extent = Extent { offset: 0, length: 0 };

    pub fn new(offset: u16, length: u16) -> Self {
        Self { offset, length }
    }

    pub fn is_unused(&self) -> bool {
        *self == Self::UNUSED || self.length == 0
    }

    pub fn is_deleted(&self) -> bool {
        *self == Self::DELETED
    }

    pub fn is_valid(&self) -> bool {
        !self.is_unused() && !self.is_deleted()
    }

    pub fn blocks(&self) -> Range<u32> {
        let start = u32::from(self.offset);
        start..start + u32::from(self.length)
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        let (a, b) = (self.blocks(), other.blocks());
        a.start < b.end && b.start < a.end
    }
}

/// A validated file name: 1 to 15 characters from `[A-Za-z0-9_.]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Filename {
    bytes: [u8; MAX_FILENAME_LEN],
    len: u8,
}

impl Filename {
    pub fn new(name: &str) -> Result<Self> {
        let raw = name.as_bytes();
        if raw.is_empty() || raw.len() >= MAX_FILENAME_LEN {
            return Err(RafsError::InvalidLength);
        }
        if !raw.iter().copied().all(Self::is_valid_char) {
            return Err(RafsError::InvalidCharacter);
        }

        let mut bytes = [0u8; MAX_FILENAME_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self { bytes, len: raw.len() as u8 })
    }

    pub fn is_valid_char(c: u8) -> bool {
        c.is_ascii_alphanumeric() || c == b'_' || c == b'.'
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub(crate) fn field(&self) -> [u8; MAX_FILENAME_LEN] {
        self.bytes
    }
}

impl fmt::Display for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filename({:?})", self.as_str())
    }
}

/// Slot state encoded in the first filename byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Unused,
    Live,
    Deleted,
}

impl EntryStatus {
    /// Strict classification used by the integrity checker; `None` for a
    /// byte that is neither a sentinel nor a legal filename character.
    pub fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            ERASED_MARKER => Some(EntryStatus::Unused),
            DELETED_MARKER => Some(EntryStatus::Deleted),
            b if Filename::is_valid_char(b) => Some(EntryStatus::Live),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatCounters {
    pub sequence_count: u16,
    pub access_count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; MAX_FILENAME_LEN],
    pub file_size: u32,
    pub counters: StatCounters,
    pub extents: [Extent; MAX_EXTENTS],
}

impl DirEntry {
    /// An entry as it reads back from erased flash.
    pub fn erased() -> Self {
        Self::decode(&[ERASED_MARKER; DIRENT_SIZE])
    }

    /// A freshly created file that owns `first` and nothing else yet.
    pub fn new_file(name: &Filename, first: Extent, sequence_count: u16) -> Self {
        Self {
            name: name.field(),
            file_size: 0,
            counters: StatCounters {
                sequence_count,
                access_count: INITIAL_ACCESS,
            },
            extents: [first, Extent::UNUSED, Extent::UNUSED],
        }
    }

    /// Loose classification used on the normal read paths: anything that is
    /// not a sentinel counts as live.
    pub fn status(&self) -> EntryStatus {
        match self.name[0] {
            ERASED_MARKER => EntryStatus::Unused,
            DELETED_MARKER => EntryStatus::Deleted,
            _ => EntryStatus::Live,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status() == EntryStatus::Live
    }

    /// True when every byte of the record is erased.
    pub fn is_erased(&self) -> bool {
        self.encode().iter().all(|b| *b == ERASED_MARKER)
    }

    pub fn name_bytes(&self) -> &[u8] {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(MAX_FILENAME_LEN);
        &self.name[..end]
    }

    pub fn filename(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    pub fn has_name(&self, name: &Filename) -> bool {
        self.name_bytes() == name.as_bytes()
    }

    /// Read count as shown to callers; grows from zero.
    pub fn access_count(&self) -> u16 {
        !self.counters.access_count
    }

    pub fn valid_extents(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter().filter(|e| e.is_valid())
    }

    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut raw = [0u8; DIRENT_SIZE];
        raw[FILENAME_OFFSET..FILE_SIZE_OFFSET].copy_from_slice(&self.name);
        raw[FILE_SIZE_OFFSET..SEQUENCE_OFFSET].copy_from_slice(&self.file_size.to_le_bytes());
        raw[SEQUENCE_OFFSET..ACCESS_OFFSET]
            .copy_from_slice(&self.counters.sequence_count.to_le_bytes());
        raw[ACCESS_OFFSET..EXTENTS_OFFSET]
            .copy_from_slice(&self.counters.access_count.to_le_bytes());
        for (i, extent) in self.extents.iter().enumerate() {
            let at = EXTENTS_OFFSET + i * EXTENT_SIZE;
            raw[at..at + 2].copy_from_slice(&extent.offset.to_le_bytes());
            raw[at + 2..at + 4].copy_from_slice(&extent.length.to_le_bytes());
        }
        raw
    }

    pub fn decode(raw: &[u8; DIRENT_SIZE]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);

        let mut name = [0u8; MAX_FILENAME_LEN];
        name.copy_from_slice(&raw[FILENAME_OFFSET..FILE_SIZE_OFFSET]);

        let mut extents = [Extent::UNUSED; MAX_EXTENTS];
        for (i, extent) in extents.iter_mut().enumerate() {
            let at = EXTENTS_OFFSET + i * EXTENT_SIZE;
            *extent = Extent::new(u16_at(at), u16_at(at + 2));
        }

        Self {
            name,
            file_size: u32::from_le_bytes([
                raw[FILE_SIZE_OFFSET],
                raw[FILE_SIZE_OFFSET + 1],
                raw[FILE_SIZE_OFFSET + 2],
                raw[FILE_SIZE_OFFSET + 3],
            ]),
            counters: StatCounters {
                sequence_count: u16_at(SEQUENCE_OFFSET),
                access_count: u16_at(ACCESS_OFFSET),
            },
            extents,
        }
    }
}
