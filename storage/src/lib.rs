mod alloc;
mod compact;
mod config;
mod directory;
mod dirent;
mod fat;
mod file;
mod filesystem;
mod integrity;
mod ioctl;
mod partition;
mod path;
mod power;
mod scheduler;
mod volume;

pub use alloc::{AllocError, FreeRuns, SectorMap};
pub use compact::CompactState;
pub use config::{Config, PowerPolicyConfig};
pub use directory::{DirId, DirStat};
pub use dirent::{
    DirEntry, EntryStatus, Extent, Filename, StatCounters, DIRECTORY_SIZE, DIRENT_SIZE,
    MAX_DIR_ENTRIES, MAX_EXTENTS, MAX_FILENAME_LEN,
};
pub use fat::{FatCopy, FatMarker};
pub use file::{FileId, OpenMode};
pub use filesystem::{FormatKind, IdleCallback, Rafs};
pub use ioctl::{IoArg, IoReply, IocType};
pub use partition::{
    Partition, PartitionError, PartitionInfo, PartitionManager, RamPartition,
    RamPartitionManager,
};
pub use path::MAX_PARTITION_NAME_LEN;
pub use power::{AlwaysSafe, BatteryLevel, ChargerEvent, MinimumBattery, PowerPolicy, PowerState};
pub use scheduler::{RafsMessage, Responder, WriteComplete};
pub use volume::Statfs;

pub type Result<T> = std::result::Result<T, RafsError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RafsError {
    #[error("Too many files open")]
    MaxFilesOpened,

    #[error("Bad file or directory identifier")]
    BadId,

    #[error("File not found")]
    FileNotFound,

    #[error("File system full")]
    FileSystemFull,

    #[error("File has no free extent slots")]
    FileFull,

    #[error("Write to the metadata table failed")]
    FatWriteFailed,

    #[error("File already exists")]
    FileExists,

    #[error("Invalid length")]
    InvalidLength,

    #[error("Invalid character in filename")]
    InvalidCharacter,

    #[error("Invalid path")]
    InvalidPath,

    #[error("File system busy")]
    Busy,

    #[error("Invalid metadata table")]
    InvalidFat,

    #[error("Invalid partition")]
    InvalidPartition,

    #[error("No such partition")]
    NoPartition,

    #[error("Partition not mounted")]
    NotMounted,

    #[error("Partition already mounted")]
    AlreadyMounted,

    #[error("Partition still mounted")]
    StillMounted,

    #[error("File still open")]
    FileStillOpen,

    #[error("Directory open")]
    DirectoryOpen,

    #[error("No more files")]
    NoMoreFiles,

    #[error("No more data")]
    NoMoreData,

    #[error("Invalid seek position")]
    InvalidSeek,

    #[error("File not seekable")]
    NotSeekable,

    #[error("Unsupported I/O control code: {0}")]
    UnsupportedIoControl(u32),

    #[error("Power too low for write operations")]
    LowPower,

    #[error("File system already clean")]
    FileSystemClean,

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),
}
