use std::fmt;

use bytes::Bytes;
use tracing::{info, warn};

use crate::compact::CompactState;
use crate::config::Config;
use crate::directory::{DirId, DirStat};
use crate::fat::FIRST_FILE_SLOT;
use crate::file::{FileId, OpenMode};
use crate::partition::PartitionManager;
use crate::path;
use crate::power::{BatteryLevel, ChargerEvent, PowerPolicy, PowerState};
use crate::scheduler::{CompactOrigin, Responder, Scheduler, Work};
use crate::volume::{self, Statfs, Volume};
use crate::{RafsError, Result};

/// Host predicate asked by the idle timer before compacting.
pub type IdleCallback = Box<dyn FnMut() -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// Refuses to touch a mounted partition.
    Normal,
    /// Reformats the mounted partition in place and unmounts it.
    Forced,
}

/// A file system instance. At most one partition is mounted at a time.
pub struct Rafs<M: PartitionManager> {
    pub(crate) manager: M,
    pub(crate) config: Config,
    pub(crate) busy: bool,
    pub(crate) volume: Option<Volume<M::Partition>>,
    pub(crate) power: PowerState,
    pub(crate) policy: Box<dyn PowerPolicy>,
    pub(crate) idle_callback: Option<IdleCallback>,
    pub(crate) scheduler: Scheduler,
}

impl<M: PartitionManager> fmt::Debug for Rafs<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rafs")
            .field("mounted", &self.volume.as_ref().map(|v| v.name.as_str()))
            .field("busy", &self.busy)
            .field("power", &self.power)
            .field("pending_work", &self.scheduler.pending())
            .finish()
    }
}

impl<M: PartitionManager> Rafs<M> {
    pub fn init(manager: M, config: Config) -> Self {
        let policy = config.power_policy.build();
        Self {
            manager,
            config,
            busy: false,
            volume: None,
            power: PowerState::default(),
            policy,
            idle_callback: None,
            scheduler: Scheduler::default(),
        }
    }

    pub fn with_power_policy(mut self, policy: Box<dyn PowerPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Tear the instance down and hand back the partition manager.
    pub fn shutdown(self) -> std::result::Result<M, (Self, RafsError)> {
        if self.busy {
            return Err((self, RafsError::Busy));
        }
        if self.volume.is_some() {
            return Err((self, RafsError::StillMounted));
        }
        Ok(self.manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn mounted_partition(&self) -> Option<&str> {
        self.volume.as_ref().map(|v| v.name.as_str())
    }

    pub fn power_state(&self) -> PowerState {
        self.power
    }

    pub fn notify_charger(&mut self, event: ChargerEvent) {
        self.power.on_charger(event);
    }

    pub fn notify_battery(&mut self, level: BatteryLevel) {
        self.power.on_battery(level);
    }

    fn write_safe(&self) -> Result<()> {
        if self.policy.is_write_safe(&self.power) {
            Ok(())
        } else {
            warn!("Write refused, power state {:?}", self.power);
            Err(RafsError::LowPower)
        }
    }

    /// The mounted volume, if `path` names it and nothing is in flight.
    pub(crate) fn mounted(&mut self, path: &str) -> Result<&mut Volume<M::Partition>> {
        if self.busy {
            return Err(RafsError::Busy);
        }
        let name = path::partition_name(path)?;
        match self.volume.as_mut() {
            Some(volume) if volume.name == name => Ok(volume),
            _ => Err(RafsError::NotMounted),
        }
    }

    pub(crate) fn mounted_ref(&self, path: &str) -> Result<&Volume<M::Partition>> {
        if self.busy {
            return Err(RafsError::Busy);
        }
        let name = path::partition_name(path)?;
        match self.volume.as_ref() {
            Some(volume) if volume.name == name => Ok(volume),
            _ => Err(RafsError::NotMounted),
        }
    }

    /// The mounted volume for handle-based calls.
    pub(crate) fn ready_volume(&mut self) -> Result<&mut Volume<M::Partition>> {
        if self.busy {
            return Err(RafsError::Busy);
        }
        self.volume.as_mut().ok_or(RafsError::NotMounted)
    }

    /// Check `partition` is mounted without touching it.
    pub fn mount_status(&self, partition: &str) -> Result<()> {
        self.mounted_ref(partition).map(|_| ())
    }

    pub fn format(&mut self, partition: &str, kind: FormatKind) -> Result<()> {
        let name = path::partition_name(partition)?;
        info!("Formatting {} ({:?})", name, kind);

        match (kind, self.volume.take()) {
            (FormatKind::Forced, Some(mut mounted)) if mounted.name == name => {
                self.busy = false;
                self.scheduler.clear();
                warn!("Forced format of mounted {}, unmounting", name);
                volume::format(&mut mounted.partition)
            }
            (_, Some(mounted)) => {
                self.volume = Some(mounted);
                Err(RafsError::StillMounted)
            }
            (_, None) => {
                let mut partition = self.manager.open(name).map_err(|e| {
                    warn!("Cannot open partition {}: {}", name, e);
                    RafsError::NoPartition
                })?;
                volume::format(&mut partition)
            }
        }
    }

    /// Check and mount `partition`. Completion is reported with
    /// [`RafsMessage::MountComplete`](crate::RafsMessage) once the
    /// background cleaner has run.
    pub fn mount(&mut self, responder: Option<Responder>, partition: &str) -> Result<()> {
        if self.busy {
            return Err(RafsError::Busy);
        }
        if self.volume.is_some() {
            return Err(RafsError::AlreadyMounted);
        }
        let name = path::partition_name(partition)?;
        let part = self.manager.open(name).map_err(|e| {
            warn!("Cannot open partition {}: {}", name, e);
            RafsError::NoPartition
        })?;

        self.volume = Some(Volume::mount(part, name, self.config.max_open_files)?);
        self.busy = true;
        self.scheduler.push(Work::Mount { responder, next_block: 0 });
        Ok(())
    }

    pub fn unmount(&mut self, partition: &str) -> Result<()> {
        if self.busy {
            return Err(RafsError::Busy);
        }
        let name = path::partition_name(partition)?;
        let volume = self.volume.as_ref().ok_or(RafsError::NotMounted)?;
        if volume.files.open_count() > 0 {
            return Err(RafsError::FileStillOpen);
        }
        if volume.directory.is_some() {
            return Err(RafsError::DirectoryOpen);
        }
        if volume.name != name {
            return Err(RafsError::NotMounted);
        }
        self.volume = None;
        info!("Unmounted {}", name);
        Ok(())
    }

    pub fn statfs(&mut self, partition: &str) -> Result<Statfs> {
        self.mounted(partition)?.statfs()
    }

    /// Start compacting the metadata table. Fails with
    /// [`RafsError::FileSystemClean`] when there is nothing to reclaim.
    pub fn compact(&mut self, responder: Option<Responder>, partition: &str) -> Result<()> {
        self.begin_compaction(partition, CompactOrigin::Caller(responder))
    }

    pub(crate) fn begin_compaction(&mut self, partition: &str, origin: CompactOrigin) -> Result<()> {
        let safe = self.write_safe();
        let volume = self.mounted(partition)?;
        if volume.files.open_count() > 0 {
            return Err(RafsError::FileStillOpen);
        }
        if volume.directory.is_some() {
            return Err(RafsError::DirectoryOpen);
        }
        if !volume.compact_needed {
            return Err(RafsError::FileSystemClean);
        }
        safe?;

        volume.compact_needed = false;
        let state = if volume.free_dir_slot > FIRST_FILE_SLOT {
            CompactState::Start
        } else {
            CompactState::Complete
        };
        self.busy = true;
        self.scheduler.push(Work::Compact { origin, state, status: Ok(()) });
        info!("Compaction started");
        Ok(())
    }

    /// Delete a file. Its blocks are erased in the background.
    pub fn remove(&mut self, responder: Option<Responder>, path: &str) -> Result<()> {
        let safe = self.write_safe();
        let volume = self.mounted(path)?;
        let name = path::filename(path)?;
        if volume.files.find_by_name(&name).is_some() {
            return Err(RafsError::FileStillOpen);
        }
        safe?;

        let extents = volume.remove(&name)?;
        self.busy = true;
        self.scheduler.push(Work::Remove { responder, extents });
        info!("Removing {}", name);
        Ok(())
    }

    pub fn open(&mut self, responder: Option<Responder>, path: &str, mode: OpenMode) -> Result<FileId> {
        let safe = self.write_safe();
        let volume = self.mounted(path)?;
        let name = path::filename(path)?;
        match mode {
            OpenMode::Read => volume.open_read(&name, responder),
            OpenMode::Write => {
                safe?;
                volume.open_write(&name, responder)
            }
        }
    }

    pub fn close(&mut self, file: FileId) -> Result<()> {
        self.ready_volume()?.close(file)
    }

    pub fn read(&mut self, file: FileId, buf: &mut [u8]) -> Result<usize> {
        self.ready_volume()?.read(file, buf)
    }

    pub fn write(&mut self, file: FileId, data: &[u8]) -> Result<usize> {
        self.ready_volume()?.write(file, data)
    }

    /// Queue a write; the handle's responder receives
    /// [`RafsMessage::WriteComplete`](crate::RafsMessage) with `data` back.
    pub fn write_background(&mut self, file: FileId, data: Bytes) -> Result<()> {
        self.ready_volume()?.files.get(file)?;
        self.scheduler.push(Work::Write { file, data });
        Ok(())
    }

    pub fn set_position(&mut self, file: FileId, position: u32) -> Result<()> {
        self.ready_volume()?.seek(file, position)
    }

    pub fn position(&mut self, file: FileId) -> Result<u32> {
        self.ready_volume()?.position(file)
    }

    pub fn open_directory(&mut self, path: &str) -> Result<(DirId, usize)> {
        let volume = self.mounted(path)?;
        path::filename_component(path)?;
        volume.open_directory()
    }

    pub fn read_directory(&mut self, dir: DirId) -> Result<DirStat> {
        self.ready_volume()?.read_directory(dir)
    }

    pub fn close_directory(&mut self, dir: DirId) -> Result<()> {
        self.ready_volume()?.close_directory(dir)
    }
}
