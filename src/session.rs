use std::path::Path;

use bytes::Bytes;
use rafs::{DirStat, FormatKind, OpenMode, Rafs, RafsError, RafsMessage, Statfs};
use system::FilePartitionManager;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, ToolError};

/// Chunk size for reading files back out of the image.
const READ_CHUNK: usize = 4096;

/// Drives one file system instance over image files. Background work is
/// stepped from the async runtime until the awaited completion arrives.
pub struct Session {
    config: Config,
    fs: Rafs<FilePartitionManager>,
    responder: rafs::Responder,
    completions: mpsc::UnboundedReceiver<RafsMessage>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FsckReport {
    pub statfs: Statfs,
    pub files: Vec<DirStat>,
    pub compacted: bool,
}

impl Session {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        system::environment_check(&config.image_dir)?;

        let manager = FilePartitionManager::from(&config);
        let fs = Rafs::init(manager, config.filesystem.clone());
        let (responder, completions) = mpsc::unbounded_channel();

        info!(
            "Session on {} in {}",
            config.partition,
            config.image_dir.display()
        );
        Ok(Self {
            config,
            fs,
            responder,
            completions,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Feed the host battery state into the write gate.
    pub fn apply_host_power(&mut self, sysfs: &Path) -> Result<()> {
        if let Some(state) = system::probe_host_power(sysfs)? {
            if let Some(event) = state.charger {
                self.fs.notify_charger(event);
            }
            self.fs.notify_battery(state.battery);
            info!("Host power: {:?}", state);
        }
        Ok(())
    }

    async fn next_completion(&mut self, waiting_for: &'static str) -> Result<RafsMessage> {
        loop {
            if let Ok(message) = self.completions.try_recv() {
                debug!("Completion: {:?}", message);
                return Ok(message);
            }
            if !self.fs.step() {
                return Err(ToolError::ChannelClosed(waiting_for));
            }
            tokio::task::yield_now().await;
        }
    }

    pub fn format(&mut self, force: bool) -> Result<()> {
        let kind = if force { FormatKind::Forced } else { FormatKind::Normal };
        self.fs.format(&self.config.partition_path(), kind)?;
        info!("Formatted {}", self.config.partition);
        Ok(())
    }

    pub async fn mount(&mut self) -> Result<()> {
        let path = self.config.partition_path();
        self.fs.mount(Some(self.responder.clone()), &path)?;
        match self.next_completion("mount").await? {
            RafsMessage::MountComplete { status } => Ok(status?),
            other => {
                warn!("Unexpected completion {:?}", other);
                Err(ToolError::ChannelClosed("mount"))
            }
        }
    }

    pub fn unmount(&mut self) -> Result<()> {
        self.fs.unmount(&self.config.partition_path())?;
        Ok(())
    }

    pub fn list(&mut self) -> Result<Vec<DirStat>> {
        let (dir, count) = self.fs.open_directory(&self.config.file_path(""))?;
        let mut files = Vec::with_capacity(count);
        let listed = loop {
            match self.fs.read_directory(dir) {
                Ok(stat) => files.push(stat),
                Err(RafsError::NoMoreFiles) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.fs.close_directory(dir)?;
        listed?;
        Ok(files)
    }

    /// Create `name` and write `data` through the background writer.
    pub async fn put(&mut self, name: &str, data: Bytes) -> Result<()> {
        let path = self.config.file_path(name);
        let file = self.fs.open(Some(self.responder.clone()), &path, OpenMode::Write)?;
        self.fs.write_background(file, data)?;

        let outcome = match self.next_completion("write").await? {
            RafsMessage::WriteComplete(done) => match done.result {
                Ok(()) if done.written == done.requested => Ok(()),
                Ok(()) => Err(ToolError::ShortWrite {
                    written: done.written,
                    requested: done.requested,
                }),
                Err(e) => Err(e.into()),
            },
            other => {
                warn!("Unexpected completion {:?}", other);
                Err(ToolError::ChannelClosed("write"))
            }
        };
        self.fs.close(file)?;
        outcome
    }

    pub fn get(&mut self, name: &str) -> Result<Vec<u8>> {
        let path = self.config.file_path(name);
        let file = self.fs.open(None, &path, OpenMode::Read)?;
        let mut contents = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let read = loop {
            match self.fs.read(file, &mut chunk) {
                Ok(n) => contents.extend_from_slice(&chunk[..n]),
                Err(RafsError::NoMoreData) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.fs.close(file)?;
        read?;
        Ok(contents)
    }

    pub async fn remove(&mut self, name: &str) -> Result<()> {
        let path = self.config.file_path(name);
        self.fs.remove(Some(self.responder.clone()), &path)?;
        match self.next_completion("remove").await? {
            RafsMessage::RemoveComplete { status } => Ok(status?),
            other => {
                warn!("Unexpected completion {:?}", other);
                Err(ToolError::ChannelClosed("remove"))
            }
        }
    }

    /// Compact the metadata table. Returns the free directory slots, or
    /// `None` when there was nothing to reclaim.
    pub async fn compact(&mut self) -> Result<Option<u32>> {
        let path = self.config.partition_path();
        match self.fs.compact(Some(self.responder.clone()), &path) {
            Ok(()) => {}
            Err(RafsError::FileSystemClean) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        match self.next_completion("compact").await? {
            RafsMessage::CompactComplete { status, free_slots } => {
                status?;
                Ok(Some(free_slots))
            }
            other => {
                warn!("Unexpected completion {:?}", other);
                Err(ToolError::ChannelClosed("compact"))
            }
        }
    }

    pub fn statfs(&mut self) -> Result<Statfs> {
        Ok(self.fs.statfs(&self.config.partition_path())?)
    }

    pub fn file_offset(&mut self, name: &str) -> Result<u32> {
        Ok(self.fs.file_offset(&self.config.file_path(name))?)
    }

    /// Mount (which checks and repairs both tables), compact if needed,
    /// and report what is on the partition.
    pub async fn fsck(&mut self) -> Result<FsckReport> {
        self.mount().await?;
        let compacted = self.compact().await?.is_some();
        let report = FsckReport {
            statfs: self.statfs()?,
            files: self.list()?,
            compacted,
        };
        self.unmount()?;
        Ok(report)
    }

    /// Unmount if needed and tear the instance down.
    pub fn close(mut self) -> Result<()> {
        if self.fs.mounted_partition().is_some() {
            self.unmount()?;
        }
        match self.fs.shutdown() {
            Ok(_) => Ok(()),
            Err((_, e)) => Err(e.into()),
        }
    }
}
