use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use system::ImageGeometry;

use crate::error::{Result, ToolError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub image_dir: PathBuf,
    pub partition: String,
    pub geometry: ImageGeometry,
    pub log_level: String,
    pub create_missing: bool,
    pub filesystem: rafs::Config,
}

impl Config {
    pub fn new(image_dir: impl Into<PathBuf>, partition: &str) -> Self {
        Self {
            image_dir: image_dir.into(),
            partition: partition.to_string(),
            ..Self::default()
        }
    }

    /// Load a JSON config file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition.is_empty() || self.partition.len() > rafs::MAX_PARTITION_NAME_LEN {
            return Err(ToolError::InvalidConfig(format!(
                "Partition name {:?} must be 1 to {} characters",
                self.partition,
                rafs::MAX_PARTITION_NAME_LEN
            )));
        }
        if self.filesystem.max_open_files == 0 {
            return Err(ToolError::InvalidConfig("max_open_files must be at least 1".into()));
        }
        Ok(())
    }

    /// `/<partition>` path prefix.
    pub fn partition_path(&self) -> String {
        format!("/{}", self.partition)
    }

    pub fn file_path(&self, name: &str) -> String {
        format!("/{}/{}", self.partition, name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("./rafs-images"),
            partition: "VMdl".to_string(),
            geometry: ImageGeometry::default(),
            log_level: "info".to_string(),
            create_missing: true,
            filesystem: rafs::Config::default(),
        }
    }
}

impl From<Config> for rafs::Config {
    fn from(config: Config) -> Self {
        config.filesystem
    }
}

impl From<&Config> for system::FilePartitionManager {
    fn from(config: &Config) -> Self {
        system::FilePartitionManager::new(config.image_dir.clone(), config.geometry)
            .create_missing(config.create_missing)
    }
}
