mod image;
mod power;

pub use image::{FilePartition, FilePartitionManager, ImageGeometry};
pub use power::probe_host_power;

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Environment check failed: {0}")]
    Environment(String),

    #[error("Invalid image {path}: {reason}")]
    InvalidImage { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Make sure the image directory exists and is usable.
pub fn environment_check(image_dir: &Path) -> Result<(), SystemError> {
    std::fs::create_dir_all(image_dir).map_err(|e| {
        SystemError::Environment(format!(
            "Cannot create image directory {}: {}",
            image_dir.display(),
            e
        ))
    })?;

    let metadata = std::fs::metadata(image_dir)?;
    if !metadata.is_dir() {
        return Err(SystemError::Environment(format!(
            "Image path {} is not a directory",
            image_dir.display()
        )));
    }
    if metadata.permissions().readonly() {
        return Err(SystemError::Environment(format!(
            "Image directory {} is read-only",
            image_dir.display()
        )));
    }

    tracing::info!("Image directory check passed: {}", image_dir.display());
    Ok(())
}
