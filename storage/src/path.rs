//! `/<partition>/<filename>` path handling.

use crate::dirent::{Filename, MAX_FILENAME_LEN};
use crate::{RafsError, Result};

pub const MAX_PARTITION_NAME_LEN: usize = 7;
const SEPARATOR: char = '/';

/// Component `index` starts after the `index`-th separator and runs to the
/// next separator or the end. `capacity` counts the terminator, so the
/// component must be strictly shorter.
fn component(path: &str, index: usize, capacity: usize) -> Result<&str> {
    let mut rest = path;
    for _ in 0..index {
        let at = rest.find(SEPARATOR).ok_or(RafsError::InvalidPath)?;
        rest = &rest[at + 1..];
    }
    let end = rest.find(SEPARATOR).unwrap_or(rest.len());
    let part = &rest[..end];
    if part.len() >= capacity {
        return Err(RafsError::InvalidLength);
    }
    Ok(part)
}

pub(crate) fn partition_name(path: &str) -> Result<&str> {
    component(path, 1, MAX_PARTITION_NAME_LEN + 1)
}

/// The raw filename component; empty for a directory path.
pub(crate) fn filename_component(path: &str) -> Result<&str> {
    component(path, 2, MAX_FILENAME_LEN)
}

pub(crate) fn filename(path: &str) -> Result<Filename> {
    Filename::new(filename_component(path)?)
}
