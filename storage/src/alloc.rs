//! Sector-in-use bitmap.
//!
//! Never persisted: rebuilt on every mount by replaying the extents of all
//! live directory entries plus the two metadata blocks.

use crate::dirent::Extent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("Block {0} is already in use")]
    AlreadyUsed(u32),

    #[error("Block {0} is already free")]
    AlreadyFree(u32),

    #[error("Block {block} outside partition of {num_blocks} blocks")]
    OutOfRange { block: u32, num_blocks: u32 },
}

/// Free runs of a partition, largest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeRuns {
    /// At most the requested capacity, sorted by length descending then
    /// offset ascending.
    pub runs: Vec<Extent>,
    /// Number of runs that exist, even when `runs` was truncated.
    pub total: usize,
}

impl FreeRuns {
    pub fn is_truncated(&self) -> bool {
        self.total > self.runs.len()
    }
}

#[derive(Debug, Clone)]
pub struct SectorMap {
    bits: Vec<u8>,
    num_blocks: u32,
}

impl SectorMap {
    /// A map with every block free.
    pub fn new(num_blocks: u32) -> Self {
        Self {
            bits: vec![0u8; num_blocks.div_ceil(8) as usize],
            num_blocks,
        }
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    fn check(&self, block: u32) -> Result<(), AllocError> {
        if block < self.num_blocks {
            Ok(())
        } else {
            Err(AllocError::OutOfRange { block, num_blocks: self.num_blocks })
        }
    }

    pub fn is_in_use(&self, block: u32) -> bool {
        if block >= self.num_blocks {
            return true;
        }
        (self.bits[(block / 8) as usize] >> (block % 8)) & 1 == 1
    }

    pub fn is_free(&self, block: u32) -> bool {
        !self.is_in_use(block)
    }

    pub fn mark_used(&mut self, block: u32) -> Result<(), AllocError> {
        self.check(block)?;
        if self.is_in_use(block) {
            return Err(AllocError::AlreadyUsed(block));
        }
        self.bits[(block / 8) as usize] |= 1 << (block % 8);
        Ok(())
    }

    pub fn mark_free(&mut self, block: u32) -> Result<(), AllocError> {
        self.check(block)?;
        if self.is_free(block) {
            return Err(AllocError::AlreadyFree(block));
        }
        self.bits[(block / 8) as usize] &= !(1 << (block % 8));
        Ok(())
    }

    pub fn count_free(&self) -> u32 {
        (0..self.num_blocks).filter(|b| self.is_free(*b)).count() as u32
    }

    pub fn count_used(&self) -> u32 {
        self.num_blocks - self.count_free()
    }

    /// Mark every block of the valid extents used. Nothing is changed when
    /// any block is out of range or already taken.
    pub fn add_extents(&mut self, extents: &[Extent]) -> Result<(), AllocError> {
        for extent in extents.iter().filter(|e| e.is_valid()) {
            for block in extent.blocks() {
                self.check(block)?;
                if self.is_in_use(block) {
                    return Err(AllocError::AlreadyUsed(block));
                }
            }
        }
        for (i, a) in extents.iter().enumerate().filter(|(_, e)| e.is_valid()) {
            if let Some(b) = extents[i + 1..].iter().find(|b| b.is_valid() && a.overlaps(b)) {
                return Err(AllocError::AlreadyUsed(a.blocks().start.max(b.blocks().start)));
            }
        }
        for extent in extents.iter().filter(|e| e.is_valid()) {
            for block in extent.blocks() {
                self.mark_used(block)?;
            }
        }
        Ok(())
    }

    /// Release every block of the valid extents. Nothing is changed when any
    /// block is out of range or already free.
    pub fn remove_extents(&mut self, extents: &[Extent]) -> Result<(), AllocError> {
        for extent in extents.iter().filter(|e| e.is_valid()) {
            for block in extent.blocks() {
                self.check(block)?;
                if self.is_free(block) {
                    return Err(AllocError::AlreadyFree(block));
                }
            }
        }
        for extent in extents.iter().filter(|e| e.is_valid()) {
            for block in extent.blocks() {
                self.mark_free(block)?;
            }
        }
        Ok(())
    }

    /// Free runs in ascending block order.
    pub fn runs(&self) -> impl Iterator<Item = Extent> + '_ {
        let mut block = 0u32;
        std::iter::from_fn(move || {
            while block < self.num_blocks && self.is_in_use(block) {
                block += 1;
            }
            if block >= self.num_blocks {
                return None;
            }
            let start = block;
            while block < self.num_blocks && self.is_free(block) {
                block += 1;
            }
            Some(Extent::new(start as u16, (block - start) as u16))
        })
    }

    /// The longest free run; the earliest one wins a tie.
    pub fn longest_free_run(&self) -> Option<Extent> {
        self.runs().fold(None, |best: Option<Extent>, run| match best {
            Some(b) if b.length >= run.length => Some(b),
            _ => Some(run),
        })
    }

    pub fn count_free_runs(&self) -> usize {
        self.runs().count()
    }

    pub fn free_runs(&self, capacity: usize) -> FreeRuns {
        let mut runs: Vec<Extent> = self.runs().collect();
        let total = runs.len();
        runs.sort_by(|a, b| b.length.cmp(&a.length).then(a.offset.cmp(&b.offset)));
        runs.truncate(capacity);
        FreeRuns { runs, total }
    }
}
