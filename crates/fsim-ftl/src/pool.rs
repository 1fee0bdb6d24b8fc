//! Free-block pool.
//!
//! Owns every block that is not currently in use, ordered by ascending
//! erase count so that allocation implicitly wear-levels. Extraction is
//! round-robin over `id % stripe` to spread open blocks across parallel
//! planes, falling back to the pool head when no stripe match exists.

use crate::block::Block;
use fsim_error::{FtlError, Result};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct FreePool {
    blocks: VecDeque<Block>,
}

impl FreePool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Seed the pool at construction time. Blocks arrive with a uniform
    /// erase count, so plain push keeps the order invariant.
    pub fn push_initial(&mut self, block: Block) {
        self.blocks.push_back(block);
    }

    /// Take the first block with `id % stripe == rr_index`, or the pool
    /// head when no stripe match exists.
    pub fn take(&mut self, rr_index: u32, stripe: u32) -> Result<Block> {
        if self.blocks.is_empty() {
            return Err(FtlError::OutOfFreeBlocks);
        }
        let position = self
            .blocks
            .iter()
            .position(|b| b.id().0 % stripe == rr_index)
            .unwrap_or(0);
        Ok(self
            .blocks
            .remove(position)
            .expect("position from a scan of the same deque"))
    }

    /// Reinsert an erased block, keeping the pool ascending by erase count:
    /// reverse-scan for the last element with an erase count not above the
    /// incoming one and insert after it.
    pub fn reinsert(&mut self, block: Block) {
        let erase_count = block.erase_count();
        let at = self
            .blocks
            .iter()
            .rposition(|b| b.erase_count() <= erase_count)
            .map_or(0, |i| i + 1);
        self.blocks.insert(at, block);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Whether the erase-count ordering invariant holds.
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.blocks
            .iter()
            .zip(self.blocks.iter().skip(1))
            .all(|(a, b)| a.erase_count() <= b.erase_count())
    }
}
