//! Per-physical-block metadata.
//!
//! A `Block` tracks, for every (page, IO-unit) sub-page, whether it has been
//! written since the last erase and whether it is still valid, plus the LPN
//! backpointer needed by GC and refresh copy-forward. Pages are written
//! strictly in cursor order per IO unit; erase requires the block to be
//! fully drained of valid sub-pages.

use fsim_error::{FtlError, Result};
use fsim_types::{BlockId, IoBitmap, Lpn};

/// Valid sub-pages of one physical page, with their LPN backpointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    /// Valid bits per IO unit.
    pub valid: IoBitmap,
    /// Backpointers per IO unit; meaningful only where `valid` is set.
    pub lpns: Vec<Lpn>,
}

#[derive(Debug)]
pub struct Block {
    id: BlockId,
    pages_in_block: u32,
    io_units: u32,
    erase_count: u32,
    /// Next page to write, one cursor per IO unit.
    next_write_page: Vec<u32>,
    valid: Vec<IoBitmap>,
    written: Vec<IoBitmap>,
    /// Backpointers, flattened `page * io_units + unit`.
    lpns: Vec<Lpn>,
    valid_count: u32,
    dirty_count: u32,
    /// No sub-page programmed since the last erase.
    fresh: bool,
    last_written_at: u64,
    last_accessed_at: u64,
    max_error_count: u64,
}

impl Block {
    #[must_use]
    pub fn new(id: BlockId, pages_in_block: u32, io_units: u32, initial_erase_count: u32) -> Self {
        let empty = IoBitmap::new(io_units).expect("validated io unit width");
        Self {
            id,
            pages_in_block,
            io_units,
            erase_count: initial_erase_count,
            next_write_page: vec![0; io_units as usize],
            valid: vec![empty; pages_in_block as usize],
            written: vec![empty; pages_in_block as usize],
            lpns: vec![Lpn(0); (pages_in_block as usize) * (io_units as usize)],
            valid_count: 0,
            dirty_count: 0,
            fresh: true,
            last_written_at: 0,
            last_accessed_at: 0,
            max_error_count: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    #[must_use]
    pub fn valid_count(&self) -> u32 {
        self.valid_count
    }

    #[must_use]
    pub fn dirty_count(&self) -> u32 {
        self.dirty_count
    }

    #[must_use]
    pub fn last_written_at(&self) -> u64 {
        self.last_written_at
    }

    pub fn set_last_written_at(&mut self, tick: u64) {
        self.last_written_at = tick;
    }

    #[must_use]
    pub fn last_accessed_at(&self) -> u64 {
        self.last_accessed_at
    }

    #[must_use]
    pub fn max_error_count(&self) -> u64 {
        self.max_error_count
    }

    /// Raise the running maximum of observed per-read error counts.
    pub fn record_error_count(&mut self, errors: u64) {
        self.max_error_count = self.max_error_count.max(errors);
    }

    /// Write cursor for one IO unit.
    #[must_use]
    pub fn next_write_page_for(&self, io_unit: u32) -> u32 {
        self.next_write_page[io_unit as usize]
    }

    /// Lowest cursor across IO units; the block is full exactly when this
    /// reaches `pages_in_block`.
    #[must_use]
    pub fn next_write_page(&self) -> u32 {
        self.next_write_page.iter().copied().min().unwrap_or(0)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.next_write_page() == self.pages_in_block
    }

    /// LPN backpointer of one sub-page; meaningful only while it is valid.
    #[must_use]
    pub fn lpn_at(&self, page: u32, io_unit: u32) -> Lpn {
        self.lpns[(page as usize) * (self.io_units as usize) + io_unit as usize]
    }

    #[must_use]
    pub fn is_valid(&self, page: u32, io_unit: u32) -> bool {
        page < self.pages_in_block && self.valid[page as usize].test(io_unit)
    }

    #[must_use]
    pub fn pages_in_block(&self) -> u32 {
        self.pages_in_block
    }

    /// Record a sub-page program at the IO unit's cursor position.
    pub fn write(&mut self, page: u32, lpn: Lpn, io_unit: u32, tick: u64) -> Result<()> {
        let cursor = self.next_write_page[io_unit as usize];
        if page != cursor || page >= self.pages_in_block {
            return Err(FtlError::InvalidWrite {
                block: self.id.0,
                page,
                io_unit,
                cursor,
            });
        }
        self.valid[page as usize].set(io_unit);
        self.written[page as usize].set(io_unit);
        self.lpns[(page as usize) * (self.io_units as usize) + io_unit as usize] = lpn;
        self.next_write_page[io_unit as usize] += 1;
        self.valid_count += 1;
        if self.fresh {
            self.last_written_at = tick;
            self.fresh = false;
        }
        self.last_accessed_at = tick;
        Ok(())
    }

    /// Record a sub-page read; the sub-page must be valid.
    pub fn read(&mut self, page: u32, io_unit: u32, tick: u64) -> Result<()> {
        if page >= self.pages_in_block || !self.valid[page as usize].test(io_unit) {
            return Err(FtlError::InvalidRead {
                block: self.id.0,
                page,
                io_unit,
            });
        }
        self.last_accessed_at = tick;
        Ok(())
    }

    /// Drop the valid bit of a sub-page. Idempotent on already-invalid
    /// sub-pages.
    pub fn invalidate(&mut self, page: u32, io_unit: u32) {
        if page >= self.pages_in_block || !self.valid[page as usize].test(io_unit) {
            return;
        }
        self.valid[page as usize].clear(io_unit);
        self.valid_count -= 1;
        self.dirty_count += 1;
    }

    /// Valid sub-pages of `page`, or `None` when the whole page is invalid
    /// or unwritten.
    #[must_use]
    pub fn page_info(&self, page: u32) -> Option<PageInfo> {
        let valid = self.valid[page as usize];
        if valid.none() {
            return None;
        }
        let base = (page as usize) * (self.io_units as usize);
        Some(PageInfo {
            valid,
            lpns: self.lpns[base..base + self.io_units as usize].to_vec(),
        })
    }

    /// Erase the block. Every sub-page must already be invalid.
    pub fn erase(&mut self) -> Result<()> {
        if self.valid_count != 0 {
            return Err(FtlError::InvalidErase {
                block: self.id.0,
                valid: self.valid_count,
            });
        }
        for cursor in &mut self.next_write_page {
            *cursor = 0;
        }
        for page in &mut self.valid {
            page.reset();
        }
        for page in &mut self.written {
            page.reset();
        }
        self.dirty_count = 0;
        self.fresh = true;
        self.last_written_at = 0;
        self.last_accessed_at = 0;
        self.erase_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        Block::new(BlockId(5), 8, 4, 0)
    }

    #[test]
    fn test_write_advances_cursor() {
        let mut b = block();
        b.write(0, Lpn(10), 0, 100).unwrap();
        assert_eq!(b.next_write_page_for(0), 1);
        assert_eq!(b.next_write_page_for(1), 0);
        assert_eq!(b.next_write_page(), 0);
        assert_eq!(b.valid_count(), 1);
        assert_eq!(b.lpn_at(0, 0), Lpn(10));
        assert_eq!(b.last_written_at(), 100);
        assert_eq!(b.last_accessed_at(), 100);
    }

    #[test]
    fn test_write_off_cursor_rejected() {
        let mut b = block();
        let err = b.write(3, Lpn(1), 0, 0).unwrap_err();
        assert_eq!(
            err,
            FtlError::InvalidWrite {
                block: 5,
                page: 3,
                io_unit: 0,
                cursor: 0
            }
        );
    }

    #[test]
    fn test_first_write_since_erase_stamps_written_time() {
        let mut b = block();
        b.write(0, Lpn(1), 0, 100).unwrap();
        b.write(1, Lpn(2), 0, 200).unwrap();
        assert_eq!(b.last_written_at(), 100);
        assert_eq!(b.last_accessed_at(), 200);
    }

    #[test]
    fn test_invalidate_idempotent() {
        let mut b = block();
        b.write(0, Lpn(1), 2, 0).unwrap();
        b.invalidate(0, 2);
        b.invalidate(0, 2);
        b.invalidate(0, 3);
        assert_eq!(b.valid_count(), 0);
        assert_eq!(b.dirty_count(), 1);
    }

    #[test]
    fn test_page_info() {
        let mut b = block();
        assert!(b.page_info(0).is_none());
        b.write(0, Lpn(7), 1, 0).unwrap();
        b.write(0, Lpn(8), 3, 0).unwrap();
        let info = b.page_info(0).unwrap();
        assert_eq!(info.valid.ones().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(info.lpns[1], Lpn(7));
        assert_eq!(info.lpns[3], Lpn(8));
        b.invalidate(0, 1);
        b.invalidate(0, 3);
        assert!(b.page_info(0).is_none());
    }

    #[test]
    fn test_read_requires_valid() {
        let mut b = block();
        assert!(b.read(0, 0, 0).is_err());
        b.write(0, Lpn(1), 0, 0).unwrap();
        b.read(0, 0, 50).unwrap();
        assert_eq!(b.last_accessed_at(), 50);
    }

    #[test]
    fn test_erase_contract() {
        let mut b = block();
        b.write(0, Lpn(1), 0, 10).unwrap();
        assert_eq!(
            b.erase().unwrap_err(),
            FtlError::InvalidErase { block: 5, valid: 1 }
        );
        b.invalidate(0, 0);
        b.erase().unwrap();
        assert_eq!(b.erase_count(), 1);
        assert_eq!(b.valid_count(), 0);
        assert_eq!(b.dirty_count(), 0);
        assert_eq!(b.next_write_page(), 0);
        assert_eq!(b.last_written_at(), 0);
        // Cursor restarts from page 0.
        b.write(0, Lpn(2), 0, 99).unwrap();
        assert_eq!(b.last_written_at(), 99);
    }

    #[test]
    fn test_full_detection_needs_all_cursors() {
        let mut b = Block::new(BlockId(0), 2, 2, 0);
        b.write(0, Lpn(0), 0, 0).unwrap();
        b.write(1, Lpn(1), 0, 0).unwrap();
        assert!(!b.is_full());
        b.write(0, Lpn(2), 1, 0).unwrap();
        b.write(1, Lpn(3), 1, 0).unwrap();
        assert!(b.is_full());
    }

    #[test]
    fn test_valid_plus_dirty_bounded() {
        let mut b = Block::new(BlockId(0), 4, 2, 0);
        for page in 0..4 {
            b.write(page, Lpn(u64::from(page)), 0, 0).unwrap();
            b.write(page, Lpn(u64::from(page) + 100), 1, 0).unwrap();
        }
        b.invalidate(0, 0);
        b.invalidate(2, 1);
        assert!(b.valid_count() + b.dirty_count() <= 4 * 2);
        assert_eq!(b.valid_count(), 6);
        assert_eq!(b.dirty_count(), 2);
    }

    #[test]
    fn test_error_count_running_max() {
        let mut b = block();
        b.record_error_count(5);
        b.record_error_count(3);
        b.record_error_count(9);
        assert_eq!(b.max_error_count(), 9);
    }
}
