#![forbid(unsafe_code)]
//! Error types for flashsim.
//!
//! Defines `FtlError` and a `Result<T>` alias used throughout the workspace.
//! Most variants are invariant violations: the simulator's state machine has
//! been driven somewhere it must never go, and the run cannot continue.

use thiserror::Error;

/// Unified error type for all FTL core operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FtlError {
    #[error("no free block left in the pool")]
    OutOfFreeBlocks,

    #[error("erase of block {block} with {valid} valid sub-pages")]
    InvalidErase { block: u32, valid: u32 },

    #[error("write to block {block} page {page} does not match IO-unit {io_unit} cursor {cursor}")]
    InvalidWrite {
        block: u32,
        page: u32,
        io_unit: u32,
        cursor: u32,
    },

    #[error("read of invalid sub-page at block {block} page {page} IO-unit {io_unit}")]
    InvalidRead { block: u32, page: u32, io_unit: u32 },

    #[error("no mapping entry for lpn {lpn} referenced by a valid sub-page")]
    MissingMapping { lpn: u64 },

    #[error("garbage collection triggered during initialization warmup")]
    GcDuringInit,

    #[error("block {block} inserted into the used set twice")]
    DuplicateBlockInsert { block: u32 },

    #[error("block {block} is not in use")]
    BlockNotInUse { block: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FtlError {
    /// Whether this error signals a broken core invariant (abort the
    /// simulation) as opposed to a rejected construction-time input.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

/// Result alias using `FtlError`.
pub type Result<T> = std::result::Result<T, FtlError>;
