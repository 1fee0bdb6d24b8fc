#![forbid(unsafe_code)]
//! flashsim public API facade.
//!
//! Re-exports the FTL core through a stable external interface. This is the
//! crate that downstream consumers (CLI, harnesses) depend on.

pub use fsim_error::{FtlError, Result};
pub use fsim_ftl::*;
pub use fsim_nand as nand;
pub use fsim_types as types;
