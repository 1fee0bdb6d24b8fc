#![forbid(unsafe_code)]
//! External collaborators of the FTL core: the physical NAND timing model
//! (PAL), the DRAM access-cost model, the per-operation CPU latency table,
//! the discrete-event queue, and the analytic RBER model.
//!
//! Everything here is deterministic for a given tick input; the FTL core
//! threads one `&mut u64` tick through every call and the models only ever
//! advance it.

pub mod event;
pub mod rber;

pub use event::{EventEngine, EventId};
pub use rber::{RberConfig, RberModel};

use fsim_types::{BlockId, IoBitmap};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// One NAND operation addressed to `(block, page)` with per-IO-unit flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PalRequest {
    pub block: BlockId,
    pub page: u32,
    pub io_flag: IoBitmap,
}

/// Physical NAND timing model consumed by the FTL core.
///
/// Implementations advance `tick` by the simulated latency of the operation
/// and must be deterministic for a given tick input.
pub trait NandModel {
    fn read(&self, req: &PalRequest, tick: &mut u64);
    fn write(&self, req: &PalRequest, tick: &mut u64);
    fn erase(&self, req: &PalRequest, tick: &mut u64);
}

/// DRAM access-cost model: charges the time to touch `bytes` of
/// mapping-table state.
pub trait DramModel {
    fn read(&self, bytes: u64, tick: &mut u64);
    fn write(&self, bytes: u64, tick: &mut u64);
}

/// Fixed per-operation NAND latencies in nanoseconds.
///
/// Defaults are in the range of mid-grade MLC NAND: 50 us page read,
/// 500 us program, 3.5 ms block erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NandTimings {
    pub read_ns: u64,
    pub program_ns: u64,
    pub erase_ns: u64,
}

impl Default for NandTimings {
    fn default() -> Self {
        Self {
            read_ns: 50_000,
            program_ns: 500_000,
            erase_ns: 3_500_000,
        }
    }
}

/// Reference `NandModel`: every operation costs its fixed latency.
#[derive(Debug, Clone, Default)]
pub struct LatencyNand {
    timings: NandTimings,
}

impl LatencyNand {
    #[must_use]
    pub fn new(timings: NandTimings) -> Self {
        Self { timings }
    }
}

impl NandModel for LatencyNand {
    fn read(&self, req: &PalRequest, tick: &mut u64) {
        trace!(
            target: "fsim::nand",
            event = "pal_read",
            block = req.block.0,
            page = req.page,
            at = *tick
        );
        *tick += self.timings.read_ns;
    }

    fn write(&self, req: &PalRequest, tick: &mut u64) {
        trace!(
            target: "fsim::nand",
            event = "pal_write",
            block = req.block.0,
            page = req.page,
            at = *tick
        );
        *tick += self.timings.program_ns;
    }

    fn erase(&self, req: &PalRequest, tick: &mut u64) {
        trace!(
            target: "fsim::nand",
            event = "pal_erase",
            block = req.block.0,
            at = *tick
        );
        *tick += self.timings.erase_ns;
    }
}

/// DRAM cost parameters: a fixed access overhead plus a per-byte charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DramTimings {
    pub access_ns: u64,
    pub per_byte_ns: u64,
}

impl Default for DramTimings {
    fn default() -> Self {
        Self {
            access_ns: 20,
            per_byte_ns: 1,
        }
    }
}

/// Reference `DramModel` with linear cost in the touched byte count.
#[derive(Debug, Clone, Default)]
pub struct LinearDram {
    timings: DramTimings,
}

impl LinearDram {
    #[must_use]
    pub fn new(timings: DramTimings) -> Self {
        Self { timings }
    }
}

impl DramModel for LinearDram {
    fn read(&self, bytes: u64, tick: &mut u64) {
        *tick += self.timings.access_ns + bytes * self.timings.per_byte_ns;
    }

    fn write(&self, bytes: u64, tick: &mut u64) {
        *tick += self.timings.access_ns + bytes * self.timings.per_byte_ns;
    }
}

/// Firmware CPU latency per FTL operation, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuTimings {
    pub read_ns: u64,
    pub write_ns: u64,
    pub trim_ns: u64,
    pub format_ns: u64,
    pub read_internal_ns: u64,
    pub write_internal_ns: u64,
    pub trim_internal_ns: u64,
    pub erase_internal_ns: u64,
    pub select_victim_ns: u64,
    pub gc_ns: u64,
}

impl Default for CpuTimings {
    fn default() -> Self {
        Self {
            read_ns: 500,
            write_ns: 500,
            trim_ns: 400,
            format_ns: 900,
            read_internal_ns: 700,
            write_internal_ns: 700,
            trim_internal_ns: 600,
            erase_internal_ns: 600,
            select_victim_ns: 800,
            gc_ns: 1_200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> PalRequest {
        PalRequest {
            block: BlockId(3),
            page: 17,
            io_flag: IoBitmap::full(4).unwrap(),
        }
    }

    #[test]
    fn test_latency_nand_advances_tick() {
        let nand = LatencyNand::default();
        let mut tick = 1_000;
        nand.read(&req(), &mut tick);
        assert_eq!(tick, 1_000 + 50_000);
        nand.write(&req(), &mut tick);
        assert_eq!(tick, 1_000 + 50_000 + 500_000);
        nand.erase(&req(), &mut tick);
        assert_eq!(tick, 1_000 + 50_000 + 500_000 + 3_500_000);
    }

    #[test]
    fn test_latency_nand_deterministic() {
        let nand = LatencyNand::new(NandTimings {
            read_ns: 7,
            program_ns: 11,
            erase_ns: 13,
        });
        let mut a = 0;
        let mut b = 0;
        nand.read(&req(), &mut a);
        nand.read(&req(), &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_linear_dram_charge() {
        let dram = LinearDram::new(DramTimings {
            access_ns: 10,
            per_byte_ns: 2,
        });
        let mut tick = 0;
        dram.read(8, &mut tick);
        assert_eq!(tick, 10 + 16);
        dram.write(0, &mut tick);
        assert_eq!(tick, 10 + 16 + 10);
    }
}
