//! Construction-time configuration.
//!
//! All knobs are read once when the FTL is built; nothing here changes at
//! runtime. `SimConfig` is the full bundle a front-end deserializes from
//! TOML.

use fsim_error::{FtlError, Result};
use fsim_nand::{CpuTimings, DramTimings, NandTimings, RberConfig};
use fsim_types::secs_to_ns;
use serde::{Deserialize, Serialize};

/// Immutable device shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceGeometry {
    pub pages_in_block: u32,
    /// Sub-page parallelism; the page splits into this many IO units.
    pub io_unit_in_page: u32,
    /// Page size in bytes.
    pub page_size: u32,
    pub total_physical_blocks: u32,
    pub total_logical_blocks: u32,
    /// Number of concurrently open write streams (parallel planes).
    pub page_count_to_max_perf: u32,
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        Self {
            pages_in_block: 256,
            io_unit_in_page: 1,
            page_size: 8_192,
            total_physical_blocks: 1_024,
            total_logical_blocks: 896,
            page_count_to_max_perf: 4,
        }
    }
}

impl DeviceGeometry {
    #[must_use]
    pub fn total_logical_pages(&self) -> u64 {
        u64::from(self.total_logical_blocks) * u64::from(self.pages_in_block)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pages_in_block == 0 || self.page_size == 0 {
            return Err(FtlError::Config("zero page geometry".into()));
        }
        if self.io_unit_in_page == 0 || self.io_unit_in_page > 64 {
            return Err(FtlError::Config(format!(
                "io_unit_in_page {} out of range 1..=64",
                self.io_unit_in_page
            )));
        }
        if self.total_physical_blocks == 0 {
            return Err(FtlError::Config("no physical blocks".into()));
        }
        if self.total_logical_blocks >= self.total_physical_blocks {
            return Err(FtlError::Config(format!(
                "logical blocks {} leave no over-provisioning in {} physical",
                self.total_logical_blocks, self.total_physical_blocks
            )));
        }
        if self.page_count_to_max_perf == 0
            || self.page_count_to_max_perf > self.total_physical_blocks
        {
            return Err(FtlError::Config(format!(
                "page_count_to_max_perf {} out of range",
                self.page_count_to_max_perf
            )));
        }
        Ok(())
    }
}

/// Warmup fill pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillingMode {
    /// Sequential fill, sequential invalidation.
    Sequential,
    /// Sequential fill, random invalidation inside the filled range.
    SequentialRandom,
    /// Random fill, random invalidation over the whole logical space.
    RandomRandom,
}

/// Victim selection policy for garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictPolicy {
    Greedy,
    Random,
    DChoice,
    CostBenefit,
}

/// How many blocks a GC pass reclaims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Reclaim a fixed number of blocks per pass.
    ReclaimFixed,
    /// Reclaim enough to drive the free ratio back to the threshold.
    ReclaimThreshold,
}

/// Policy for whole-block, host-driven refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Refresh every block whose retention age exceeds the threshold.
    RetentionThreshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtlConfig {
    /// Fraction of the logical space written during warmup.
    pub fill_ratio: f64,
    /// Fraction of the logical space rewritten to create invalid pages.
    pub invalid_page_ratio: f64,
    pub filling_mode: FillingMode,

    /// GC triggers when the free-block ratio drops below this.
    pub gc_threshold_ratio: f64,
    /// Target free ratio for `GcMode::ReclaimThreshold`.
    pub gc_reclaim_threshold: f64,
    /// Blocks per pass for `GcMode::ReclaimFixed`.
    pub gc_reclaim_blocks: u64,
    pub gc_mode: GcMode,
    pub gc_evict_policy: EvictPolicy,
    /// Candidate multiplier for `EvictPolicy::DChoice`.
    pub gc_d_choice_param: u64,

    /// Blocks reaching this erase count are retired instead of reused.
    pub bad_block_threshold: u32,
    /// Sub-page random-tweak mode: map each IO unit independently.
    pub use_random_io_tweak: bool,
    pub initial_erase_count: u32,

    /// Refresh scheduler period in seconds of simulated time; 0 disables.
    pub refresh_period_secs: u64,
    /// Number of Bloom filters (retention classes).
    pub refresh_filter_num: u32,
    /// Pinned filter size in bits; 0 derives the size from the projected
    /// element count.
    pub refresh_filter_size: u64,
    /// Retention age (ns) beyond which policy-driven refresh selects a block.
    pub refresh_threshold_ns: u64,
    pub refresh_policy: RefreshPolicy,
    /// RBER the ECC can still correct; classification inserts a layer into
    /// every class whose horizon pushes the predicted RBER past this.
    pub ecc_rber_limit: f64,

    pub random_seed: u64,
    pub rber: RberConfig,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            fill_ratio: 0.6,
            invalid_page_ratio: 0.0,
            filling_mode: FillingMode::Sequential,
            gc_threshold_ratio: 0.05,
            gc_reclaim_threshold: 0.1,
            gc_reclaim_blocks: 1,
            gc_mode: GcMode::ReclaimThreshold,
            gc_evict_policy: EvictPolicy::Greedy,
            gc_d_choice_param: 3,
            bad_block_threshold: 100_000,
            use_random_io_tweak: true,
            initial_erase_count: 0,
            refresh_period_secs: 0,
            refresh_filter_num: 4,
            refresh_filter_size: 0,
            refresh_threshold_ns: secs_to_ns(30 * 86_400),
            refresh_policy: RefreshPolicy::RetentionThreshold,
            ecc_rber_limit: 0.01,
            random_seed: 1,
            rber: RberConfig::default(),
        }
    }
}

impl FtlConfig {
    /// Refresh period converted to nanosecond ticks, the only place the
    /// seconds-to-ns conversion happens.
    #[must_use]
    pub fn refresh_period_ns(&self) -> u64 {
        secs_to_ns(self.refresh_period_secs)
    }

    pub fn validate(&self, geometry: &DeviceGeometry) -> Result<()> {
        geometry.validate()?;
        for (name, value) in [
            ("fill_ratio", self.fill_ratio),
            ("invalid_page_ratio", self.invalid_page_ratio),
            ("gc_threshold_ratio", self.gc_threshold_ratio),
            ("gc_reclaim_threshold", self.gc_reclaim_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FtlError::Config(format!("{name} {value} not in [0, 1]")));
            }
        }
        if !(0.0..1.0).contains(&self.ecc_rber_limit) || self.ecc_rber_limit == 0.0 {
            return Err(FtlError::Config(format!(
                "ecc_rber_limit {} not in (0, 1)",
                self.ecc_rber_limit
            )));
        }
        if self.gc_mode == GcMode::ReclaimFixed && self.gc_reclaim_blocks == 0 {
            return Err(FtlError::Config("gc_reclaim_blocks is zero".into()));
        }
        if self.gc_evict_policy == EvictPolicy::DChoice && self.gc_d_choice_param == 0 {
            return Err(FtlError::Config("gc_d_choice_param is zero".into()));
        }
        if self.refresh_period_secs > 0 && self.refresh_filter_num == 0 {
            return Err(FtlError::Config(
                "refresh enabled with zero bloom filters".into(),
            ));
        }
        if self.bad_block_threshold <= self.initial_erase_count {
            return Err(FtlError::Config(format!(
                "bad_block_threshold {} does not exceed initial_erase_count {}",
                self.bad_block_threshold, self.initial_erase_count
            )));
        }
        Ok(())
    }
}

/// Everything a front-end needs to build a simulator instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub geometry: DeviceGeometry,
    pub ftl: FtlConfig,
    pub nand: NandTimings,
    pub dram: DramTimings,
    pub cpu: CpuTimings,
}
