//! The page-mapping FTL front-end.
//!
//! `PageMapping` owns every long-lived structure of the core (the used-block
//! map, the free pool, the mapping table, the Bloom-filter bank) and
//! exposes the host operation set (read / write / trim / format / status)
//! plus the two refresh entry points: the periodic Bloom-filter sweep and
//! policy-driven whole-block refresh.
//!
//! Time is a `&mut u64` tick threaded through every call; the NAND, DRAM
//! and CPU models only ever advance it. Within one host operation, reads
//! are issued before writes and writes before erases; GC reduces per-page
//! finish times with `max` to model bus parallelism conservatively.

use crate::block::Block;
use crate::bloom::{BloomFilter, BloomParams};
use crate::config::{DeviceGeometry, EvictPolicy, FillingMode, FtlConfig, GcMode, RefreshPolicy, SimConfig};
use crate::map::MappingTable;
use crate::pool::FreePool;
use crate::stats::{FtlStats, StatEntry};
use crate::victim;
use fsim_error::{FtlError, Result};
use fsim_nand::{
    CpuTimings, DramModel, EventEngine, EventId, LatencyNand, LinearDram, NandModel, PalRequest,
    RberModel,
};
use fsim_types::{layer_key, layer_of, BlockId, IoBitmap, Lpn, LpnRange, PhysAddr, WORDLINE_LAYERS};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Bytes of mapping-table state per sub-unit, charged against the DRAM model.
const MAPPING_ENTRY_BYTES: u64 = 8;

/// One host operation: a logical page and the sub-units it covers.
#[derive(Debug, Clone, Copy)]
pub struct HostRequest {
    pub lpn: Lpn,
    pub io_flag: IoBitmap,
}

/// Snapshot returned by [`PageMapping::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub total_logical_pages: u64,
    pub mapped_logical_pages: u64,
    pub free_physical_blocks: u64,
}

/// Outcome of the warmup fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupReport {
    pub valid_pages: u64,
    pub invalid_pages: u64,
    pub target_valid: u64,
    pub target_invalid: u64,
}

pub struct PageMapping<N = LatencyNand, D = LinearDram> {
    geometry: DeviceGeometry,
    config: FtlConfig,
    nand: N,
    dram: D,
    cpu: CpuTimings,

    used: HashMap<BlockId, Block>,
    pool: FreePool,
    table: MappingTable,
    retired_blocks: u64,

    /// Currently-open write blocks, one per parallel plane.
    open_blocks: Vec<BlockId>,
    open_io_map: IoBitmap,
    open_index: usize,
    /// One-shot latch: an open stripe filled, reclaim extra on the next GC.
    reclaim_more: bool,

    /// Independently mapped sub-units per page (1 without random tweak).
    io_units: u32,
    random_tweak: bool,

    rber: RberModel,
    rng: StdRng,

    filters: Vec<BloomFilter>,
    refresh_table: HashMap<u64, u32>,
    refresh_event: Option<EventId>,

    stats: FtlStats,
}

impl PageMapping<LatencyNand, LinearDram> {
    /// Build an instance around the reference timing models.
    pub fn from_sim_config(cfg: &SimConfig) -> Result<Self> {
        PageMapping::new(
            cfg.geometry,
            cfg.ftl.clone(),
            LatencyNand::new(cfg.nand),
            LinearDram::new(cfg.dram),
            cfg.cpu,
        )
    }
}

impl<N: NandModel, D: DramModel> PageMapping<N, D> {
    pub fn new(
        geometry: DeviceGeometry,
        config: FtlConfig,
        nand: N,
        dram: D,
        cpu: CpuTimings,
    ) -> Result<Self> {
        config.validate(&geometry)?;

        let random_tweak = config.use_random_io_tweak;
        let io_units = if random_tweak {
            geometry.io_unit_in_page
        } else {
            1
        };

        let mut pool = FreePool::new();
        for id in 0..geometry.total_physical_blocks {
            pool.push_initial(Block::new(
                BlockId(id),
                geometry.pages_in_block,
                geometry.io_unit_in_page,
                config.initial_erase_count,
            ));
        }

        let table = MappingTable::new(
            io_units as usize,
            geometry.total_logical_pages().min(1 << 20) as usize,
        );
        let rber = RberModel::new(config.rber, geometry.page_size, config.random_seed);
        let rng = StdRng::seed_from_u64(config.random_seed);
        let open_io_map = IoBitmap::new(geometry.io_unit_in_page)
            .map_err(|e| FtlError::Config(e.to_string()))?;

        let mut ftl = Self {
            geometry,
            config,
            nand,
            dram,
            cpu,
            used: HashMap::with_capacity(geometry.total_physical_blocks as usize),
            pool,
            table,
            retired_blocks: 0,
            open_blocks: Vec::with_capacity(geometry.page_count_to_max_perf as usize),
            open_io_map,
            open_index: 0,
            reclaim_more: false,
            io_units,
            random_tweak,
            rber,
            rng,
            filters: Vec::new(),
            refresh_table: HashMap::new(),
            refresh_event: None,
            stats: FtlStats::default(),
        };

        for plane in 0..geometry.page_count_to_max_perf {
            let id = ftl.get_free_block(plane, 0)?;
            ftl.open_blocks.push(id);
        }
        Ok(ftl)
    }

    // ── Warmup ──────────────────────────────────────────────────────────────

    /// Fill the device per the configured warmup pattern, build the Bloom
    /// bank and install the periodic refresh event.
    pub fn initialize(&mut self, engine: &mut EventEngine) -> Result<WarmupReport> {
        info!(target: "fsim::ftl", "initialization started");

        let total_pages = self.geometry.total_logical_pages();
        let target_valid = (total_pages as f64 * self.config.fill_ratio) as u64;
        let mut target_invalid = (total_pages as f64 * self.config.invalid_page_ratio) as u64;

        // Free-block headroom that must survive warmup so the first host
        // writes do not immediately trigger GC.
        let headroom = (f64::from(self.geometry.pages_in_block)
            * (f64::from(self.geometry.total_physical_blocks)
                * (1.0 - self.config.gc_threshold_ratio)
                - f64::from(self.geometry.page_count_to_max_perf)))
        .max(0.0) as u64;

        if target_valid + target_invalid > headroom {
            warn!(
                target: "fsim::ftl",
                fill = target_valid,
                invalidate = target_invalid,
                headroom,
                "filling ratio too high, clamping invalid page ratio"
            );
            target_invalid = headroom.saturating_sub(target_valid);
        }

        info!(
            target: "fsim::ftl",
            total_logical_pages = total_pages,
            pages_to_fill = target_valid,
            pages_to_invalidate = target_invalid,
            mode = ?self.config.filling_mode,
            "warmup plan"
        );

        let io_flag = IoBitmap::full(self.geometry.io_unit_in_page)
            .map_err(|e| FtlError::Config(e.to_string()))?;

        self.warmup_fill(total_pages, target_valid, io_flag)?;
        self.warmup_invalidate(total_pages, target_valid, target_invalid, io_flag)?;

        self.build_bloom_bank();

        if self.config.refresh_period_secs > 0 {
            let event = engine.allocate();
            engine.schedule(event, self.config.refresh_period_ns());
            self.refresh_event = Some(event);
        }
        self.stats.refresh_call_count = 1;

        let (valid_pages, invalid_pages) = self.total_pages();
        info!(
            target: "fsim::ftl",
            valid_pages,
            invalid_pages,
            target_valid,
            target_invalid,
            "initialization finished"
        );
        Ok(WarmupReport {
            valid_pages,
            invalid_pages,
            target_valid,
            target_invalid,
        })
    }

    fn warmup_fill(&mut self, total_pages: u64, count: u64, io_flag: IoBitmap) -> Result<()> {
        for i in 0..count {
            let lpn = match self.config.filling_mode {
                FillingMode::Sequential | FillingMode::SequentialRandom => Lpn(i),
                FillingMode::RandomRandom => Lpn(self.rng.gen_range(0..total_pages)),
            };
            let mut tick = 0;
            self.write_internal(&HostRequest { lpn, io_flag }, &mut tick, false)?;
        }
        Ok(())
    }

    fn warmup_invalidate(
        &mut self,
        total_pages: u64,
        filled: u64,
        count: u64,
        io_flag: IoBitmap,
    ) -> Result<()> {
        for i in 0..count {
            let lpn = match self.config.filling_mode {
                FillingMode::Sequential => Lpn(i),
                // Step 1 filled [0, filled) sequentially, so restricting the
                // range creates exactly `count` invalid pages.
                FillingMode::SequentialRandom => {
                    if filled == 0 {
                        return Ok(());
                    }
                    Lpn(self.rng.gen_range(0..filled))
                }
                FillingMode::RandomRandom => Lpn(self.rng.gen_range(0..total_pages)),
            };
            let mut tick = 0;
            self.write_internal(&HostRequest { lpn, io_flag }, &mut tick, false)?;
        }
        Ok(())
    }

    fn build_bloom_bank(&mut self) {
        let num = self.config.refresh_filter_num;
        self.filters = (0..num)
            .map(|i| {
                BloomFilter::new(&BloomParams {
                    pinned_bits: self.config.refresh_filter_size,
                    seed: self.config.random_seed + 1231 + u64::from(i),
                    ..BloomParams::default()
                })
            })
            .collect();
        for (i, filter) in self.filters.iter().enumerate() {
            debug!(
                target: "fsim::ftl::refresh",
                filter = i,
                bits = filter.size_bits(),
                hashes = filter.hash_count(),
                "bloom filter ready"
            );
        }
    }

    // ── Host operations ─────────────────────────────────────────────────────

    pub fn read(&mut self, req: &HostRequest, tick: &mut u64) -> Result<()> {
        let begin = *tick;
        if req.io_flag.count() > 0 {
            self.read_internal(req, tick)?;
            debug!(
                target: "fsim::ftl",
                event = "read",
                lpn = req.lpn.0,
                from = begin,
                to = *tick,
                lat = *tick - begin
            );
        } else {
            warn!(target: "fsim::ftl", lpn = req.lpn.0, "read with empty io flag");
        }
        *tick += self.cpu.read_ns;
        Ok(())
    }

    pub fn write(&mut self, req: &HostRequest, tick: &mut u64) -> Result<()> {
        let begin = *tick;
        if req.io_flag.count() > 0 {
            self.write_internal(req, tick, true)?;
            debug!(
                target: "fsim::ftl",
                event = "write",
                lpn = req.lpn.0,
                from = begin,
                to = *tick,
                lat = *tick - begin
            );
        } else {
            warn!(target: "fsim::ftl", lpn = req.lpn.0, "write with empty io flag");
        }
        *tick += self.cpu.write_ns;
        Ok(())
    }

    pub fn trim(&mut self, req: &HostRequest, tick: &mut u64) -> Result<()> {
        let begin = *tick;
        self.trim_internal(req, tick)?;
        debug!(
            target: "fsim::ftl",
            event = "trim",
            lpn = req.lpn.0,
            from = begin,
            to = *tick
        );
        *tick += self.cpu.trim_ns;
        Ok(())
    }

    /// Trim every mapped LPN in `range` and garbage-collect exactly the
    /// blocks that held them.
    pub fn format(&mut self, range: LpnRange, tick: &mut u64) -> Result<()> {
        let mut touched: Vec<BlockId> = Vec::new();
        for lpn in self.table.lpns_in_range(range) {
            if let Some(entry) = self.table.remove(lpn) {
                for (unit, slot) in entry.iter().enumerate() {
                    if let Some(addr) = slot {
                        self.block_mut(addr.block)?.invalidate(addr.page, unit as u32);
                        touched.push(addr.block);
                    }
                }
            }
        }
        touched.sort_unstable();
        touched.dedup();
        // Open write blocks stay out of the erase set; their invalidated
        // pages are reclaimed by a later GC pass.
        let open = self.open_blocks.clone();
        touched.retain(|b| !open.contains(b));

        debug!(
            target: "fsim::ftl",
            event = "format",
            slpn = range.slpn,
            nlp = range.nlp,
            blocks = touched.len()
        );
        self.do_garbage_collection(&touched, tick)?;
        *tick += self.cpu.format_ns;
        Ok(())
    }

    #[must_use]
    pub fn status(&self, lpn_begin: u64, lpn_end: u64) -> Status {
        let total_logical_pages = self.geometry.total_logical_pages();
        let mapped_logical_pages = if lpn_begin == 0 && lpn_end >= total_logical_pages {
            self.table.len() as u64
        } else {
            self.table.mapped_in_range(lpn_begin, lpn_end) as u64
        };
        Status {
            total_logical_pages,
            mapped_logical_pages,
            free_physical_blocks: self.pool.len() as u64,
        }
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn free_block_ratio(&self) -> f64 {
        self.pool.len() as f64 / f64::from(self.geometry.total_physical_blocks)
    }

    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.pool.len()
    }

    fn get_free_block(&mut self, plane: u32, tick: u64) -> Result<BlockId> {
        debug_assert!(plane < self.geometry.page_count_to_max_perf);
        let mut block = self
            .pool
            .take(plane, self.geometry.page_count_to_max_perf)?;
        let id = block.id();
        if self.used.contains_key(&id) {
            return Err(FtlError::DuplicateBlockInsert { block: id.0 });
        }
        block.set_last_written_at(tick);
        self.used.insert(id, block);
        Ok(id)
    }

    /// Pick the open block for a write covering `io_map`, rotating the
    /// round-robin window when the stripe would collide and replacing open
    /// blocks that have filled.
    fn get_last_free_block(&mut self, io_map: IoBitmap, tick: u64) -> Result<BlockId> {
        if !self.random_tweak || self.open_io_map.overlaps(io_map) {
            self.open_index = (self.open_index + 1) % self.open_blocks.len();
            self.open_io_map = io_map;
        } else {
            self.open_io_map.union_with(io_map);
        }

        let id = self.open_blocks[self.open_index];
        // Replace the open block once it cannot serve the requested stripe:
        // any requested IO unit whose cursor hit the end exhausts the block
        // for this write, even if other units still have runway.
        let exhausted = {
            let block = self.block_ref(id)?;
            let pages = self.geometry.pages_in_block;
            if self.random_tweak {
                io_map.ones().any(|u| block.next_write_page_for(u) >= pages)
            } else {
                block.next_write_page_for(0) >= pages
            }
        };
        if exhausted {
            let fresh = self.get_free_block(self.open_index as u32, tick)?;
            self.open_blocks[self.open_index] = fresh;
            self.reclaim_more = true;
            return Ok(fresh);
        }
        Ok(id)
    }

    fn block_ref(&self, id: BlockId) -> Result<&Block> {
        self.used
            .get(&id)
            .ok_or(FtlError::BlockNotInUse { block: id.0 })
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.used
            .get_mut(&id)
            .ok_or(FtlError::BlockNotInUse { block: id.0 })
    }

    fn unit_flag(&self, unit: u32) -> IoBitmap {
        let mut flag = IoBitmap::new(self.geometry.io_unit_in_page)
            .expect("geometry validated at construction");
        if self.random_tweak {
            flag.set(unit);
        } else {
            flag.set_all();
        }
        flag
    }

    fn full_flag(&self) -> IoBitmap {
        IoBitmap::full(self.geometry.io_unit_in_page).expect("geometry validated at construction")
    }

    fn covered(&self, io_flag: IoBitmap, unit: u32) -> bool {
        io_flag.test(unit) || !self.random_tweak
    }

    // ── Internal host paths ─────────────────────────────────────────────────

    fn read_internal(&mut self, req: &HostRequest, tick: &mut u64) -> Result<()> {
        let Some(entry) = self.table.get(req.lpn) else {
            return Ok(());
        };
        let addrs: Vec<Option<PhysAddr>> = entry.to_vec();

        let bytes = if self.random_tweak {
            MAPPING_ENTRY_BYTES * u64::from(req.io_flag.count())
        } else {
            MAPPING_ENTRY_BYTES
        };
        self.dram.read(bytes, tick);

        let mut finished = *tick;
        for unit in 0..self.io_units {
            if !self.covered(req.io_flag, unit) {
                continue;
            }
            let Some(addr) = addrs[unit as usize] else {
                continue;
            };
            let mut begin = *tick;
            self.block_mut(addr.block)?.read(addr.page, unit, begin)?;
            let pal = PalRequest {
                block: addr.block,
                page: addr.page,
                io_flag: self.unit_flag(unit),
            };
            self.nand.read(&pal, &mut begin);

            // Track the worst observed error count for the error statistics.
            let (retention, erase_count) = {
                let block = self.block_ref(addr.block)?;
                (
                    begin.saturating_sub(block.last_written_at()),
                    block.erase_count(),
                )
            };
            let errors = self
                .rber
                .sampled_error_count(retention, erase_count, layer_of(addr.page));
            self.block_mut(addr.block)?.record_error_count(errors);

            finished = finished.max(begin);
        }
        *tick = finished;
        *tick += self.cpu.read_internal_ns;
        Ok(())
    }

    fn write_internal(&mut self, req: &HostRequest, tick: &mut u64, send_to_pal: bool) -> Result<()> {
        let mut old_addrs: Vec<Option<PhysAddr>> = vec![None; self.io_units as usize];
        if let Some(entry) = self.table.get(req.lpn) {
            for unit in 0..self.io_units {
                if self.covered(req.io_flag, unit) {
                    old_addrs[unit as usize] = entry[unit as usize];
                }
            }
            for unit in 0..self.io_units {
                if let Some(addr) = old_addrs[unit as usize] {
                    self.block_mut(addr.block)?.invalidate(addr.page, unit);
                }
            }
        } else {
            self.table.ensure(req.lpn);
        }

        let dest = self.get_last_free_block(req.io_flag, *tick)?;

        if send_to_pal {
            let bytes = if self.random_tweak {
                MAPPING_ENTRY_BYTES * u64::from(req.io_flag.count())
            } else {
                MAPPING_ENTRY_BYTES
            };
            self.dram.read(bytes, tick);
            self.dram.write(bytes, tick);
        }

        // Without sub-page mapping, a partial write must merge with the old
        // page contents first.
        let read_before_write = !self.random_tweak && !req.io_flag.all();

        let mut finished = *tick;
        for unit in 0..self.io_units {
            if !self.covered(req.io_flag, unit) {
                continue;
            }
            let page = {
                let block = self.block_mut(dest)?;
                let page = block.next_write_page_for(unit);
                block.write(page, req.lpn, unit, *tick)?;
                page
            };

            let mut begin = *tick;
            if read_before_write && send_to_pal {
                if let Some(old) = old_addrs[unit as usize] {
                    let mut uncovered = req.io_flag;
                    uncovered.flip();
                    let pal = PalRequest {
                        block: old.block,
                        page: old.page,
                        io_flag: uncovered,
                    };
                    self.nand.read(&pal, &mut begin);
                }
            }

            let entry = self
                .table
                .get_mut(req.lpn)
                .ok_or(FtlError::MissingMapping { lpn: req.lpn.0 })?;
            entry[unit as usize] = Some(PhysAddr { block: dest, page });

            if send_to_pal {
                let pal = PalRequest {
                    block: dest,
                    page,
                    io_flag: self.unit_flag(unit),
                };
                self.nand.write(&pal, &mut begin);
            }
            finished = finished.max(begin);

            if send_to_pal {
                self.classify_write(dest, layer_of(page))?;
            }
        }

        // The warmup path bypasses both the PAL and the CPU charge.
        if send_to_pal {
            *tick = finished;
            *tick += self.cpu.write_internal_ns;
        }

        if self.free_block_ratio() < self.config.gc_threshold_ratio {
            if !send_to_pal {
                return Err(FtlError::GcDuringInit);
            }
            let mut begin = *tick;
            let victims = self.select_victim_blocks(&mut begin, &[])?;
            debug!(
                target: "fsim::ftl::gc",
                event = "on_demand",
                victims = victims.len(),
                free_ratio = self.free_block_ratio()
            );
            self.do_garbage_collection(&victims, &mut begin)?;
            debug!(
                target: "fsim::ftl::gc",
                event = "done",
                from = *tick,
                to = begin,
                lat = begin - *tick
            );
            self.stats.gc_count += 1;
            self.stats.reclaimed_blocks += victims.len() as u64;
        }
        Ok(())
    }

    fn trim_internal(&mut self, req: &HostRequest, tick: &mut u64) -> Result<()> {
        let Some(entry) = self.table.remove(req.lpn) else {
            return Ok(());
        };
        let bytes = if self.random_tweak {
            MAPPING_ENTRY_BYTES * u64::from(req.io_flag.count())
        } else {
            MAPPING_ENTRY_BYTES
        };
        self.dram.read(bytes, tick);

        for (unit, slot) in entry.iter().enumerate() {
            if let Some(addr) = slot {
                self.block_mut(addr.block)?.invalidate(addr.page, unit as u32);
            }
        }
        *tick += self.cpu.trim_internal_ns;
        Ok(())
    }

    // ── Victim selection & garbage collection ───────────────────────────────

    fn select_victim_blocks(&mut self, tick: &mut u64, except: &[BlockId]) -> Result<Vec<BlockId>> {
        let mut n_blocks = match self.config.gc_mode {
            GcMode::ReclaimFixed => self.config.gc_reclaim_blocks,
            GcMode::ReclaimThreshold => {
                let target = f64::from(self.geometry.total_physical_blocks)
                    * self.config.gc_reclaim_threshold;
                (target as i64 - self.pool.len() as i64).max(0) as u64
            }
        };
        if self.reclaim_more {
            n_blocks += u64::from(self.geometry.page_count_to_max_perf);
            self.reclaim_more = false;
        }

        let policy = self.config.gc_evict_policy;
        let mut weights = victim::calculate_weights(
            &self.used,
            policy,
            self.geometry.pages_in_block,
            &self.open_blocks,
            *tick,
        );

        if matches!(policy, EvictPolicy::Random | EvictPolicy::DChoice) {
            let want = if policy == EvictPolicy::Random {
                n_blocks
            } else {
                self.config.gc_d_choice_param.saturating_mul(n_blocks)
            };
            weights = victim::sample_candidates(&weights, want as usize, except, &mut self.rng);
        }
        victim::order_by_weight(&mut weights);

        let count = (n_blocks as usize).min(weights.len());
        let list = weights[..count].iter().map(|(id, _)| *id).collect();
        *tick += self.cpu.select_victim_ns;
        Ok(list)
    }

    /// Copy-forward every valid page out of `victims`, then erase them.
    ///
    /// Three PAL phases: all reads, then writes and erases in parallel
    /// starting when the reads finish.
    fn do_garbage_collection(&mut self, victims: &[BlockId], tick: &mut u64) -> Result<()> {
        if victims.is_empty() {
            return Ok(());
        }
        let entry_tick = *tick;
        let mut read_reqs: Vec<PalRequest> = Vec::new();
        let mut write_reqs: Vec<PalRequest> = Vec::new();
        let mut erase_reqs: Vec<PalRequest> = Vec::new();

        for &victim in victims {
            for page in 0..self.geometry.pages_in_block {
                let Some(info) = self.block_ref(victim)?.page_info(page) else {
                    continue;
                };
                let pal_flag = if self.random_tweak {
                    info.valid
                } else {
                    self.full_flag()
                };
                let dest = self.get_last_free_block(pal_flag, *tick)?;
                read_reqs.push(PalRequest {
                    block: victim,
                    page,
                    io_flag: pal_flag,
                });

                let units: Vec<u32> = info.valid.ones().filter(|&u| u < self.io_units).collect();
                for unit in units {
                    let lpn = info.lpns[unit as usize];
                    self.block_mut(victim)?.invalidate(page, unit);

                    if self.table.get(lpn).is_none() {
                        return Err(FtlError::MissingMapping { lpn: lpn.0 });
                    }
                    self.dram.read(
                        MAPPING_ENTRY_BYTES * u64::from(self.geometry.io_unit_in_page),
                        tick,
                    );

                    let new_page = {
                        let block = self.block_mut(dest)?;
                        let new_page = block.next_write_page_for(unit);
                        block.write(new_page, lpn, unit, *tick)?;
                        new_page
                    };
                    if let Some(entry) = self.table.get_mut(lpn) {
                        entry[unit as usize] = Some(PhysAddr {
                            block: dest,
                            page: new_page,
                        });
                    }
                    write_reqs.push(PalRequest {
                        block: dest,
                        page: new_page,
                        io_flag: self.unit_flag(unit),
                    });
                    self.stats.valid_page_copies += 1;
                }
                self.stats.valid_superpage_copies += 1;
            }
            erase_reqs.push(PalRequest {
                block: victim,
                page: 0,
                io_flag: self.full_flag(),
            });
        }

        let mut read_finished = entry_tick;
        let mut write_finished = entry_tick;
        let mut erase_finished = entry_tick;
        for req in &read_reqs {
            let mut begin = *tick;
            self.nand.read(req, &mut begin);
            read_finished = read_finished.max(begin);
        }
        for req in &write_reqs {
            let mut begin = read_finished;
            self.nand.write(req, &mut begin);
            write_finished = write_finished.max(begin);
        }
        for req in &erase_reqs {
            let mut begin = read_finished;
            self.erase_block(req.block, &mut begin)?;
            erase_finished = erase_finished.max(begin);
        }

        *tick = write_finished.max(erase_finished);
        *tick += self.cpu.gc_ns;
        Ok(())
    }

    /// Erase a drained block and route it back to the pool, or retire it
    /// once it crosses the bad-block threshold.
    fn erase_block(&mut self, id: BlockId, tick: &mut u64) -> Result<()> {
        let mut block = self
            .used
            .remove(&id)
            .ok_or(FtlError::BlockNotInUse { block: id.0 })?;
        if let Err(err) = block.erase() {
            self.used.insert(id, block);
            return Err(err);
        }
        let pal = PalRequest {
            block: id,
            page: 0,
            io_flag: self.full_flag(),
        };
        self.nand.erase(&pal, tick);

        let erase_count = block.erase_count();
        if erase_count < self.config.bad_block_threshold {
            self.pool.reinsert(block);
        } else {
            info!(
                target: "fsim::ftl",
                event = "block_retired",
                block = id.0,
                erase_count
            );
            self.retired_blocks += 1;
        }
        *tick += self.cpu.erase_internal_ns;
        Ok(())
    }

    // ── Refresh: write-path classification ──────────────────────────────────

    /// Insert a freshly written layer into every retention class whose
    /// horizon would push its predicted RBER past the ECC limit, plus the
    /// longest-horizon class unconditionally.
    fn classify_write(&mut self, block: BlockId, layer: u32) -> Result<()> {
        if self.filters.is_empty() || self.config.refresh_period_secs == 0 {
            return Ok(());
        }
        let classes = self.filters.len();
        self.set_refresh_period(block, layer, (classes - 1) as u32);

        let erase_count = self.block_ref(block)?.erase_count();
        let period = self.config.refresh_period_ns();
        for rtc in (0..classes - 1).rev() {
            let horizon = period.saturating_mul(1_u64 << rtc);
            let predicted = self.rber.rber(horizon, erase_count, layer);
            if predicted > self.config.ecc_rber_limit {
                self.set_refresh_period(block, layer, rtc as u32);
            }
        }
        Ok(())
    }

    /// Insert into filter `rtc` and keep the minimum class ever assigned to
    /// this layer in the refresh table.
    fn set_refresh_period(&mut self, block: BlockId, layer: u32, rtc: u32) {
        let key = layer_key(block, layer);
        match self.refresh_table.get_mut(&key) {
            None => {
                self.refresh_table.insert(key, rtc);
            }
            Some(existing) if *existing > rtc => *existing = rtc,
            Some(_) => {}
        }
        self.filters[rtc as usize].insert(key);
    }

    // ── Refresh: periodic sweep ─────────────────────────────────────────────

    #[must_use]
    pub fn is_refresh_event(&self, event: EventId) -> bool {
        self.refresh_event == Some(event)
    }

    /// One firing of the periodic refresh event: sweep the filter tier
    /// selected by the trailing-zero count of the call counter and rewrite
    /// every (block, layer) it reports, then reschedule.
    pub fn refresh_tick(&mut self, engine: &mut EventEngine, tick: &mut u64) -> Result<()> {
        if self.filters.is_empty() {
            return Ok(());
        }
        let fired_at = *tick;
        let classes = self.filters.len();
        let target = (self.stats.refresh_call_count.trailing_zeros() as usize).min(classes - 1);
        debug!(
            target: "fsim::ftl::refresh",
            event = "sweep",
            call = self.stats.refresh_call_count,
            filter = target,
            at = fired_at
        );

        let mut hits = 0_u64;
        for block in 0..self.geometry.total_physical_blocks {
            for layer in 0..WORDLINE_LAYERS {
                let key = layer_key(BlockId(block), layer);
                if self.filters[target].contains(key) {
                    match self.refresh_table.get(&key) {
                        Some(&rtc) if rtc as usize <= target => {
                            self.filters[target].note_true_positive();
                        }
                        _ => self.filters[target].note_false_positive(),
                    }
                    hits += 1;
                    self.refresh_page(BlockId(block), layer, tick)?;
                } else {
                    self.filters[target].note_true_negative();
                }
            }
        }
        self.stats.refresh_call_count += 1;
        self.stats.layer_check_count += hits;
        debug!(
            target: "fsim::ftl::refresh",
            event = "sweep_done",
            checked = hits,
            of = u64::from(self.geometry.total_physical_blocks) * u64::from(WORDLINE_LAYERS)
        );

        if let Some(event) = self.refresh_event {
            engine.schedule(event, fired_at + self.config.refresh_period_ns());
        }
        Ok(())
    }

    /// Copy-forward the valid sub-units of one (block, layer): pages
    /// `layer, layer + 64, …`. No erase; the block is not necessarily
    /// drained. A vanished block or moved mapping is a Bloom false positive
    /// and is skipped.
    fn refresh_page(&mut self, block: BlockId, layer: u32, tick: &mut u64) -> Result<()> {
        if self.free_block_ratio() < self.config.gc_threshold_ratio {
            let mut begin = *tick;
            let victims = self.select_victim_blocks(&mut begin, &[])?;
            debug!(
                target: "fsim::ftl::gc",
                event = "refresh_headroom",
                victims = victims.len()
            );
            self.do_garbage_collection(&victims, &mut begin)?;
            self.stats.gc_count += 1;
            self.stats.reclaimed_blocks += victims.len() as u64;
        }

        if !self.used.contains_key(&block) {
            debug!(
                target: "fsim::ftl::refresh",
                event = "stale_hit",
                block = block.0,
                layer,
                "block no longer in use, skipping"
            );
            return Ok(());
        }

        let entry_tick = *tick;
        let mut read_reqs: Vec<PalRequest> = Vec::new();
        let mut write_reqs: Vec<PalRequest> = Vec::new();

        let mut page = layer;
        while page < self.geometry.pages_in_block {
            if let Some(info) = self.block_ref(block)?.page_info(page) {
                let pal_flag = if self.random_tweak {
                    info.valid
                } else {
                    self.full_flag()
                };
                let dest = self.get_last_free_block(pal_flag, *tick)?;
                read_reqs.push(PalRequest {
                    block,
                    page,
                    io_flag: pal_flag,
                });

                let units: Vec<u32> = info.valid.ones().filter(|&u| u < self.io_units).collect();
                for unit in units {
                    let lpn = info.lpns[unit as usize];
                    // A moved or vanished mapping is a stale filter hit;
                    // leave the sub-unit untouched.
                    let points_back = self
                        .table
                        .get(lpn)
                        .map(|entry| entry[unit as usize] == Some(PhysAddr { block, page }));
                    if points_back != Some(true) {
                        continue;
                    }

                    self.block_mut(block)?.invalidate(page, unit);
                    self.dram.read(
                        MAPPING_ENTRY_BYTES * u64::from(self.geometry.io_unit_in_page),
                        tick,
                    );
                    let new_page = {
                        let dest_block = self.block_mut(dest)?;
                        let new_page = dest_block.next_write_page_for(unit);
                        dest_block.write(new_page, lpn, unit, *tick)?;
                        new_page
                    };
                    if let Some(entry) = self.table.get_mut(lpn) {
                        entry[unit as usize] = Some(PhysAddr {
                            block: dest,
                            page: new_page,
                        });
                    }
                    write_reqs.push(PalRequest {
                        block: dest,
                        page: new_page,
                        io_flag: self.unit_flag(unit),
                    });
                    self.stats.refresh_page_copies += 1;
                }
                self.stats.refresh_superpage_copies += 1;
            }
            page += WORDLINE_LAYERS;
        }

        let mut read_finished = entry_tick;
        let mut write_finished = entry_tick;
        for req in &read_reqs {
            let mut begin = *tick;
            self.nand.read(req, &mut begin);
            read_finished = read_finished.max(begin);
        }
        for req in &write_reqs {
            let mut begin = read_finished;
            self.nand.write(req, &mut begin);
            write_finished = write_finished.max(begin);
        }
        *tick = write_finished.max(read_finished);
        *tick += self.cpu.gc_ns;
        Ok(())
    }

    // ── Refresh: policy-driven whole blocks ─────────────────────────────────

    /// Refresh every block the configured policy selects right now.
    /// Returns the number of candidate blocks.
    pub fn run_policy_refresh(&mut self, tick: &mut u64) -> Result<usize> {
        let mut begin = *tick;
        let list = self.select_refresh_victims(&mut begin);
        let count = list.len();
        debug!(
            target: "fsim::ftl::refresh",
            event = "policy_refresh",
            candidates = count
        );
        self.do_refresh(list, &mut begin)?;
        if count > 0 {
            self.stats.refresh_count += 1;
            self.stats.refreshed_blocks += count as u64;
        }
        Ok(count)
    }

    fn select_refresh_victims(&mut self, tick: &mut u64) -> Vec<BlockId> {
        let now = *tick;
        let mut list: Vec<BlockId> = match self.config.refresh_policy {
            RefreshPolicy::RetentionThreshold => self
                .used
                .iter()
                .filter(|(_, block)| {
                    now.saturating_sub(block.last_written_at()) >= self.config.refresh_threshold_ns
                })
                .map(|(id, _)| *id)
                .collect(),
        };
        list.sort_unstable();
        *tick += self.cpu.select_victim_ns;
        list
    }

    /// Whole-block refresh: first drive GC until the free pool covers 1.5x
    /// the refresh list (dropping blocks GC already claimed), then
    /// copy-forward every valid page of each listed block without erasing.
    fn do_refresh(&mut self, mut list: Vec<BlockId>, tick: &mut u64) -> Result<()> {
        if list.is_empty() {
            return Ok(());
        }

        while (self.pool.len() as f64) < list.len() as f64 * 1.5 {
            let mut round = *tick;
            let victims = self.select_victim_blocks(&mut round, &[])?;
            if victims.is_empty() {
                // Nothing left to reclaim; proceed with what we have.
                break;
            }
            // A block GC will erase must not also be refreshed.
            list.retain(|b| !victims.contains(b));
            debug!(
                target: "fsim::ftl::gc",
                event = "refresh_headroom",
                victims = victims.len(),
                free = self.pool.len()
            );
            self.do_garbage_collection(&victims, &mut round)?;
            self.stats.gc_count += 1;
            self.stats.reclaimed_blocks += victims.len() as u64;
            *tick = (*tick).max(round);
            if list.is_empty() {
                return Ok(());
            }
        }

        let entry_tick = *tick;
        let mut read_reqs: Vec<PalRequest> = Vec::new();
        let mut write_reqs: Vec<PalRequest> = Vec::new();

        for &source in &list {
            for page in 0..self.geometry.pages_in_block {
                let Some(info) = self.block_ref(source)?.page_info(page) else {
                    continue;
                };
                let pal_flag = if self.random_tweak {
                    info.valid
                } else {
                    self.full_flag()
                };
                let dest = self.get_last_free_block(pal_flag, *tick)?;
                read_reqs.push(PalRequest {
                    block: source,
                    page,
                    io_flag: pal_flag,
                });

                let units: Vec<u32> = info.valid.ones().filter(|&u| u < self.io_units).collect();
                for unit in units {
                    let lpn = info.lpns[unit as usize];
                    self.block_mut(source)?.invalidate(page, unit);
                    if self.table.get(lpn).is_none() {
                        return Err(FtlError::MissingMapping { lpn: lpn.0 });
                    }
                    self.dram.read(
                        MAPPING_ENTRY_BYTES * u64::from(self.geometry.io_unit_in_page),
                        tick,
                    );
                    let new_page = {
                        let dest_block = self.block_mut(dest)?;
                        let new_page = dest_block.next_write_page_for(unit);
                        dest_block.write(new_page, lpn, unit, *tick)?;
                        new_page
                    };
                    if let Some(entry) = self.table.get_mut(lpn) {
                        entry[unit as usize] = Some(PhysAddr {
                            block: dest,
                            page: new_page,
                        });
                    }
                    write_reqs.push(PalRequest {
                        block: dest,
                        page: new_page,
                        io_flag: self.unit_flag(unit),
                    });
                    self.stats.refresh_page_copies += 1;
                }
                self.stats.refresh_superpage_copies += 1;
            }
        }

        let mut read_finished = entry_tick;
        let mut write_finished = entry_tick;
        for req in &read_reqs {
            let mut begin = *tick;
            self.nand.read(req, &mut begin);
            read_finished = read_finished.max(begin);
        }
        for req in &write_reqs {
            let mut begin = read_finished;
            self.nand.write(req, &mut begin);
            write_finished = write_finished.max(begin);
        }
        *tick = write_finished.max(entry_tick);
        *tick += self.cpu.gc_ns;
        Ok(())
    }

    // ── Accounting & statistics ─────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> &FtlStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Sum of valid and invalid (dirty) physical pages across used blocks.
    #[must_use]
    pub fn total_pages(&self) -> (u64, u64) {
        let mut valid = 0;
        let mut invalid = 0;
        for block in self.used.values() {
            valid += u64::from(block.valid_count());
            invalid += u64::from(block.dirty_count());
        }
        (valid, invalid)
    }

    /// Wear-leveling factor `(Σe)² / (n · Σe²)` over every block that has
    /// been erased at least once plus all in-use blocks; in (0, 1] with 1
    /// meaning perfectly uniform wear. Negative when nothing has worn yet.
    #[must_use]
    pub fn wear_leveling(&self) -> f64 {
        let mut total = 0_u64;
        let mut sum_squares = 0_u64;
        let mut contributing = 0_u64;
        for block in self.used.values() {
            let e = u64::from(block.erase_count());
            total += e;
            sum_squares += e * e;
            contributing += 1;
        }
        for block in self.pool.iter() {
            let e = u64::from(block.erase_count());
            if e == 0 {
                continue;
            }
            total += e;
            sum_squares += e * e;
            contributing += 1;
        }
        if sum_squares == 0 {
            return -1.0;
        }
        (total as f64) * (total as f64) / (contributing as f64 * sum_squares as f64)
    }

    /// Mean of per-block maximum observed error counts.
    #[must_use]
    pub fn average_error_count(&self) -> f64 {
        if self.used.is_empty() {
            return 0.0;
        }
        let total: u64 = self.used.values().map(Block::max_error_count).sum();
        total as f64 / self.used.len() as f64
    }

    #[must_use]
    pub fn bloom_filters(&self) -> &[BloomFilter] {
        &self.filters
    }

    /// Exported statistics as name/description/value triples.
    #[must_use]
    pub fn stat_list(&self, prefix: &str) -> Vec<StatEntry> {
        let s = &self.stats;
        let mut list = vec![
            StatEntry::new(
                format!("{prefix}page_mapping.gc.count"),
                "Total GC count",
                s.gc_count as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.gc.reclaimed_blocks"),
                "Total reclaimed blocks in GC",
                s.reclaimed_blocks as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.gc.superpage_copies"),
                "Total copied valid superpages during GC",
                s.valid_superpage_copies as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.gc.page_copies"),
                "Total copied valid pages during GC",
                s.valid_page_copies as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.refresh.count"),
                "Total refresh count",
                s.refresh_count as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.refresh.refreshed_blocks"),
                "Total blocks refreshed",
                s.refreshed_blocks as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.refresh.superpage_copies"),
                "Total copied valid superpages during refresh",
                s.refresh_superpage_copies as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.refresh.page_copies"),
                "Total copied valid pages during refresh",
                s.refresh_page_copies as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.refresh.call_count"),
                "Number of refresh scheduler firings",
                s.refresh_call_count as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.refresh.layer_check_count"),
                "Number of layer filter hits swept",
                s.layer_check_count as f64,
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.refresh.error_counts"),
                "Mean observed per-block max error count",
                self.average_error_count(),
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.wear_leveling"),
                "Wear-leveling factor",
                self.wear_leveling(),
            ),
            StatEntry::new(
                format!("{prefix}page_mapping.free_block_count"),
                "Number of free blocks left",
                self.pool.len() as f64,
            ),
        ];
        for (i, filter) in self.filters.iter().enumerate() {
            list.push(StatEntry::new(
                format!("{prefix}page_mapping.bloom_filter.{i}.elements"),
                "Number of keys inserted into this filter",
                filter.counters().insertions as f64,
            ));
        }
        list
    }

    // ── Introspection for tests and debugging ───────────────────────────────

    #[must_use]
    pub fn used_block(&self, id: BlockId) -> Option<&Block> {
        self.used.get(&id)
    }

    #[must_use]
    pub fn mapping(&self, lpn: Lpn) -> Option<&[Option<PhysAddr>]> {
        self.table.get(lpn)
    }

    /// (min, max) erase count over every block still owned by the FTL.
    #[must_use]
    pub fn erase_count_range(&self) -> (u32, u32) {
        let mut min = u32::MAX;
        let mut max = 0;
        for block in self.used.values().chain(self.pool.iter()) {
            min = min.min(block.erase_count());
            max = max.max(block.erase_count());
        }
        if min == u32::MAX {
            (0, 0)
        } else {
            (min, max)
        }
    }

    /// Check every structural invariant of the core; returns a description
    /// of the first violation found.
    pub fn validate_invariants(&self) -> std::result::Result<(), String> {
        let capacity = self.geometry.pages_in_block * self.geometry.io_unit_in_page;

        if !self.pool.is_sorted() {
            return Err("free pool not sorted by erase count".into());
        }
        let accounted = self.used.len() + self.pool.len() + self.retired_blocks as usize;
        if accounted != self.geometry.total_physical_blocks as usize {
            return Err(format!(
                "block accounting broken: {} used + {} free + {} retired != {}",
                self.used.len(),
                self.pool.len(),
                self.retired_blocks,
                self.geometry.total_physical_blocks
            ));
        }
        for block in self.pool.iter() {
            if self.used.contains_key(&block.id()) {
                return Err(format!("block {} in both pool and used set", block.id()));
            }
            if block.valid_count() != 0 {
                return Err(format!("free block {} holds valid pages", block.id()));
            }
        }
        for (id, block) in &self.used {
            if block.valid_count() + block.dirty_count() > capacity {
                return Err(format!("block {id} exceeds sub-page capacity"));
            }
        }

        // Mapping -> block backpointers.
        for (lpn, entry) in self.table.iter() {
            for (unit, slot) in entry.iter().enumerate() {
                let Some(addr) = slot else { continue };
                let Some(block) = self.used.get(&addr.block) else {
                    return Err(format!("lpn {lpn} maps to free/retired block {}", addr.block));
                };
                if !block.is_valid(addr.page, unit as u32) {
                    return Err(format!(
                        "lpn {lpn} unit {unit} maps to invalid sub-page {}",
                        addr
                    ));
                }
                if block.lpn_at(addr.page, unit as u32) != lpn {
                    return Err(format!(
                        "backpointer mismatch at {} unit {unit}: expected lpn {lpn}",
                        addr
                    ));
                }
            }
        }

        // Valid sub-pages -> mapping entries.
        for (id, block) in &self.used {
            for page in 0..self.geometry.pages_in_block {
                for unit in 0..self.io_units {
                    if !block.is_valid(page, unit) {
                        continue;
                    }
                    let lpn = block.lpn_at(page, unit);
                    let Some(entry) = self.table.get(lpn) else {
                        return Err(format!(
                            "valid sub-page ({id}, {page}, {unit}) has no mapping for lpn {lpn}"
                        ));
                    };
                    if entry[unit as usize] != Some(PhysAddr { block: *id, page }) {
                        return Err(format!(
                            "mapping for lpn {lpn} unit {unit} does not point back to ({id}, {page})"
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
