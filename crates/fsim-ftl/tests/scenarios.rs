//! End-to-end scenarios: warmup, invalidation, GC, trim, refresh sweep and
//! wear-leveling, each driven through the public host interface.

use fsim_ftl::{
    DeviceGeometry, EvictPolicy, FillingMode, FtlConfig, GcMode, HostRequest, PageMapping,
    SimConfig,
};
use fsim_nand::EventEngine;
use fsim_types::{IoBitmap, Lpn, LpnRange};

fn geometry(phys: u32, logical: u32) -> DeviceGeometry {
    DeviceGeometry {
        pages_in_block: 64,
        io_unit_in_page: 1,
        page_size: 4_096,
        total_physical_blocks: phys,
        total_logical_blocks: logical,
        page_count_to_max_perf: 2,
    }
}

fn config() -> FtlConfig {
    FtlConfig {
        fill_ratio: 0.5,
        invalid_page_ratio: 0.0,
        filling_mode: FillingMode::Sequential,
        gc_threshold_ratio: 0.2,
        gc_reclaim_threshold: 0.4,
        gc_mode: GcMode::ReclaimThreshold,
        gc_evict_policy: EvictPolicy::Greedy,
        random_seed: 42,
        refresh_period_secs: 0,
        ..FtlConfig::default()
    }
}

fn full_flag() -> IoBitmap {
    IoBitmap::full(1).unwrap()
}

fn build(geometry: DeviceGeometry, ftl: FtlConfig) -> PageMapping {
    PageMapping::from_sim_config(&SimConfig {
        geometry,
        ftl,
        ..SimConfig::default()
    })
    .unwrap()
}

fn write(ftl: &mut PageMapping, lpn: u64, tick: &mut u64) {
    ftl.write(
        &HostRequest {
            lpn: Lpn(lpn),
            io_flag: full_flag(),
        },
        tick,
    )
    .unwrap();
}

#[test]
fn sequential_warmup_fills_half_the_device() {
    let mut ftl = build(geometry(16, 8), config());
    let mut engine = EventEngine::new();
    let report = ftl.initialize(&mut engine).unwrap();

    assert_eq!(report.valid_pages, 256);
    assert_eq!(report.invalid_pages, 0);
    assert_eq!(report.target_valid, 256);

    let status = ftl.status(0, u64::MAX);
    assert_eq!(status.mapped_logical_pages, 256);
    assert_eq!(status.total_logical_pages, 512);
    assert_eq!(ftl.stats().gc_count, 0);
    ftl.validate_invariants().unwrap();
}

#[test]
fn sequential_rewrites_invalidate_old_locations_without_gc() {
    let mut ftl = build(geometry(16, 8), config());
    let mut engine = EventEngine::new();
    ftl.initialize(&mut engine).unwrap();

    let mut tick = 0;
    for lpn in 0..128 {
        write(&mut ftl, lpn, &mut tick);
    }
    let (valid, invalid) = ftl.total_pages();
    assert_eq!(valid, 256);
    assert_eq!(invalid, 128);
    assert_eq!(ftl.stats().gc_count, 0);
    ftl.validate_invariants().unwrap();
}

#[test]
fn sustained_writes_trigger_gc_and_recycle_blocks() {
    let cfg = FtlConfig {
        gc_threshold_ratio: 0.3,
        ..config()
    };
    let mut ftl = build(geometry(10, 8), cfg);
    let mut engine = EventEngine::new();
    ftl.initialize(&mut engine).unwrap();

    let mut tick = 0;
    let mut lpn = 0_u64;
    for _ in 0..3_000 {
        write(&mut ftl, lpn % 512, &mut tick);
        lpn += 1;
        if ftl.stats().gc_count >= 1 {
            break;
        }
    }
    assert!(ftl.stats().gc_count >= 1, "GC never fired");
    assert!(ftl.stats().reclaimed_blocks >= 1);

    // Reclaimed blocks came back with their erase counts bumped.
    let (_, max_erase) = ftl.erase_count_range();
    assert!(max_erase >= 1);
    assert!(ftl.free_blocks() > 0);
    ftl.validate_invariants().unwrap();
}

#[test]
fn trim_unmaps_a_logical_page() {
    let mut ftl = build(geometry(16, 8), config());
    let mut engine = EventEngine::new();
    ftl.initialize(&mut engine).unwrap();

    let mut tick = 0;
    write(&mut ftl, 42, &mut tick);
    let before = ftl.status(0, u64::MAX).mapped_logical_pages;

    ftl.trim(
        &HostRequest {
            lpn: Lpn(42),
            io_flag: full_flag(),
        },
        &mut tick,
    )
    .unwrap();
    let after = ftl.status(0, u64::MAX).mapped_logical_pages;
    assert_eq!(after, before - 1);
    ftl.validate_invariants().unwrap();
}

#[test]
fn format_reclaims_exactly_the_covered_range() {
    let mut ftl = build(geometry(16, 8), config());
    let mut engine = EventEngine::new();
    ftl.initialize(&mut engine).unwrap();

    let mut tick = 0;
    ftl.format(LpnRange::new(0, 128), &mut tick).unwrap();
    let status = ftl.status(0, u64::MAX);
    assert_eq!(status.mapped_logical_pages, 128);
    ftl.validate_invariants().unwrap();
}

#[test]
fn refresh_sweep_rewrites_classified_layers_on_the_fourth_firing() {
    // With the default error model, a fresh device never crosses the ECC
    // limit at the tested horizons, so every write classifies only into the
    // longest-horizon filter (index 2). Its tier is due when the call
    // counter gains two trailing zero bits.
    let cfg = FtlConfig {
        fill_ratio: 0.0,
        refresh_period_secs: 400,
        refresh_filter_num: 3,
        ..config()
    };
    let mut ftl = build(geometry(16, 8), cfg);
    let mut engine = EventEngine::new();
    ftl.initialize(&mut engine).unwrap();
    assert_eq!(engine.pending(), 1);

    let mut tick = 0;
    for lpn in 0..64 {
        write(&mut ftl, lpn, &mut tick);
    }

    // Firings 1-3 sweep filters 0, 1, 0: all empty.
    for _ in 0..3 {
        ftl.refresh_tick(&mut engine, &mut tick).unwrap();
    }
    assert_eq!(ftl.stats().refresh_page_copies, 0);
    assert_eq!(ftl.stats().layer_check_count, 0);

    // Firing 4 (ctz = 2) sweeps filter 2 and copies the layers forward.
    ftl.refresh_tick(&mut engine, &mut tick).unwrap();
    assert!(ftl.stats().refresh_page_copies > 0);
    assert!(ftl.stats().layer_check_count > 0);
    assert_eq!(ftl.stats().refresh_call_count, 5);
    ftl.validate_invariants().unwrap();
}

#[test]
fn warmup_clamps_excess_invalidation() {
    let cfg = FtlConfig {
        fill_ratio: 0.9,
        invalid_page_ratio: 0.9,
        ..config()
    };
    let mut ftl = build(geometry(16, 8), cfg);
    let mut engine = EventEngine::new();
    let report = ftl.initialize(&mut engine).unwrap();

    // headroom = 64 * (16 * 0.8 - 2) = 691 pages; fill takes 460 of them.
    assert_eq!(report.target_valid, 460);
    assert_eq!(report.target_invalid, 231);
    assert_eq!(report.valid_pages, 460);
    assert_eq!(report.invalid_pages, 231);
    assert_eq!(ftl.stats().gc_count, 0);
    ftl.validate_invariants().unwrap();
}

#[test]
fn wear_stays_uniform_across_gc_cycles() {
    let cfg = FtlConfig {
        gc_reclaim_threshold: 0.3,
        ..config()
    };
    let mut ftl = build(geometry(10, 4), cfg);
    let mut engine = EventEngine::new();
    ftl.initialize(&mut engine).unwrap();

    let mut tick = 0;
    for i in 0..4_000_u64 {
        write(&mut ftl, i % 256, &mut tick);
    }
    assert!(ftl.stats().gc_count >= 1);

    let wl = ftl.wear_leveling();
    assert!(wl > 0.0 && wl <= 1.0, "wear-leveling factor {wl} out of (0, 1]");
    let (min_erase, max_erase) = ftl.erase_count_range();
    assert!(
        max_erase - min_erase <= 8,
        "erase spread {min_erase}..{max_erase} too wide"
    );
    ftl.validate_invariants().unwrap();
}
