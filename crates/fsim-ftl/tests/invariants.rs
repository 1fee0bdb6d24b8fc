//! Structural invariants under randomized workloads.
//!
//! Drives the core with arbitrary interleavings of full writes, sub-page
//! writes and trims, re-checking after every operation that the mapping
//! table, block bitmaps, free pool and accounting all agree.

use fsim_ftl::{
    DeviceGeometry, EvictPolicy, FillingMode, FtlConfig, GcMode, HostRequest, PageMapping,
    SimConfig,
};
use fsim_nand::EventEngine;
use fsim_types::{IoBitmap, Lpn, LpnRange};
use proptest::prelude::*;

const LOGICAL_PAGES: u64 = 6 * 16;

fn build(seed: u64) -> PageMapping {
    let geometry = DeviceGeometry {
        pages_in_block: 16,
        io_unit_in_page: 2,
        page_size: 4_096,
        total_physical_blocks: 12,
        total_logical_blocks: 6,
        page_count_to_max_perf: 2,
    };
    let ftl = FtlConfig {
        fill_ratio: 0.25,
        invalid_page_ratio: 0.0,
        filling_mode: FillingMode::Sequential,
        gc_threshold_ratio: 0.2,
        gc_reclaim_threshold: 0.3,
        gc_mode: GcMode::ReclaimThreshold,
        gc_evict_policy: EvictPolicy::Greedy,
        random_seed: seed,
        refresh_period_secs: 0,
        ..FtlConfig::default()
    };
    PageMapping::from_sim_config(&SimConfig {
        geometry,
        ftl,
        ..SimConfig::default()
    })
    .unwrap()
}

#[derive(Debug, Clone, Copy)]
enum Op {
    WriteFull(u64),
    WriteSub(u64, u32),
    Trim(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..LOGICAL_PAGES).prop_map(Op::WriteFull),
        (0..LOGICAL_PAGES, 0..2_u32).prop_map(|(lpn, unit)| Op::WriteSub(lpn, unit)),
        (0..LOGICAL_PAGES).prop_map(Op::Trim),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn invariants_hold_under_random_workloads(
        ops in prop::collection::vec(op_strategy(), 1..100),
        seed in 0_u64..1_000,
    ) {
        let mut ftl = build(seed);
        let mut engine = EventEngine::new();
        ftl.initialize(&mut engine).unwrap();
        ftl.validate_invariants().unwrap();

        let mut tick = 0;
        for op in ops {
            match op {
                Op::WriteFull(lpn) => {
                    let req = HostRequest {
                        lpn: Lpn(lpn),
                        io_flag: IoBitmap::full(2).unwrap(),
                    };
                    ftl.write(&req, &mut tick).unwrap();
                }
                Op::WriteSub(lpn, unit) => {
                    let mut io_flag = IoBitmap::new(2).unwrap();
                    io_flag.set(unit);
                    let req = HostRequest { lpn: Lpn(lpn), io_flag };
                    ftl.write(&req, &mut tick).unwrap();
                }
                Op::Trim(lpn) => {
                    let req = HostRequest {
                        lpn: Lpn(lpn),
                        io_flag: IoBitmap::full(2).unwrap(),
                    };
                    ftl.trim(&req, &mut tick).unwrap();
                }
            }
            if let Err(violation) = ftl.validate_invariants() {
                prop_assert!(false, "after {op:?}: {violation}");
            }
        }

        // A format at the end must leave the structures consistent too.
        ftl.format(LpnRange::new(0, LOGICAL_PAGES / 2), &mut tick).unwrap();
        ftl.validate_invariants().unwrap();
        prop_assert_eq!(
            ftl.status(0, LOGICAL_PAGES / 2).mapped_logical_pages,
            0
        );
    }

    #[test]
    fn reads_after_writes_always_resolve(
        lpns in prop::collection::vec(0..LOGICAL_PAGES, 1..40),
        seed in 0_u64..1_000,
    ) {
        let mut ftl = build(seed);
        let mut engine = EventEngine::new();
        ftl.initialize(&mut engine).unwrap();

        let mut tick = 0;
        let io_flag = IoBitmap::full(2).unwrap();
        for &lpn in &lpns {
            ftl.write(&HostRequest { lpn: Lpn(lpn), io_flag }, &mut tick).unwrap();
        }
        for &lpn in &lpns {
            let before = tick;
            ftl.read(&HostRequest { lpn: Lpn(lpn), io_flag }, &mut tick).unwrap();
            // A mapped read always pays NAND latency on top of CPU cost.
            prop_assert!(tick > before);
            prop_assert!(ftl.mapping(Lpn(lpn)).is_some());
        }
    }
}
