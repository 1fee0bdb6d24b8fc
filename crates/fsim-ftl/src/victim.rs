//! Victim weight computation and candidate sampling for GC.

use crate::block::Block;
use crate::config::EvictPolicy;
use fsim_types::BlockId;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;

/// Per-block weight under the configured policy; lower is a better victim.
///
/// Only full blocks qualify, and blocks currently open for writes are
/// excluded (erasing an open write target would corrupt the allocator
/// window).
pub(crate) fn calculate_weights(
    used: &HashMap<BlockId, Block>,
    policy: EvictPolicy,
    pages_in_block: u32,
    open_blocks: &[BlockId],
    now: u64,
) -> Vec<(BlockId, f64)> {
    let mut weights: Vec<(BlockId, f64)> = used
        .iter()
        .filter(|(id, block)| block.is_full() && !open_blocks.contains(id))
        .map(|(id, block)| {
            let weight = match policy {
                EvictPolicy::Greedy | EvictPolicy::Random | EvictPolicy::DChoice => {
                    f64::from(block.valid_count())
                }
                EvictPolicy::CostBenefit => {
                    let u = f64::from(block.valid_count()) / f64::from(pages_in_block);
                    let age = now.saturating_sub(block.last_accessed_at()).max(1) as f64;
                    u / ((1.0 - u) * age)
                }
            };
            (*id, weight)
        })
        .collect();
    // Deterministic base order regardless of hash-map iteration.
    weights.sort_unstable_by_key(|(id, _)| *id);
    weights
}

/// Draw `want` distinct candidates uniformly, skipping `except`, clamped to
/// the available population.
pub(crate) fn sample_candidates(
    weights: &[(BlockId, f64)],
    want: usize,
    except: &[BlockId],
    rng: &mut StdRng,
) -> Vec<(BlockId, f64)> {
    let mut remaining: Vec<(BlockId, f64)> = weights
        .iter()
        .filter(|(id, _)| !except.contains(id))
        .copied()
        .collect();
    let want = want.min(remaining.len());
    let mut selected = Vec::with_capacity(want);
    while selected.len() < want {
        let idx = rng.gen_range(0..remaining.len());
        selected.push(remaining.swap_remove(idx));
    }
    selected
}

/// Order victims best-first: ascending weight, block id breaking ties.
pub(crate) fn order_by_weight(weights: &mut [(BlockId, f64)]) {
    weights.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}
