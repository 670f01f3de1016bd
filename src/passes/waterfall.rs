//! Waterfall loop insertion pass.

use crate::cf::unstructured::LoopFinder;
use crate::target::RegClassInfo;
use crate::waterfall::lower::LoweredRegion;
use crate::waterfall::{WaterfallConfig, WaterfallError, collect, lower};
use crate::{Block, FuncBody};
use smallvec::SmallVec;

/// Replace every waterfall region in `func` with a waterfall loop, returning
/// `true` iff there were any regions (i.e. iff `func` changed).
///
/// Panics if the markers in `func` are malformed (see [`WaterfallError`]),
/// use [`try_insert_waterfall_loops`] to handle that case instead.
pub fn insert_waterfall_loops(
    func: &mut FuncBody,
    target: &impl RegClassInfo,
    config: &WaterfallConfig,
) -> bool {
    match try_insert_waterfall_loops(func, target, config) {
        Ok(changed) => changed,
        Err(e) => panic!("insert_waterfall_loops: {e}"),
    }
}

/// Like [`insert_waterfall_loops`], but returning an error on malformed
/// markers, in which case `func` is left unmodified.
pub fn try_insert_waterfall_loops(
    func: &mut FuncBody,
    target: &impl RegClassInfo,
    config: &WaterfallConfig,
) -> Result<bool, WaterfallError> {
    // NOTE: everything is collected before any lowering, so that errors
    // are reported with `func` left untouched.
    let mut regions_per_block = SmallVec::<[_; 4]>::new();
    for func_at_block in func.at(func.layout) {
        let regions = collect::collect_regions(func_at_block, config)?;
        if !regions.is_empty() {
            regions_per_block.push((func_at_block.position, regions));
        }
    }

    if regions_per_block.is_empty() {
        return Ok(false);
    }

    log::trace!("before waterfall loop insertion:\n{func}");

    let mut lowered = SmallVec::<[_; 4]>::new();
    for (block, regions) in regions_per_block {
        let mut header = block;
        for region in &regions {
            let lowered_region = lower::lower_region(func, target, header, region);
            lowered.push((header, lowered_region));
            header = lowered_region.remainder;
        }
    }

    log::trace!("after waterfall loop insertion:\n{func}");

    if cfg!(debug_assertions) {
        verify_loops(func, &lowered);
    }

    Ok(true)
}

/// Check that every (reachable) loop block is entered only from its header
/// (or itself), and exits only into its remainder.
fn verify_loops(func: &FuncBody, lowered: &[(Block, LoweredRegion)]) {
    let Some(entry) = func.entry_block() else {
        return;
    };
    let preds = func.predecessors();
    let loops = LoopFinder::new(func).find_all_loops_starting_at(entry);

    for &(header, LoweredRegion { loop_block, remainder }) in lowered {
        let Some(loop_preds) = preds.get(&loop_block) else {
            continue;
        };
        assert!(
            loop_preds.iter().all(|&pred| pred == header || pred == loop_block),
            "waterfall loop {loop_block:?} entered from outside {header:?}: {loop_preds:?}"
        );

        let exits = loops.get(&loop_block).map(|exits| exits.iter().copied().collect::<Vec<_>>());
        assert_eq!(
            exits,
            Some(vec![remainder]),
            "waterfall loop {loop_block:?} must only exit into {remainder:?}"
        );
    }
}
