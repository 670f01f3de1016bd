//! Replacing a [`WaterfallRegion`] with a waterfall loop.
//!
//! The block containing the region (the "header") is split in three:
//!
//! ```text
//! header:
//!     ...                                   (everything before `waterfall_begin`)
//!     %init = v_mov_b32 0                   (per `waterfall_end`, chunked)
//!     %tmp_exec = implicit_def
//!     %save_exec = s_mov_b64 exec
//! loop:                                     (successors: loop, remainder)
//!     %merged = phi %init, header, %dst, loop        (per `waterfall_end`)
//!     %phi_exec = phi %tmp_exec, header, %new_exec, loop
//!     %cur_idx = v_readfirstlane_b32 %idx             (chunked)
//!     %rfl_dst = v_readfirstlane_b32 %rfl_src         (per non-index `waterfall_readfirstlane`)
//!     %cond = v_cmp_eq_u32 %cur_idx, %idx             (chunked, then `s_and_b64`-reduced)
//!     %new_exec = s_and_saveexec_b64 killed %cond
//!     ...                                   (region body, up to and excluding `final`)
//!     %dst = v_or_b32 %merged, %src                   (per `waterfall_end`, chunked)
//!     final
//!     exec = s_xor_b64 exec, %new_exec
//!     s_cbranch_execnz loop
//! remainder:                                (original successors of header)
//!     exec = s_mov_b64 %save_exec
//!     ...                                   (everything after `final`)
//! ```

use crate::build::InstBuilder;
use crate::target::{RegClassInfo, Wave64};
use crate::transform::{InnerTransform as _, Transformed, Transformer};
use crate::waterfall::{Marker, WaterfallRegion};
use crate::{Block, EntityListIter, FuncBody, Inst, Reg, RegClass, RegOperand, SubReg, VReg};
use arrayvec::ArrayVec;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// Per-`waterfall_end` registers.
#[derive(Copy, Clone, Debug)]
struct Accumulator {
    /// Zero, for the first iteration.
    init: VReg,

    /// The `waterfall_end` destination, written once per iteration (and only
    /// complete after the last one).
    dst: VReg,

    /// Loop-carried value of `dst` (i.e. its value from the previous iteration).
    merged: VReg,

    /// The `waterfall_end` source, computed by the region body.
    src: VReg,
}

/// The blocks [`lower_region`] splits off its header.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LoweredRegion {
    /// The (single-block) waterfall loop, only entered from the header.
    pub loop_block: Block,

    /// Everything that came after the region, which is where any later
    /// regions from the same original block now are.
    pub remainder: Block,
}

/// Lower `region` (found in `header`) to a waterfall loop.
pub fn lower_region(
    func: &mut FuncBody,
    target: &impl RegClassInfo,
    header: Block,
    region: &WaterfallRegion,
) -> LoweredRegion {
    let WaterfallRegion {
        token,
        begin,
        ref read_first_lanes,
        ref ends,
        ref last_uses,
        final_inst,
    } = *region;

    log::debug!(
        "lowering waterfall region {token:?} in {header:?} ({begin:?}..={final_inst:?}, \
         {} readfirstlane, {} end, {} last_use)",
        read_first_lanes.len(),
        ends.len(),
        last_uses.len()
    );

    let marker = |func: &FuncBody, inst: Inst| {
        let marker = func.insts[inst]
            .waterfall_marker()
            .unwrap_or_else(|| unreachable!("{inst:?} is not a waterfall marker"));
        let value = marker.value();
        let value_chunks = match value.sub_reg {
            Some(_) => 1,
            None => target.chunk_count(func.reg_class(value.reg)),
        };
        debug_assert_eq!(
            marker.width().chunks(),
            value_chunks,
            "{inst:?}: `{}` width doesn't match its operand",
            marker.kind().name()
        );
        marker
    };

    // `waterfall_last_use` is only a copy, which can be removed right away
    // (which also makes all other markers use its source directly).
    for &last_use in last_uses {
        match marker(func, last_use) {
            Marker::LastUse { src, dst, .. } => func.replace_reg(dst.into(), src.into()),
            other => unreachable!("expected `waterfall_last_use`, found {other:?}"),
        }
    }

    let idx = match marker(func, begin) {
        Marker::Begin { idx, .. } => RegOperand { is_kill: false, ..idx },
        other => unreachable!("expected `waterfall_begin`, found {other:?}"),
    };

    // Header: accumulator initialization, and `exec` bookkeeping.
    let accumulators: SmallVec<[Accumulator; 2]> = ends
        .iter()
        .map(|&end| {
            let (src, dst) = match marker(func, end) {
                Marker::End { src, dst, .. } => (src, dst),
                other => unreachable!("expected `waterfall_end`, found {other:?}"),
            };
            let class = func.reg_class(dst.into());
            let init = func.create_vreg(class);
            let merged = func.create_vreg(class);
            init_reg(&mut func.build_before(header, begin), target, init, 0);
            Accumulator { init, dst, merged, src }
        })
        .collect();

    let save_exec = func.create_vreg(RegClass::LaneMask);
    let tmp_exec = func.create_vreg(RegClass::LaneMask);
    {
        let mut b = func.build_before(header, begin);
        b.implicit_def(tmp_exec);
        b.s_mov_b64(save_exec.into(), Reg::Exec);
    }

    // Split the header, moving the region body into its own loop block.
    let loop_block = func.insert_block_after(header);
    let remainder = func.insert_block_after(loop_block);

    let moved_insts: FxHashSet<Inst> = func
        .at(EntityListIter { first: Some(begin), last: Some(final_inst) })
        .map(|func_at_inst| func_at_inst.position)
        .collect();
    func.move_insts_after(header, final_inst, remainder);
    func.move_inst_range(header, begin, final_inst, loop_block);

    func.transfer_successors(header, remainder);
    func.blocks[header].succs = [loop_block].into_iter().collect();
    func.blocks[loop_block].succs = [loop_block, remainder].into_iter().collect();

    LoopBodyRewrite {
        end_dst_to_merged: accumulators.iter().map(|acc| (acc.dst, acc.merged)).collect(),
    }
    .in_place_transform_block_def(func.at_mut(loop_block));

    // Loop entry: merges, and selecting the index value for this iteration.
    let phi_exec = func.create_vreg(RegClass::LaneMask);
    let new_exec = func.create_vreg(RegClass::LaneMask);
    let current_idx = func.create_vreg(target.uniform_class_of(func.reg_class(idx.reg)));
    {
        let mut b = func.build_before(loop_block, begin);
        for acc in &accumulators {
            b.phi(acc.merged, [(acc.init, header), (acc.dst, loop_block)]);
        }
        b.phi(phi_exec, [(tmp_exec, header), (new_exec, loop_block)]);
        read_first_lane(&mut b, target, current_idx, idx);
    }

    for &rfl in read_first_lanes {
        let (src, dst) = match marker(func, rfl) {
            Marker::ReadFirstLane { src, dst, .. } => (src, dst),
            other => unreachable!("expected `waterfall_readfirstlane`, found {other:?}"),
        };
        if src.reg == idx.reg {
            func.replace_reg(dst.into(), current_idx.into());
        } else {
            let src = RegOperand { is_kill: false, ..src };
            read_first_lane(&mut func.build_before(loop_block, begin), target, dst, src);
        }
    }

    {
        let mut b = func.build_before(loop_block, begin);
        let cond = compare_idx(&mut b, target, current_idx, idx);
        b.s_and_saveexec_b64(new_exec, RegOperand::read(cond).killed());
        func.set_reg_hint(new_exec, cond);
    }

    // Loop exit: merging into `waterfall_end` destinations, and turning off
    // the lanes this iteration took care of.
    for acc in &accumulators {
        let mut b = func.build_before(loop_block, final_inst);
        or_reg(&mut b, target, acc.dst, acc.merged, acc.src);
    }
    {
        let mut b = func.build_at_end(loop_block);
        b.s_xor_b64(Reg::Exec, Reg::Exec, new_exec.into());
        b.s_cbranch_execnz(loop_block);
    }

    func.build_at_start(remainder).s_mov_b64(Reg::Exec, save_exec.into());

    let markers = [begin].into_iter().chain(
        read_first_lanes.iter().chain(ends).chain(last_uses).copied(),
    );
    for inst in markers {
        let block = if moved_insts.contains(&inst) { loop_block } else { remainder };
        func.remove_inst(block, inst);
    }

    LoweredRegion { loop_block, remainder }
}

/// Clears kill flags (as the loop can read the same value again), and replaces
/// `waterfall_end` destinations with their loop-carried merged values.
struct LoopBodyRewrite {
    end_dst_to_merged: SmallVec<[(VReg, VReg); 2]>,
}

impl Transformer for LoopBodyRewrite {
    fn transform_reg(&mut self, reg: Reg) -> Transformed<Reg> {
        let merged = self.end_dst_to_merged.iter().find(|&&(dst, _)| reg == Reg::Virt(dst));
        match merged {
            Some(&(_, merged)) => Transformed::Changed(merged.into()),
            None => Transformed::Unchanged,
        }
    }

    fn transform_reg_operand(&mut self, reg_operand: &RegOperand) -> Transformed<RegOperand> {
        let renamed = reg_operand.inner_transform_with(self);
        if !reg_operand.is_kill {
            return renamed;
        }
        let mut new = *reg_operand;
        renamed.apply_to(&mut new);
        Transformed::Changed(RegOperand { is_kill: false, ..new })
    }
}

/// Up to [`Wave64::MAX_CHUNKS`] single-chunk registers, with their [`SubReg`]s.
type Chunks = ArrayVec<(VReg, SubReg), { Wave64::MAX_CHUNKS as usize }>;

/// `dst = imm` (in every chunk).
fn init_reg(b: &mut InstBuilder<'_>, target: &impl RegClassInfo, dst: VReg, imm: i64) {
    let class = b.reg_class(dst);
    let chunk_count = target.chunk_count(class);
    if chunk_count == 1 {
        b.v_mov_b32(dst, imm);
        return;
    }

    let chunk_class = target.chunk_class_of(class);
    let chunks: Chunks = (0..chunk_count)
        .map(|i| {
            let chunk = b.new_vreg(chunk_class);
            b.v_mov_b32(chunk, imm);
            (chunk, target.sub_reg(i))
        })
        .collect();
    b.reg_sequence(dst, chunks);
}

/// `dst = merged | src` (chunk by chunk).
fn or_reg(b: &mut InstBuilder<'_>, target: &impl RegClassInfo, dst: VReg, merged: VReg, src: VReg) {
    let class = b.reg_class(dst);
    let chunk_count = target.chunk_count(class);
    if chunk_count == 1 {
        b.v_or_b32(dst, RegOperand::read(merged), RegOperand::read(src));
        return;
    }

    let chunk_class = target.chunk_class_of(class);
    let chunks: Chunks = (0..chunk_count)
        .map(|i| {
            let sub_reg = target.sub_reg(i);
            let chunk = b.new_vreg(chunk_class);
            b.v_or_b32(
                chunk,
                RegOperand::read(merged).with_sub_reg(sub_reg),
                RegOperand::read(src).with_sub_reg(sub_reg),
            );
            (chunk, sub_reg)
        })
        .collect();
    b.reg_sequence(dst, chunks);
}

/// `dst = src` (from the first active lane, chunk by chunk), with the width
/// taken from `dst`, and any `undef` on `src` applying to every chunk.
fn read_first_lane(
    b: &mut InstBuilder<'_>,
    target: &impl RegClassInfo,
    dst: VReg,
    src: RegOperand,
) {
    let class = b.reg_class(dst);
    let chunk_count = target.chunk_count(class);
    if chunk_count == 1 {
        b.v_readfirstlane_b32(dst, src);
        return;
    }

    let chunk_class = target.chunk_class_of(class);
    let chunks: Chunks = (0..chunk_count)
        .map(|i| {
            let sub_reg = target.sub_reg(i);
            let chunk = b.new_vreg(chunk_class);
            b.v_readfirstlane_b32(chunk, src.with_sub_reg(sub_reg));
            (chunk, sub_reg)
        })
        .collect();
    b.reg_sequence(dst, chunks);
}

/// Per-lane `current_idx == idx` as a lane mask, with multi-chunk indices
/// compared chunk by chunk (in ascending order), and the results AND-ed.
///
/// Unlike `v_readfirstlane_b32`, the comparison never reads `idx` as `undef`.
fn compare_idx(
    b: &mut InstBuilder<'_>,
    target: &impl RegClassInfo,
    current_idx: VReg,
    idx: RegOperand,
) -> VReg {
    let idx = RegOperand { is_undef: false, ..idx };
    let chunk_count = target.chunk_count(b.reg_class(idx.reg));
    if chunk_count == 1 {
        let cond = b.new_vreg(RegClass::LaneMask);
        b.v_cmp_eq_u32(cond, RegOperand::read(current_idx), idx);
        return cond;
    }

    let mut cond = compare_idx_chunk(b, target.sub_reg(0), current_idx, idx);
    for i in 1..chunk_count {
        let eq = compare_idx_chunk(b, target.sub_reg(i), current_idx, idx);
        let and = b.new_vreg(RegClass::LaneMask);
        b.s_and_b64(and, cond, eq);
        cond = and;
    }
    cond
}

fn compare_idx_chunk(
    b: &mut InstBuilder<'_>,
    sub_reg: SubReg,
    current_idx: VReg,
    idx: RegOperand,
) -> VReg {
    let eq = b.new_vreg(RegClass::LaneMask);
    b.v_cmp_eq_u32(
        eq,
        RegOperand::read(current_idx).with_sub_reg(sub_reg),
        RegOperand { sub_reg: Some(sub_reg), ..idx },
    );
    eq
}
