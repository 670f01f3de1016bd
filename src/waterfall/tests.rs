//! End-to-end tests for waterfall loop insertion (collection and lowering),
//! both structurally and by executing the result on a 64-lane interpreter.

use crate::cf::unstructured::LoopFinder;
use crate::passes::waterfall::{insert_waterfall_loops, try_insert_waterfall_loops};
use crate::target::{RegClassInfo, Wave64};
use crate::waterfall::{ChunkWidth, LastUseOverlap, WaterfallConfig, WaterfallErrorKind};
use crate::{
    Block, FuncBody, Inst, InstDef, Opcode, Operand, Reg, RegClass, RegOperand, SubReg, VReg,
};
use proptest::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

const V1: RegClass = RegClass::Vector { chunks: 1 };
const S1: RegClass = RegClass::Scalar { chunks: 1 };

fn insts(func: &FuncBody, block: Block) -> Vec<Inst> {
    func.at(block).at_insts().into_iter().map(|func_at_inst| func_at_inst.position).collect()
}

fn opcodes(func: &FuncBody, block: Block) -> Vec<String> {
    insts(func, block).into_iter().map(|inst| func.insts[inst].opcode.to_string()).collect()
}

fn layout<const N: usize>(func: &FuncBody) -> [Block; N] {
    let blocks: Vec<_> = func.blocks_in_layout().collect();
    <[Block; N]>::try_from(blocks).unwrap()
}

fn succs(func: &FuncBody, block: Block) -> Vec<Block> {
    func.blocks[block].succs.to_vec()
}

fn first_use(inst_def: &InstDef) -> RegOperand {
    *inst_def.uses().next().unwrap()
}

fn only_def(inst_def: &InstDef) -> Reg {
    let mut defs = inst_def.defs();
    let def = defs.next().unwrap();
    assert!(defs.next().is_none());
    def.reg
}

fn run_pass(func: &mut FuncBody) -> bool {
    insert_waterfall_loops(func, &Wave64, &WaterfallConfig::default())
}

#[test]
fn no_markers_no_change() {
    let mut func = FuncBody::new();
    let bb = func.append_block();
    let x = func.create_vreg(V1);
    func.build_at_end(bb).v_mov_b32(x, 1);

    let before = func.to_string();
    assert!(!run_pass(&mut func));
    assert_eq!(func.to_string(), before);
    assert_eq!(layout::<1>(&func), [bb]);
}

#[test]
fn single_chunk_region() {
    let mut func = FuncBody::new();
    let bb = func.append_block();
    let exit = func.append_block();
    func.blocks[bb].succs.push(exit);

    let [idx, ptr, tok, loaded, out] = [(); 5].map(|()| func.create_vreg(V1));
    let [sptr, uidx] = [(); 2].map(|()| func.create_vreg(S1));

    let mut b = func.build_at_end(bb);
    b.opaque("v_before", [], []);
    b.waterfall_begin(ChunkWidth::X1, tok, RegOperand::read(idx));
    b.waterfall_readfirstlane(ChunkWidth::X1, tok, RegOperand::read(ptr), sptr);
    b.waterfall_readfirstlane(ChunkWidth::X1, tok, RegOperand::read(idx), uidx);
    b.opaque("v_load", [loaded], [RegOperand::read(sptr), RegOperand::read(uidx)]);
    b.waterfall_end(ChunkWidth::X1, tok, loaded, out);
    b.opaque("v_after", [], [RegOperand::read(out)]);
    func.build_at_end(exit).opaque("s_endpgm", [], []);

    assert!(run_pass(&mut func));

    let [header, loop_block, remainder, exit_after] = layout(&func);
    assert_eq!((header, exit_after), (bb, exit));

    assert_eq!(opcodes(&func, header), ["v_before", "v_mov_b32", "implicit_def", "s_mov_b64"]);
    assert_eq!(opcodes(&func, loop_block), [
        "phi",
        "phi",
        "v_readfirstlane_b32",
        "v_readfirstlane_b32",
        "v_cmp_eq_u32",
        "s_and_saveexec_b64",
        "v_load",
        "v_or_b32",
        "s_xor_b64",
        "s_cbranch_execnz",
    ]);
    assert_eq!(opcodes(&func, remainder), ["s_mov_b64", "v_after"]);

    assert_eq!(succs(&func, header), [loop_block]);
    assert_eq!(succs(&func, loop_block), [loop_block, remainder]);
    assert_eq!(succs(&func, remainder), [exit]);

    let header_insts = insts(&func, header);
    let loop_insts = insts(&func, loop_block);
    let remainder_insts = insts(&func, remainder);

    // `exec` is saved in the header, and restored on entry to the remainder.
    let save = &func.insts[header_insts[3]];
    assert_eq!(first_use(save).reg, Reg::Exec);
    let restore = &func.insts[remainder_insts[0]];
    assert_eq!(only_def(restore), Reg::Exec);
    assert_eq!(first_use(restore).reg, only_def(save));

    // The accumulator is initialized in the header, merged through a `phi`,
    // and OR-ed into the `waterfall_end` destination.
    let init = only_def(&func.insts[header_insts[1]]);
    let or = &func.insts[loop_insts[7]];
    assert_eq!(only_def(or), Reg::Virt(out));
    let merged = first_use(or).reg;
    assert_eq!(func.insts[loop_insts[0]].operands[..], [
        Operand::Reg(RegOperand::def(merged)),
        Operand::Reg(RegOperand::read(init)),
        Operand::Block(header),
        Operand::Reg(RegOperand::read(out)),
        Operand::Block(loop_block),
    ]);
    assert_eq!(func.insts[loop_insts[7]].operands[2], Operand::Reg(RegOperand::read(loaded)));
    assert_eq!(first_use(&func.insts[remainder_insts[1]]).reg, Reg::Virt(out));

    // The genuine `waterfall_readfirstlane` keeps its destination, while the
    // index-aliasing one is replaced by the per-iteration index, so the index
    // itself is read exactly once.
    let current_idx = only_def(&func.insts[loop_insts[2]]);
    assert_eq!(func.insts[loop_insts[2]].operands[1], Operand::Reg(RegOperand::read(idx)));
    assert_eq!(func.insts[loop_insts[3]].operands[..], [
        Operand::Reg(RegOperand::def(sptr)),
        Operand::Reg(RegOperand::read(ptr)),
    ]);
    let load_reads: Vec<_> = func.insts[loop_insts[6]].uses().map(|use_| use_.reg).collect();
    assert_eq!(load_reads, [Reg::Virt(sptr), current_idx]);
    assert!(func.blocks_in_layout().flat_map(|block| insts(&func, block)).all(|inst| {
        func.insts[inst].operands.iter().all(|operand| match operand {
            Operand::Reg(reg_operand) => reg_operand.reg != Reg::Virt(uidx),
            _ => true,
        })
    }));

    // Only the lanes matching the current index stay enabled.
    let cmp = &func.insts[loop_insts[4]];
    assert_eq!(cmp.operands[1..], [
        Operand::Reg(RegOperand::read(current_idx)),
        Operand::Reg(RegOperand::read(idx)),
    ]);
    let saveexec = &func.insts[loop_insts[5]];
    assert_eq!(first_use(saveexec), RegOperand::read(only_def(cmp)).killed());
    let new_exec = match only_def(saveexec) {
        Reg::Virt(vreg) => vreg,
        Reg::Exec => unreachable!(),
    };
    assert_eq!(func.vregs[new_exec].hint, Some(match only_def(cmp) {
        Reg::Virt(vreg) => vreg,
        Reg::Exec => unreachable!(),
    }));
    assert_eq!(func.insts[loop_insts[8]].operands[..], [
        Operand::Reg(RegOperand::def(Reg::Exec)),
        Operand::Reg(RegOperand::read(Reg::Exec)),
        Operand::Reg(RegOperand::read(new_exec)),
    ]);
    assert_eq!(func.insts[loop_insts[9]].operands[..], [Operand::Block(loop_block)]);
}

#[test]
fn wide_index_compares_every_chunk() {
    let mut func = FuncBody::new();
    let bb = func.append_block();

    let idx = func.create_vreg(RegClass::Vector { chunks: 4 });
    let uidx = func.create_vreg(RegClass::Scalar { chunks: 4 });
    let [tok, val, out] = [(); 3].map(|()| func.create_vreg(V1));

    let mut b = func.build_at_end(bb);
    b.waterfall_begin(ChunkWidth::X4, tok, RegOperand::read(idx).killed());
    b.waterfall_readfirstlane(ChunkWidth::X4, tok, RegOperand::read(idx), uidx);
    b.opaque("v_lookup", [val], [RegOperand::read(uidx)]);
    b.waterfall_end(ChunkWidth::X1, tok, val, out);

    assert!(run_pass(&mut func));

    let [_, loop_block, _] = layout(&func);
    let mut expected = vec!["phi", "phi"];
    expected.extend(["v_readfirstlane_b32"; 4]);
    expected.extend(["reg_sequence", "v_cmp_eq_u32"]);
    expected.extend(["v_cmp_eq_u32", "s_and_b64"].repeat(3));
    expected.extend(["s_and_saveexec_b64", "v_lookup", "v_or_b32"]);
    expected.extend(["s_xor_b64", "s_cbranch_execnz"]);
    assert_eq!(opcodes(&func, loop_block), expected);

    let loop_insts: Vec<_> = insts(&func, loop_block).into_iter().map(|i| &func.insts[i]).collect();

    // The index-aliasing `waterfall_readfirstlane` is replaced with the
    // per-iteration index itself.
    let current_idx = only_def(loop_insts[6]);
    assert_eq!(func.reg_class(current_idx), RegClass::Scalar { chunks: 4 });
    assert_eq!(first_use(loop_insts[15]).reg, current_idx);

    // Chunks are compared in ascending order, and AND-ed together.
    let cmps: Vec<_> =
        loop_insts.iter().filter(|inst_def| inst_def.opcode == Opcode::VCmpEqU32).collect();
    for (i, cmp) in cmps.iter().enumerate() {
        let sub_reg = Some(Wave64.sub_reg(i as u32));
        let RegOperand { reg, sub_reg: cur_sub_reg, .. } = first_use(cmp);
        assert_eq!((reg, cur_sub_reg), (current_idx, sub_reg));
        assert_eq!(cmp.operands[2], Operand::Reg(RegOperand { sub_reg, ..RegOperand::read(idx) }));
    }
    assert_eq!(loop_insts[9].operands[1..], [
        Operand::Reg(RegOperand::read(only_def(cmps[0]))),
        Operand::Reg(RegOperand::read(only_def(cmps[1]))),
    ]);
    assert_eq!(first_use(loop_insts[14]).reg, only_def(loop_insts[13]));
}

#[test]
fn undef_read_first_lane_applies_to_every_chunk() {
    let mut func = FuncBody::new();
    let bb = func.append_block();

    let src = func.create_vreg(RegClass::Vector { chunks: 2 });
    let dst = func.create_vreg(RegClass::Scalar { chunks: 2 });
    let [idx, tok, val, out] = [(); 4].map(|()| func.create_vreg(V1));

    let mut b = func.build_at_end(bb);
    b.waterfall_begin(ChunkWidth::X1, tok, RegOperand::read(idx).undef());
    b.waterfall_readfirstlane(ChunkWidth::X2, tok, RegOperand::read(src).undef(), dst);
    b.opaque("v_use", [val], [RegOperand::read(dst)]);
    b.waterfall_end(ChunkWidth::X1, tok, val, out);

    assert!(run_pass(&mut func));

    let [_, loop_block, _] = layout(&func);
    let loop_insts: Vec<_> = insts(&func, loop_block).into_iter().map(|i| &func.insts[i]).collect();
    let src_reads: Vec<_> = loop_insts
        .iter()
        .filter(|inst_def| inst_def.opcode == Opcode::VReadFirstLaneB32)
        .map(|inst_def| first_use(inst_def))
        .filter(|reg_operand| reg_operand.reg == Reg::Virt(src))
        .collect();
    assert_eq!(src_reads, [0, 1].map(|i| RegOperand::read(src).undef().with_sub_reg(SubReg(i))));

    let reg_sequence = loop_insts.iter().find(|inst_def| inst_def.opcode == Opcode::RegSequence);
    assert_eq!(only_def(reg_sequence.unwrap()), Reg::Virt(dst));

    // An `undef` index is only `undef` for reading its first lane, while
    // the comparison reads it as-is.
    assert_eq!(first_use(loop_insts[2]), RegOperand::read(idx).undef());
    let cmp = loop_insts.iter().find(|inst_def| inst_def.opcode == Opcode::VCmpEqU32);
    assert_eq!(cmp.unwrap().operands[2], Operand::Reg(RegOperand::read(idx)));
}

#[test]
fn wide_end_merges_every_chunk() {
    let mut func = FuncBody::new();
    let bb = func.append_block();

    let v2 = RegClass::Vector { chunks: 2 };
    let [idx, tok] = [(); 2].map(|()| func.create_vreg(V1));
    let [val, out] = [(); 2].map(|()| func.create_vreg(v2));
    let uidx = func.create_vreg(S1);

    let mut b = func.build_at_end(bb);
    b.waterfall_begin(ChunkWidth::X1, tok, RegOperand::read(idx));
    b.waterfall_readfirstlane(ChunkWidth::X1, tok, RegOperand::read(idx), uidx);
    b.opaque("v_load_x2", [val], [RegOperand::read(uidx)]);
    b.waterfall_end(ChunkWidth::X2, tok, val, out);

    assert!(run_pass(&mut func));

    let [header, loop_block, _] = layout(&func);
    assert_eq!(opcodes(&func, header), [
        "v_mov_b32",
        "v_mov_b32",
        "reg_sequence",
        "implicit_def",
        "s_mov_b64",
    ]);
    assert_eq!(opcodes(&func, loop_block), [
        "phi",
        "phi",
        "v_readfirstlane_b32",
        "v_cmp_eq_u32",
        "s_and_saveexec_b64",
        "v_load_x2",
        "v_or_b32",
        "v_or_b32",
        "reg_sequence",
        "s_xor_b64",
        "s_cbranch_execnz",
    ]);

    let header_insts: Vec<_> = insts(&func, header).into_iter().map(|i| &func.insts[i]).collect();
    let loop_insts: Vec<_> = insts(&func, loop_block).into_iter().map(|i| &func.insts[i]).collect();

    // Every chunk of the accumulator starts out as `0`.
    let init = only_def(header_insts[2]);
    assert_eq!(func.reg_class(init), v2);
    for (i, v_mov) in header_insts[..2].iter().enumerate() {
        assert_eq!(v_mov.operands[1], Operand::Imm(0));
        assert_eq!(header_insts[2].operands[1 + 2 * i..][..2], [
            Operand::Reg(RegOperand::read(only_def(v_mov))),
            Operand::Imm(i as i64),
        ]);
    }
    let merged = only_def(loop_insts[0]);
    assert_eq!(loop_insts[0].operands[1], Operand::Reg(RegOperand::read(init)));

    // Chunks are OR-ed in ascending order, then reassembled into `out`.
    for (i, or) in loop_insts[6..8].iter().enumerate() {
        let sub_reg = Wave64.sub_reg(i as u32);
        assert_eq!(or.operands[1..], [
            Operand::Reg(RegOperand::read(merged).with_sub_reg(sub_reg)),
            Operand::Reg(RegOperand::read(val).with_sub_reg(sub_reg)),
        ]);
        assert_eq!(loop_insts[8].operands[1 + 2 * i..][..2], [
            Operand::Reg(RegOperand::read(only_def(or))),
            Operand::Imm(i as i64),
        ]);
    }
    assert_eq!(only_def(loop_insts[8]), Reg::Virt(out));
    assert_eq!(loop_insts[0].operands[3], Operand::Reg(RegOperand::read(out)));
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "width doesn't match its operand")]
fn marker_width_must_match_operand() {
    let mut func = FuncBody::new();
    let bb = func.append_block();

    let [idx, tok, val, out] = [(); 4].map(|()| func.create_vreg(V1));
    let uidx = func.create_vreg(S1);

    let mut b = func.build_at_end(bb);
    b.waterfall_begin(ChunkWidth::X1, tok, RegOperand::read(idx));
    b.waterfall_readfirstlane(ChunkWidth::X1, tok, RegOperand::read(idx), uidx);
    b.opaque("v_op", [val], [RegOperand::read(uidx)]);
    b.waterfall_end(ChunkWidth::X2, tok, val, out);

    run_pass(&mut func);
}

#[test]
fn region_inside_outer_loop() {
    let mut func = FuncBody::new();
    let bb = func.append_block();
    let exit = func.append_block();
    func.blocks[bb].succs.extend([bb, exit]);

    let [idx, tok, val, out] = [(); 4].map(|()| func.create_vreg(V1));
    let uidx = func.create_vreg(S1);

    let mut b = func.build_at_end(bb);
    b.waterfall_begin(ChunkWidth::X1, tok, RegOperand::read(idx));
    b.waterfall_readfirstlane(ChunkWidth::X1, tok, RegOperand::read(idx), uidx);
    b.opaque("v_op", [val], [RegOperand::read(uidx)]);
    b.waterfall_end(ChunkWidth::X1, tok, val, out);
    b.opaque("s_cbranch_outer", [], [RegOperand::read(out)]);
    func.build_at_end(exit).opaque("s_endpgm", [], []);

    assert!(run_pass(&mut func));

    let [header, loop_block, remainder, _] = layout(&func);
    assert_eq!(succs(&func, remainder), [header, exit]);

    // The waterfall loop is nested in the outer loop, and still only
    // entered from its header.
    let loops = LoopFinder::new(&func).find_all_loops_starting_at(header);
    assert_eq!(loops.keys().copied().collect::<Vec<_>>(), [header, loop_block]);
    assert_eq!(loops[&header].iter().copied().collect::<Vec<_>>(), [exit]);
    assert_eq!(loops[&loop_block].iter().copied().collect::<Vec<_>>(), [remainder]);
    assert_eq!(func.predecessors()[&loop_block][..], [header, loop_block]);
}

#[test]
fn sequential_regions_chain_through_remainders() {
    let mut func = FuncBody::new();
    let bb = func.append_block();

    let [idx, tok0, tok1, a, b_val, out0, out1] = [(); 7].map(|()| func.create_vreg(V1));

    let mut b = func.build_at_end(bb);
    b.waterfall_begin(ChunkWidth::X1, tok0, RegOperand::read(idx));
    b.waterfall_readfirstlane(ChunkWidth::X1, tok0, RegOperand::read(idx), a);
    b.waterfall_end(ChunkWidth::X1, tok0, a, out0);
    b.opaque("v_between", [], [RegOperand::read(out0)]);
    b.waterfall_begin(ChunkWidth::X1, tok1, RegOperand::read(out0));
    b.waterfall_readfirstlane(ChunkWidth::X1, tok1, RegOperand::read(out0), b_val);
    b.waterfall_end(ChunkWidth::X1, tok1, b_val, out1);
    b.opaque("v_after", [], [RegOperand::read(out1)]);

    assert!(run_pass(&mut func));

    let [header0, loop0, header1, loop1, remainder1] = layout(&func);
    assert_eq!(opcodes(&func, header1), [
        "s_mov_b64",
        "v_between",
        "v_mov_b32",
        "implicit_def",
        "s_mov_b64",
    ]);
    assert_eq!(opcodes(&func, remainder1), ["s_mov_b64", "v_after"]);

    let loops = LoopFinder::new(&func).find_all_loops_starting_at(header0);
    assert_eq!(loops.len(), 2);
    assert_eq!(loops[&loop0].iter().copied().collect::<Vec<_>>(), [header1]);
    assert_eq!(loops[&loop1].iter().copied().collect::<Vec<_>>(), [remainder1]);

    let preds = func.predecessors();
    assert_eq!(preds[&header1][..], [loop0]);
    assert!(preds[&loop1].contains(&header1) && preds[&loop1].contains(&loop1));
    assert_eq!(
        func.rev_post_order().collect::<Vec<_>>(),
        [header0, loop0, header1, loop1, remainder1]
    );
}

#[test]
fn last_use_extends_loop() {
    let mut func = FuncBody::new();
    let bb = func.append_block();

    let [idx, tok, x, y, val, out] = [(); 6].map(|()| func.create_vreg(V1));
    let uidx = func.create_vreg(S1);

    let mut b = func.build_at_end(bb);
    b.waterfall_begin(ChunkWidth::X1, tok, RegOperand::read(idx));
    b.waterfall_readfirstlane(ChunkWidth::X1, tok, RegOperand::read(idx), uidx);
    b.waterfall_last_use(ChunkWidth::X1, tok, x, y);
    b.opaque("v_add", [val], [RegOperand::read(uidx), RegOperand::read(x)]);
    b.waterfall_end(ChunkWidth::X1, tok, val, out);
    b.opaque("v_store", [], [RegOperand::read(y)]);
    b.opaque("v_after", [], [RegOperand::read(out)]);

    assert!(run_pass(&mut func));

    let [header, loop_block, remainder] = layout(&func);
    let loop_opcodes = opcodes(&func, loop_block);
    assert_eq!(loop_opcodes[loop_opcodes.len() - 5..], [
        "v_add",
        "v_or_b32",
        "v_store",
        "s_xor_b64",
        "s_cbranch_execnz",
    ]);
    assert_eq!(opcodes(&func, remainder), ["s_mov_b64", "v_after"]);

    // Every use of the `waterfall_last_use` destination now reads its source.
    let store = insts(&func, loop_block)[loop_opcodes.len() - 3];
    assert_eq!(first_use(&func.insts[store]).reg, Reg::Virt(x));

    for block in [header, loop_block, remainder] {
        for inst in insts(&func, block) {
            assert!(func.insts[inst].waterfall_marker().is_none());
            assert!(func.insts[inst].operands.iter().all(|operand| match operand {
                Operand::Reg(reg_operand) => reg_operand.reg != Reg::Virt(y),
                _ => true,
            }));
        }
    }
}

fn mismatched_tokens() -> FuncBody {
    let mut func = FuncBody::new();
    let bb = func.append_block();

    let [idx, tok, other_tok, val, out] = [(); 5].map(|()| func.create_vreg(V1));
    let uidx = func.create_vreg(S1);

    let mut b = func.build_at_end(bb);
    b.waterfall_begin(ChunkWidth::X1, tok, RegOperand::read(idx));
    b.waterfall_readfirstlane(ChunkWidth::X1, tok, RegOperand::read(idx), uidx);
    b.opaque("v_op", [val], [RegOperand::read(uidx)]);
    b.waterfall_end(ChunkWidth::X1, other_tok, val, out);
    func
}

#[test]
fn malformed_markers_leave_func_untouched() {
    let mut func = mismatched_tokens();
    let before = func.to_string();

    let err =
        try_insert_waterfall_loops(&mut func, &Wave64, &WaterfallConfig::default()).unwrap_err();
    assert!(matches!(err.kind, WaterfallErrorKind::OverlappingRegions { .. }));
    assert_eq!(func.to_string(), before);
    assert_eq!(func.blocks_in_layout().count(), 1);
}

#[test]
#[should_panic(expected = "overlapping waterfall regions")]
fn malformed_markers_panic() {
    run_pass(&mut mismatched_tokens());
}

#[test]
fn config_from_json() {
    assert_eq!(WaterfallConfig::from_json("{}").unwrap(), WaterfallConfig::default());
    assert_eq!(
        WaterfallConfig::from_json(r#"{ "last-use-overlap": "unchecked" }"#).unwrap(),
        WaterfallConfig { last_use_overlap: LastUseOverlap::Unchecked }
    );
    assert!(WaterfallConfig::from_json(r#"{ "last_use_overlap": "reject" }"#).is_err());
    assert!(WaterfallConfig::from_json(r#"{ "last-use-overlap": "maybe" }"#).is_err());
}

const LANES: usize = Wave64::LANES as usize;

/// Value of a register: one `u32` per lane per chunk, or a lane mask.
#[derive(Clone, PartialEq, Eq, Debug)]
enum Val {
    Lanes(Vec<[u32; LANES]>),
    Mask(u64),
}

impl Val {
    fn lanes(self) -> Vec<[u32; LANES]> {
        match self {
            Val::Lanes(chunks) => chunks,
            Val::Mask(_) => panic!("expected per-lane value, found lane mask"),
        }
    }

    fn mask(self) -> u64 {
        match self {
            Val::Mask(mask) => mask,
            Val::Lanes(_) => panic!("expected lane mask, found per-lane value"),
        }
    }
}

/// Minimal interpreter for lowered functions, tracking `exec` and only ever
/// writing per-lane registers in active lanes.
struct Interpreter<'a> {
    func: &'a FuncBody,
    exec: u64,
    regs: FxHashMap<VReg, Val>,
    block_entries: FxHashMap<Block, usize>,
}

impl<'a> Interpreter<'a> {
    fn new(func: &'a FuncBody, exec: u64) -> Self {
        Self { func, exec, regs: FxHashMap::default(), block_entries: FxHashMap::default() }
    }

    fn zero(&self, vreg: VReg) -> Val {
        match self.func.vregs[vreg].class {
            RegClass::LaneMask => Val::Mask(0),
            class => Val::Lanes(vec![[0; LANES]; Wave64.chunk_count(class) as usize]),
        }
    }

    fn read(&self, operand: &Operand) -> Val {
        let &Operand::Reg(RegOperand { reg, sub_reg, is_def: false, .. }) = operand else {
            panic!("expected register input, found {operand:?}");
        };
        let val = match reg {
            Reg::Exec => Val::Mask(self.exec),
            Reg::Virt(vreg) => self.regs.get(&vreg).cloned().unwrap_or_else(|| self.zero(vreg)),
        };
        match sub_reg {
            Some(sub_reg) => Val::Lanes(vec![val.lanes()[usize::from(sub_reg.0)]]),
            None => val,
        }
    }

    /// The value of every chunk, which must be the same in all active lanes.
    fn read_uniform(&self, operand: &Operand) -> Vec<u32> {
        let first_lane = self.exec.trailing_zeros() as usize;
        self.read(operand)
            .lanes()
            .iter()
            .map(|chunk| {
                for lane in (0..LANES).filter(|&lane| self.exec & (1 << lane) != 0) {
                    assert_eq!(chunk[lane], chunk[first_lane], "non-uniform {operand:?}");
                }
                chunk[first_lane]
            })
            .collect()
    }

    fn write(&mut self, operand: &Operand, val: Val) {
        let &Operand::Reg(RegOperand { reg, sub_reg: None, is_def: true, .. }) = operand else {
            panic!("expected register definition, found {operand:?}");
        };
        let vreg = match (reg, &val) {
            (Reg::Exec, &Val::Mask(mask)) => {
                self.exec = mask;
                return;
            }
            (Reg::Virt(vreg), _) => vreg,
            (Reg::Exec, Val::Lanes(_)) => panic!("per-lane value written to `exec`"),
        };
        let val = match (self.func.vregs[vreg].class, val) {
            (RegClass::LaneMask, val @ Val::Mask(_)) => val,
            (RegClass::Scalar { chunks }, Val::Lanes(new)) => {
                assert_eq!(new.len(), chunks as usize);
                Val::Lanes(new)
            }
            (RegClass::Vector { chunks }, Val::Lanes(new)) => {
                assert_eq!(new.len(), chunks as usize);
                let mut chunks = self.regs.get(&vreg).cloned().unwrap_or_else(|| self.zero(vreg));
                if let Val::Lanes(old) = &mut chunks {
                    for (old, new) in old.iter_mut().zip(new) {
                        for lane in (0..LANES).filter(|&lane| self.exec & (1 << lane) != 0) {
                            old[lane] = new[lane];
                        }
                    }
                }
                chunks
            }
            (class, val) => panic!("{val:?} written to {class:?} register"),
        };
        self.regs.insert(vreg, val);
    }

    fn per_lane(&self, a: &Operand, b: &Operand, f: impl Fn(u32, u32) -> u32) -> Val {
        let (a, b) = (self.read(a).lanes()[0], self.read(b).lanes()[0]);
        Val::Lanes(vec![std::array::from_fn(|lane| f(a[lane], b[lane]))])
    }

    /// Execute one instruction, returning the target of a taken branch.
    fn step(&mut self, inst_def: &InstDef, pred: Option<Block>) -> Option<Block> {
        let ops = &inst_def.operands[..];
        match inst_def.opcode {
            Opcode::Phi => {
                let incoming = ops[1..]
                    .chunks(2)
                    .find(|pair| Some(pair[1]) == pred.map(Operand::Block))
                    .unwrap_or_else(|| panic!("phi without incoming value for {pred:?}"));
                let Operand::Reg(RegOperand { reg: Reg::Virt(dst), .. }) = ops[0] else {
                    unreachable!()
                };
                let val = self.read(&incoming[0]);
                self.regs.insert(dst, val);
            }
            Opcode::ImplicitDef => {
                let Operand::Reg(RegOperand { reg: Reg::Virt(dst), .. }) = ops[0] else {
                    unreachable!()
                };
                let zero = self.zero(dst);
                self.regs.insert(dst, zero);
            }
            Opcode::RegSequence => {
                let mut chunks = vec![];
                for pair in ops[1..].chunks(2) {
                    let Operand::Imm(sub_reg) = pair[1] else { unreachable!() };
                    assert_eq!(sub_reg, chunks.len() as i64);
                    chunks.push(self.read(&pair[0]).lanes()[0]);
                }
                self.write(&ops[0], Val::Lanes(chunks));
            }
            Opcode::VMovB32 => {
                let Operand::Imm(imm) = ops[1] else { unreachable!() };
                self.write(&ops[0], Val::Lanes(vec![[imm as u32; LANES]]));
            }
            Opcode::VOrB32 => {
                let val = self.per_lane(&ops[1], &ops[2], |a, b| a | b);
                self.write(&ops[0], val);
            }
            Opcode::VReadFirstLaneB32 => {
                assert_ne!(self.exec, 0);
                let src = self.read(&ops[1]).lanes();
                assert_eq!(src.len(), 1);
                let first = src[0][self.exec.trailing_zeros() as usize];
                self.write(&ops[0], Val::Lanes(vec![[first; LANES]]));
            }
            Opcode::VCmpEqU32 => {
                let eq = self.per_lane(&ops[1], &ops[2], |a, b| (a == b).into()).lanes()[0];
                let mask = (0..LANES)
                    .filter(|&lane| self.exec & (1 << lane) != 0 && eq[lane] != 0)
                    .fold(0, |mask, lane| mask | (1 << lane));
                self.write(&ops[0], Val::Mask(mask));
            }
            Opcode::SMovB64 => {
                let val = Val::Mask(self.read(&ops[1]).mask());
                self.write(&ops[0], val);
            }
            Opcode::SAndB64 | Opcode::SXorB64 => {
                let (a, b) = (self.read(&ops[1]).mask(), self.read(&ops[2]).mask());
                let mask = if inst_def.opcode == Opcode::SAndB64 { a & b } else { a ^ b };
                self.write(&ops[0], Val::Mask(mask));
            }
            Opcode::SAndSaveExecB64 => {
                let cond = self.read(&ops[1]).mask();
                self.write(&ops[0], Val::Mask(self.exec));
                self.exec &= cond;
            }
            Opcode::SCBranchExecNz => {
                let Operand::Block(target) = ops[0] else { unreachable!() };
                if self.exec != 0 {
                    return Some(target);
                }
            }
            Opcode::Waterfall(marker) => panic!("`{marker}` left behind"),

            // Sum of all (uniform) inputs.
            Opcode::Opaque("s_sum") => {
                let sum = ops[1..]
                    .iter()
                    .flat_map(|input| self.read_uniform(input))
                    .fold(0u32, u32::wrapping_add);
                self.write(&ops[0], Val::Lanes(vec![[sum; LANES]]));
            }
            // `[x, !x]`, from the first chunk `x` of the input.
            Opcode::Opaque("v_pair") => {
                let x = self.read(&ops[1]).lanes()[0];
                self.write(&ops[0], Val::Lanes(vec![x, x.map(|x| !x)]));
            }
            Opcode::Opaque("v_copy") => {
                let val = Val::Lanes(self.read(&ops[1]).lanes());
                self.write(&ops[0], val);
            }
            Opcode::Opaque(name) => panic!("unknown opcode `{name}`"),
        }
        None
    }

    fn run(&mut self) {
        let func = self.func;
        let layout: Vec<_> = func.blocks_in_layout().collect();
        let mut pred = None;
        let mut next = func.entry_block();
        let mut steps = 0;
        while let Some(block) = next {
            steps += 1;
            assert!(steps <= 1000, "runaway execution");
            *self.block_entries.entry(block).or_default() += 1;

            next = None;
            for func_at_inst in func.at(block).at_insts() {
                next = self.step(func_at_inst.def(), pred);
                if next.is_some() {
                    break;
                }
            }
            next = next.or_else(|| {
                let i = layout.iter().position(|&b| b == block)?;
                layout.get(i + 1).copied()
            });
            pred = Some(block);
        }
    }
}

proptest! {
    #[test]
    fn waterfall_loop_runs_once_per_distinct_index(
        exec in prop_oneof![1..=u64::MAX, (0..64u32).prop_map(|lane| 1u64 << lane)],
        idx_chunks in 1u32..=2,
        lane_idx in proptest::collection::vec((0u32..4, 0u32..3), LANES),
    ) {
        let mut func = FuncBody::new();
        let bb = func.append_block();
        let width = ChunkWidth::from_chunks(idx_chunks).unwrap();

        let idx = func.create_vreg(RegClass::Vector { chunks: idx_chunks });
        let uidx = func.create_vreg(RegClass::Scalar { chunks: idx_chunks });
        let [tok, key, spread, out] = [(); 4].map(|()| func.create_vreg(V1));
        let [ukey, sum] = [(); 2].map(|()| func.create_vreg(S1));
        let [pair, out_pair] = [(); 2].map(|()| func.create_vreg(RegClass::Vector { chunks: 2 }));

        let mut b = func.build_at_end(bb);
        b.waterfall_begin(width, tok, RegOperand::read(idx));
        b.waterfall_readfirstlane(width, tok, RegOperand::read(idx), uidx);
        b.waterfall_readfirstlane(ChunkWidth::X1, tok, RegOperand::read(key), ukey);
        b.opaque("s_sum", [sum], [RegOperand::read(uidx), RegOperand::read(ukey)]);
        b.opaque("v_copy", [spread], [RegOperand::read(sum)]);
        b.opaque("v_pair", [pair], [RegOperand::read(spread)]);
        b.waterfall_end(ChunkWidth::X1, tok, spread, out);
        b.waterfall_end(ChunkWidth::X2, tok, pair, out_pair);

        prop_assert!(run_pass(&mut func));
        let [_, loop_block, _] = layout(&func);

        // `key` is a function of the index, so it's uniform in each iteration.
        let mut interp = Interpreter::new(&func, exec);
        let idx_val: Vec<[u32; LANES]> = (0..idx_chunks as usize)
            .map(|c| std::array::from_fn(|lane| [lane_idx[lane].0, lane_idx[lane].1][c]))
            .collect();
        interp.regs.insert(idx, Val::Lanes(idx_val));
        interp.regs.insert(key, Val::Lanes(vec![std::array::from_fn(|lane| lane_idx[lane].0 * 7)]));
        interp.run();

        let active = |lane: usize| exec & (1 << lane) != 0;
        let lane_key = |lane: usize| {
            let (lo, hi) = lane_idx[lane];
            if idx_chunks == 2 { (lo, hi) } else { (lo, 0) }
        };
        let distinct: FxHashSet<_> = (0..LANES).filter(|&l| active(l)).map(lane_key).collect();

        prop_assert_eq!(interp.block_entries[&loop_block], distinct.len());
        prop_assert_eq!(interp.exec, exec);

        let out_val = interp.regs[&out].clone().lanes();
        let out_pair_val = interp.regs[&out_pair].clone().lanes();
        for lane in 0..LANES {
            let (lo, hi) = lane_key(lane);
            let expected = if active(lane) { lo + hi + lo * 7 } else { 0 };
            prop_assert_eq!(out_val[0][lane], expected, "lane {}", lane);

            let expected_pair = if active(lane) { [expected, !expected] } else { [0, 0] };
            prop_assert_eq!([out_pair_val[0][lane], out_pair_val[1][lane]], expected_pair);
        }
    }
}
