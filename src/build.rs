//! Instruction construction, at a fixed position within a block.
//!
//! Every builder method appends one instruction at the [`InstBuilder`]'s
//! insertion point (so successive calls produce instructions in call order),
//! and documents the operand shape it produces, which everything else in the
//! crate (e.g. printing) relies on.

use crate::waterfall::{ChunkWidth, MarkerKind, MarkerOpcode};
use crate::{
    Block, FuncBody, Inst, InstDef, Opcode, Operand, Reg, RegClass, RegOperand, SubReg, VReg,
};
use smallvec::SmallVec;

/// Where an [`InstBuilder`] inserts instructions, in its block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InsertPoint {
    /// Just before this instruction (which must be in the block).
    Before(Inst),

    End,
}

pub struct InstBuilder<'a> {
    func: &'a mut FuncBody,
    block: Block,
    point: InsertPoint,
}

impl FuncBody {
    pub fn build_at(&mut self, block: Block, point: InsertPoint) -> InstBuilder<'_> {
        InstBuilder { func: self, block, point }
    }

    pub fn build_before(&mut self, block: Block, inst: Inst) -> InstBuilder<'_> {
        self.build_at(block, InsertPoint::Before(inst))
    }

    pub fn build_at_end(&mut self, block: Block) -> InstBuilder<'_> {
        self.build_at(block, InsertPoint::End)
    }

    /// Insert before the current first instruction of `block` (or at the end,
    /// if `block` is empty).
    pub fn build_at_start(&mut self, block: Block) -> InstBuilder<'_> {
        let point = match self.blocks[block].insts.first() {
            Some(first) => InsertPoint::Before(first),
            None => InsertPoint::End,
        };
        self.build_at(block, point)
    }
}

impl InstBuilder<'_> {
    pub fn block(&self) -> Block {
        self.block
    }

    pub fn new_vreg(&mut self, class: RegClass) -> VReg {
        self.func.create_vreg(class)
    }

    pub fn reg_class(&self, reg: impl Into<Reg>) -> RegClass {
        self.func.reg_class(reg.into())
    }

    pub fn inst(&mut self, opcode: Opcode, operands: impl IntoIterator<Item = Operand>) -> Inst {
        let inst = self.func.new_inst(InstDef { opcode, operands: operands.into_iter().collect() });
        let insts = &mut self.func.blocks[self.block].insts;
        match self.point {
            InsertPoint::Before(next) => insts.insert_before(inst, next, &mut self.func.insts),
            InsertPoint::End => insts.insert_last(inst, &mut self.func.insts),
        }
        inst
    }

    /// `dst = implicit_def`
    pub fn implicit_def(&mut self, dst: VReg) -> Inst {
        self.inst(Opcode::ImplicitDef, [Operand::Reg(RegOperand::def(dst))])
    }

    /// `dst = phi (value, pred)+`
    pub fn phi(&mut self, dst: VReg, incoming: impl IntoIterator<Item = (VReg, Block)>) -> Inst {
        let operands: SmallVec<[Operand; 4]> = [Operand::Reg(RegOperand::def(dst))]
            .into_iter()
            .chain(incoming.into_iter().flat_map(|(value, pred)| {
                [RegOperand::read(value).into(), Operand::Block(pred)]
            }))
            .collect();
        self.inst(Opcode::Phi, operands)
    }

    /// `dst = reg_sequence (chunk, sub_reg)+`
    pub fn reg_sequence(
        &mut self,
        dst: VReg,
        chunks: impl IntoIterator<Item = (VReg, SubReg)>,
    ) -> Inst {
        let operands: SmallVec<[Operand; 4]> = [Operand::Reg(RegOperand::def(dst))]
            .into_iter()
            .chain(chunks.into_iter().flat_map(|(chunk, sub_reg)| {
                [RegOperand::read(chunk).into(), Operand::Imm(sub_reg.0.into())]
            }))
            .collect();
        self.inst(Opcode::RegSequence, operands)
    }

    /// `dst = v_mov_b32 imm`
    pub fn v_mov_b32(&mut self, dst: VReg, imm: i64) -> Inst {
        self.inst(Opcode::VMovB32, [Operand::Reg(RegOperand::def(dst)), Operand::Imm(imm)])
    }

    /// `dst = v_or_b32 a, b`
    pub fn v_or_b32(&mut self, dst: VReg, a: RegOperand, b: RegOperand) -> Inst {
        self.inst(Opcode::VOrB32, [Operand::Reg(RegOperand::def(dst)), a.into(), b.into()])
    }

    /// `dst = v_readfirstlane_b32 src`
    pub fn v_readfirstlane_b32(&mut self, dst: VReg, src: RegOperand) -> Inst {
        self.inst(Opcode::VReadFirstLaneB32, [Operand::Reg(RegOperand::def(dst)), src.into()])
    }

    /// `dst = v_cmp_eq_u32 a, b`
    pub fn v_cmp_eq_u32(&mut self, dst: VReg, a: RegOperand, b: RegOperand) -> Inst {
        self.inst(Opcode::VCmpEqU32, [Operand::Reg(RegOperand::def(dst)), a.into(), b.into()])
    }

    /// `dst = s_mov_b64 src`
    pub fn s_mov_b64(&mut self, dst: Reg, src: Reg) -> Inst {
        self.inst(Opcode::SMovB64, [
            Operand::Reg(RegOperand::def(dst)),
            RegOperand::read(src).into(),
        ])
    }

    /// `dst = s_and_b64 a, b`
    pub fn s_and_b64(&mut self, dst: VReg, a: VReg, b: VReg) -> Inst {
        self.inst(Opcode::SAndB64, [
            Operand::Reg(RegOperand::def(dst)),
            RegOperand::read(a).into(),
            RegOperand::read(b).into(),
        ])
    }

    /// `dst = s_xor_b64 a, b`
    pub fn s_xor_b64(&mut self, dst: Reg, a: Reg, b: Reg) -> Inst {
        self.inst(Opcode::SXorB64, [
            Operand::Reg(RegOperand::def(dst)),
            RegOperand::read(a).into(),
            RegOperand::read(b).into(),
        ])
    }

    /// `dst = s_and_saveexec_b64 src` (also `exec = exec & src`)
    pub fn s_and_saveexec_b64(&mut self, dst: VReg, src: RegOperand) -> Inst {
        self.inst(Opcode::SAndSaveExecB64, [Operand::Reg(RegOperand::def(dst)), src.into()])
    }

    /// `s_cbranch_execnz target`
    pub fn s_cbranch_execnz(&mut self, target: Block) -> Inst {
        self.inst(Opcode::SCBranchExecNz, [Operand::Block(target)])
    }

    /// `defs.. = name uses..`, for any other target instruction.
    pub fn opaque(
        &mut self,
        name: &'static str,
        defs: impl IntoIterator<Item = VReg>,
        uses: impl IntoIterator<Item = RegOperand>,
    ) -> Inst {
        let operands: SmallVec<[Operand; 4]> = defs
            .into_iter()
            .map(|def| Operand::Reg(RegOperand::def(def)))
            .chain(uses.into_iter().map(Operand::Reg))
            .collect();
        self.inst(Opcode::Opaque(name), operands)
    }

    /// `token = waterfall_begin.vN idx`
    pub fn waterfall_begin(&mut self, width: ChunkWidth, token: VReg, idx: RegOperand) -> Inst {
        let opcode = MarkerOpcode { kind: MarkerKind::Begin, width };
        self.inst(opcode.into(), [Operand::Reg(RegOperand::def(token)), idx.into()])
    }

    /// `dst = waterfall_readfirstlane.vN token, src`
    pub fn waterfall_readfirstlane(
        &mut self,
        width: ChunkWidth,
        token: VReg,
        src: RegOperand,
        dst: VReg,
    ) -> Inst {
        self.waterfall_marker(MarkerKind::ReadFirstLane, width, token, src, dst)
    }

    /// `dst = waterfall_end.vN token, src`
    pub fn waterfall_end(&mut self, width: ChunkWidth, token: VReg, src: VReg, dst: VReg) -> Inst {
        self.waterfall_marker(MarkerKind::End, width, token, RegOperand::read(src), dst)
    }

    /// `dst = waterfall_last_use.vN token, src`
    pub fn waterfall_last_use(
        &mut self,
        width: ChunkWidth,
        token: VReg,
        src: VReg,
        dst: VReg,
    ) -> Inst {
        self.waterfall_marker(MarkerKind::LastUse, width, token, RegOperand::read(src), dst)
    }

    fn waterfall_marker(
        &mut self,
        kind: MarkerKind,
        width: ChunkWidth,
        token: VReg,
        src: RegOperand,
        dst: VReg,
    ) -> Inst {
        let opcode = MarkerOpcode { kind, width };
        self.inst(opcode.into(), [
            Operand::Reg(RegOperand::def(dst)),
            RegOperand::read(token).into(),
            src.into(),
        ])
    }
}
