//! Immutable IR traversal.

use crate::func_at::FuncAt;
use crate::{Block, FuncBody, InstDef, Operand, Reg, RegOperand};

// FIXME: `Sized` bound shouldn't be needed but removing it requires
// writing `impl Visitor<'a> + ?Sized` in `fn inner_visit_with` signatures.
pub trait Visitor<'a>: Sized {
    // Leaves (noop default behavior).
    fn visit_reg_def(&mut self, _reg: Reg) {}
    fn visit_reg_use(&mut self, _reg: Reg) {}
    fn visit_block_use(&mut self, _block: Block) {}

    // Non-leaves (defaulting to calling `.inner_visit_with(self)`).
    fn visit_block_def(&mut self, func_at_block: FuncAt<'a, Block>) {
        func_at_block.inner_visit_with(self);
    }
    fn visit_inst_def(&mut self, inst_def: &'a InstDef) {
        inst_def.inner_visit_with(self);
    }
    fn visit_operand(&mut self, operand: &'a Operand) {
        operand.inner_visit_with(self);
    }
    fn visit_reg_operand(&mut self, reg_operand: &'a RegOperand) {
        reg_operand.inner_visit_with(self);
    }
}

/// Trait implemented on "deeply visitable" types, to further "explore" a type
/// by visiting its "interior" (i.e. variants and/or fields).
///
/// That is, an `impl InnerVisit for X` will call the relevant [`Visitor`] method
/// for each `X` field, effectively performing a single level of a deep visit.
/// Also, if `Visitor::visit_X` exists for a given `X`, its default should be to
/// call `X::inner_visit_with` (i.e. so that visiting is mostly-deep by default).
pub trait InnerVisit {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>);
}

impl InnerVisit for FuncBody {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        for func_at_block in self.at(self.layout) {
            visitor.visit_block_def(func_at_block);
        }
    }
}

// FIXME: this can't implement `InnerVisit` because of the `&'a self`
// requirement, whereas this has `'a` in `self: FuncAt<'a, Block>`.
impl<'a> FuncAt<'a, Block> {
    pub fn inner_visit_with(self, visitor: &mut impl Visitor<'a>) {
        for func_at_inst in self.at_insts() {
            visitor.visit_inst_def(func_at_inst.def());
        }
        for &succ in &self.def().succs {
            visitor.visit_block_use(succ);
        }
    }
}

impl InnerVisit for InstDef {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self { opcode: _, operands } = self;

        for operand in operands {
            visitor.visit_operand(operand);
        }
    }
}

impl InnerVisit for Operand {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        match self {
            Self::Reg(reg_operand) => visitor.visit_reg_operand(reg_operand),
            Self::Imm(_) => {}
            &Self::Block(block) => visitor.visit_block_use(block),
        }
    }
}

impl InnerVisit for RegOperand {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        if self.is_def {
            visitor.visit_reg_def(self.reg);
        } else {
            visitor.visit_reg_use(self.reg);
        }
    }
}
