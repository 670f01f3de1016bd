//! Mutable IR traversal.

use crate::func_at::FuncAtMut;
use crate::{Block, FuncBody, Inst, InstDef, Operand, Reg, RegOperand};

/// The result of a transformation (which is not in-place).
#[must_use]
#[derive(Copy, Clone)]
pub enum Transformed<T> {
    /// The original `T` value remains as it was, at no cost.
    Unchanged,

    /// Some part of the original `T` value was transformed, and a new `T` value
    /// had to be constructed. This change will propagate in any "outer" value.
    Changed(T),
}

impl<T> Transformed<T> {
    pub fn apply_to(self, dest: &mut T) {
        match self {
            Transformed::Unchanged => {}
            Transformed::Changed(new) => *dest = new,
        }
    }
}

/// Helper type for [`transform!`] - not public as it's easy to misuse.
enum TransformedWithOriginal<'a, T> {
    Original(&'a T),
    Changed(T),
}

impl<T> Transformed<T> {
    fn with_original(self, original: &T) -> TransformedWithOriginal<'_, T> {
        match self {
            Transformed::Unchanged => TransformedWithOriginal::Original(original),
            Transformed::Changed(new) => TransformedWithOriginal::Changed(new),
        }
    }
}

impl<T: Clone> TransformedWithOriginal<'_, T> {
    fn is_changed(&self) -> bool {
        matches!(self, TransformedWithOriginal::Changed(_))
    }
    fn changed_or_original_cloned(self) -> T {
        match self {
            TransformedWithOriginal::Original(original) => original.clone(),
            TransformedWithOriginal::Changed(new) => new,
        }
    }
}

// HACK: `transform!` needs auto-ref-like behavior for inputs.
trait AutoRef {
    fn auto_ref(&self) -> &Self {
        self
    }
}

impl<T> AutoRef for T {}

/// Helper macro to create a combined [`Transformed`] out of several variables,
/// each with their own transformation, where any [`Transformed::Changed`] input
/// will result in a [`Transformed::Changed`] output, using a combination of the
/// changed inputs, and clones of the unchanged inputs.
macro_rules! transform {
    ({ $($input:ident -> $input_transformed:expr),+ $(,)? } => $output:expr) => {{
        let ($($input,)+) = ($($input_transformed.with_original($input.auto_ref()),)+);
        if $($input.is_changed())||+ {
            let ($($input,)*) = ($($input.changed_or_original_cloned(),)+);
            Transformed::Changed($output)
        } else {
            Transformed::Unchanged
        }
    }};
}

// FIXME: `Sized` bound shouldn't be needed but removing it requires
// writing `impl Transformer + ?Sized` in `fn inner_transform_with` signatures.
pub trait Transformer: Sized {
    // Leaves (noop default behavior).
    fn transform_reg(&mut self, _reg: Reg) -> Transformed<Reg> {
        Transformed::Unchanged
    }
    fn transform_block_use(&mut self, _block: Block) -> Transformed<Block> {
        Transformed::Unchanged
    }

    // Non-leaves (defaulting to calling `.inner_transform_with(self)`).
    fn transform_reg_operand(&mut self, reg_operand: &RegOperand) -> Transformed<RegOperand> {
        reg_operand.inner_transform_with(self)
    }
    fn transform_operand(&mut self, operand: &Operand) -> Transformed<Operand> {
        operand.inner_transform_with(self)
    }

    // Non-leaves transformed in-place (defaulting to calling
    // `.inner_in_place_transform_with(self)`).
    fn in_place_transform_block_def(&mut self, mut func_at_block: FuncAtMut<'_, Block>) {
        func_at_block.inner_in_place_transform_with(self);
    }
    fn in_place_transform_inst_def(&mut self, mut func_at_inst: FuncAtMut<'_, Inst>) {
        func_at_inst.inner_in_place_transform_with(self);
    }
}

/// Trait implemented on "transformable" types, to further "elaborate" a type by
/// transforming its "interior" (i.e. variants and/or fields).
///
/// That is, an `impl InnerTransform for X` will call the relevant [`Transformer`]
/// method for each `X` field, effectively performing a single level of a deep
/// transform.
/// Also, if `Transformer::transform_X` exists for a given `X`, its default should
/// be to call `X::inner_transform_with` (i.e. so that transforming is mostly-deep
/// by default).
pub trait InnerTransform: Sized {
    fn inner_transform_with(&self, transformer: &mut impl Transformer) -> Transformed<Self>;
}

/// Like [`InnerTransform`], but only for the `in_place_transform_X` cases.
pub trait InnerInPlaceTransform {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer);
}

impl InnerInPlaceTransform for FuncBody {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer) {
        let mut blocks = self.layout.iter();
        while let Some((block, rest)) = blocks.split_first(&self.blocks) {
            blocks = rest;
            transformer.in_place_transform_block_def(self.at_mut(block));
        }
    }
}

impl InnerInPlaceTransform for FuncAtMut<'_, Block> {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer) {
        let mut insts = self.reborrow().at_insts().into_iter();
        while let Some(func_at_inst) = insts.next() {
            transformer.in_place_transform_inst_def(func_at_inst);
        }

        for succ in &mut self.reborrow().def().succs {
            transformer.transform_block_use(*succ).apply_to(succ);
        }
    }
}

impl InnerInPlaceTransform for FuncAtMut<'_, Inst> {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer) {
        self.reborrow().def().inner_in_place_transform_with(transformer);
    }
}

impl InnerInPlaceTransform for InstDef {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer) {
        let Self { opcode: _, operands } = self;

        for operand in operands {
            transformer.transform_operand(operand).apply_to(operand);
        }
    }
}

impl InnerTransform for Operand {
    fn inner_transform_with(&self, transformer: &mut impl Transformer) -> Transformed<Self> {
        match *self {
            Self::Reg(reg_operand) => transform!({
                reg_operand -> transformer.transform_reg_operand(&reg_operand),
            } => Self::Reg(reg_operand)),

            Self::Imm(_) => Transformed::Unchanged,

            Self::Block(block) => transform!({
                block -> transformer.transform_block_use(block),
            } => Self::Block(block)),
        }
    }
}

impl InnerTransform for RegOperand {
    fn inner_transform_with(&self, transformer: &mut impl Transformer) -> Transformed<Self> {
        let Self { reg, sub_reg, is_def, is_kill, is_undef } = *self;

        transform!({
            reg -> transformer.transform_reg(reg),
        } => Self {
            reg,
            sub_reg,
            is_def,
            is_kill,
            is_undef,
        })
    }
}
