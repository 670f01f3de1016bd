//! Machine-level IR for SIMT (single-instruction-multiple-lane) targets, and
//! the waterfall loop insertion pass operating on it.
//!
//! #### Notable types/modules
//!
//! ##### IR data types
//! * [`FuncBody`]: owns [`Block`]s, [`Inst`]s and [`VReg`]s (rooted by [`layout`](FuncBody::layout))
//! * [`InstDef`]: an [`Opcode`] and its [`Operand`]s
//! * [`Reg`]: either a virtual register, or the hardware active-lane mask ([`Reg::Exec`])
//!
//! ##### Utilities and passes
//! * [`print`](mod@print): plain-text printing of whole functions
//! * [`cf`]: structural control-flow edits, and CFG analyses
//! * [`waterfall`]: waterfall region collection and loop lowering
//! * [`passes::waterfall`]: the per-function entry point

// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:
#![allow(
    // NOTE: ignored for readability (`match` used when `if let` is too long).
    clippy::single_match_else,

    // NOTE: ignored because it's misguided to suggest `let mut s = ...;`
    // and `s.push_str(...);` when `+` is equivalent and does not require `let`.
    clippy::string_add,
)]
// NOTE: this is stronger than the "Embark standard lints" above, because
// we almost never need `unsafe` code and this is a further "speed bump" to it.
#![forbid(unsafe_code)]

// NOTE: all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod build;
pub mod cf;
pub mod entity;
pub mod func_at;
pub mod print;
pub mod target;
pub mod transform;
pub mod visit;
pub mod waterfall;
pub mod passes {
    //! IR transformations (typically whole-[`FuncBody`](crate::FuncBody)).
    //
    // NOTE: inline `mod` to avoid adding APIs here, it's just namespacing.

    pub mod waterfall;
}

use smallvec::SmallVec;

// HACK: work around the lack of `FxIndex{Map,Set}` type aliases elsewhere.
#[doc(hidden)]
type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
#[doc(hidden)]
type FxIndexSet<V> = indexmap::IndexSet<V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

pub use entity::{Block, EntityDefs, EntityList, EntityListIter, EntityListNode, Inst, VReg};

/// The body of a machine function: all of its blocks, instructions and virtual
/// registers, and the order of its blocks.
///
/// This is the only owner of any of the IR it contains, so structural edits
/// (see [`cf`]) are plain `&mut` operations on it, and entity handles stay
/// valid across any such edit.
#[derive(Clone, Default)]
pub struct FuncBody {
    pub blocks: EntityDefs<Block>,
    pub insts: EntityDefs<Inst>,
    pub vregs: EntityDefs<VReg>,

    /// Function order of blocks, with the entry block first.
    ///
    /// Falling through the end of a block continues into the next block in
    /// `layout` (see also [`BlockDef::succs`]).
    pub layout: EntityList<Block>,
}

impl FuncBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_block(&self) -> Option<Block> {
        self.layout.first()
    }

    /// Create a new (empty) block, placed at the end of the function.
    pub fn append_block(&mut self) -> Block {
        let block = self.blocks.define(EntityListNode::new(BlockDef::default()));
        self.layout.insert_last(block, &mut self.blocks);
        block
    }

    /// Create a new (unlinked) instruction, to be inserted into some block's
    /// `insts` list (typically done through [`build::InstBuilder`] instead).
    pub fn new_inst(&mut self, inst_def: InstDef) -> Inst {
        self.insts.define(EntityListNode::new(inst_def))
    }

    pub fn create_vreg(&mut self, class: RegClass) -> VReg {
        self.vregs.define(VRegDef { class, hint: None })
    }

    pub fn reg_class(&self, reg: Reg) -> RegClass {
        match reg {
            Reg::Virt(vreg) => self.vregs[vreg].class,
            Reg::Exec => RegClass::LaneMask,
        }
    }

    /// Record a (non-binding) preference for `vreg` to be allocated to the
    /// same location as `hint`.
    pub fn set_reg_hint(&mut self, vreg: VReg, hint: VReg) {
        self.vregs[vreg].hint = Some(hint);
    }

    /// Iterate over all the blocks, in `layout` order.
    pub fn blocks_in_layout(&self) -> impl Iterator<Item = Block> + '_ {
        self.at(self.layout).into_iter().map(|func_at_block| func_at_block.position)
    }

    /// Replace every occurrence of `from` (both definitions and uses) with `to`,
    /// across the whole function.
    pub fn replace_reg(&mut self, from: Reg, to: Reg) {
        use transform::{InnerInPlaceTransform as _, Transformed, Transformer};

        struct ReplaceReg {
            from: Reg,
            to: Reg,
        }
        impl Transformer for ReplaceReg {
            fn transform_reg(&mut self, reg: Reg) -> Transformed<Reg> {
                if reg == self.from {
                    Transformed::Changed(self.to)
                } else {
                    Transformed::Unchanged
                }
            }
        }

        if from != to {
            self.inner_in_place_transform_with(&mut ReplaceReg { from, to });
        }
    }
}

/// Definition for a [`Block`]: a basic block.
#[derive(Clone, Default)]
pub struct BlockDef {
    pub insts: EntityList<Inst>,

    /// All the blocks control-flow can continue into, after this one,
    /// whether by an explicit branch, or by falling through to the next block
    /// in [`FuncBody::layout`].
    pub succs: SmallVec<[Block; 2]>,
}

/// Definition for an [`Inst`]: a machine instruction.
///
/// By convention, `operands` start with the register definitions (if any),
/// followed by all the inputs (see the [`build`] helpers for exact shapes).
#[derive(Clone)]
pub struct InstDef {
    pub opcode: Opcode,

    pub operands: SmallVec<[Operand; 4]>,
}

impl InstDef {
    pub fn defs(&self) -> impl Iterator<Item = &RegOperand> + '_ {
        self.operands.iter().filter_map(|operand| match operand {
            Operand::Reg(reg_operand) if reg_operand.is_def => Some(reg_operand),
            _ => None,
        })
    }

    pub fn uses(&self) -> impl Iterator<Item = &RegOperand> + '_ {
        self.operands.iter().filter_map(|operand| match operand {
            Operand::Reg(reg_operand) if !reg_operand.is_def => Some(reg_operand),
            _ => None,
        })
    }
}

/// Machine opcodes known to this crate.
///
/// Other than the markers ([`Opcode::Waterfall`]), these are the "opaque"
/// low-level primitives needed to lower markers, and anything else the target
/// may use is kept as [`Opcode::Opaque`] (only its operands are understood).
//
// FIXME: implicit operands (e.g. `exec` for `SAndSaveExecB64`) are only
// described here, they're never present in `InstDef::operands`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, derive_more::From)]
pub enum Opcode {
    /// SSA merge: `dst = phi (value, pred_block)+`.
    Phi,

    /// `dst = implicit_def`: `dst` has an unspecified value.
    ImplicitDef,

    /// `dst = reg_sequence (chunk_value, sub_reg)+`: assemble `dst` out of
    /// single-chunk registers, with each chunk's [`SubReg`] as an immediate.
    RegSequence,

    /// `dst = v_mov_b32 imm`, per-lane.
    VMovB32,

    /// `dst = v_or_b32 a, b`, per-lane.
    VOrB32,

    /// `dst = v_readfirstlane_b32 src`: `src` from the first active lane,
    /// into a uniform `dst`.
    VReadFirstLaneB32,

    /// `dst = v_cmp_eq_u32 a, b`: one bit per active lane, set iff `a == b`.
    VCmpEqU32,

    /// `dst = s_mov_b64 src`.
    SMovB64,

    /// `dst = s_and_b64 a, b`.
    SAndB64,

    /// `dst = s_xor_b64 a, b`.
    SXorB64,

    /// `dst = s_and_saveexec_b64 src`: `dst` gets the previous `exec`, while
    /// `exec` becomes `exec & src` (implicitly reads and writes `exec`).
    SAndSaveExecB64,

    /// `s_cbranch_execnz target`: branch to `target` iff `exec` is non-zero
    /// (implicitly reads `exec`), otherwise fall through.
    SCBranchExecNz,

    /// One of the waterfall marker pseudo-instructions (see [`waterfall::Marker`]).
    #[from]
    Waterfall(waterfall::MarkerOpcode),

    /// Any other target instruction, opaque other than its operands.
    Opaque(&'static str),
}

/// One operand of an [`InstDef`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, derive_more::From)]
pub enum Operand {
    #[from]
    Reg(RegOperand),

    Imm(i64),

    #[from]
    Block(Block),
}

/// Register operand, i.e. a [`Reg`] (or only one [`SubReg`] chunk of it),
/// and how it's being accessed.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct RegOperand {
    pub reg: Reg,

    /// If present, only this chunk of `reg` is being accessed.
    pub sub_reg: Option<SubReg>,

    pub is_def: bool,

    /// This use is the last one (for the value in `reg`), i.e. it's dead after.
    pub is_kill: bool,

    /// The value read by this use is undefined (allowed to be anything).
    pub is_undef: bool,
}

impl RegOperand {
    pub fn def(reg: impl Into<Reg>) -> Self {
        Self { reg: reg.into(), sub_reg: None, is_def: true, is_kill: false, is_undef: false }
    }

    pub fn read(reg: impl Into<Reg>) -> Self {
        Self { reg: reg.into(), sub_reg: None, is_def: false, is_kill: false, is_undef: false }
    }

    pub fn with_sub_reg(self, sub_reg: SubReg) -> Self {
        Self { sub_reg: Some(sub_reg), ..self }
    }

    pub fn killed(self) -> Self {
        assert!(!self.is_def);
        Self { is_kill: true, ..self }
    }

    pub fn undef(self) -> Self {
        assert!(!self.is_def);
        Self { is_undef: true, ..self }
    }
}

/// A register, either virtual, or the (sole) physical register of interest.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, derive_more::From)]
pub enum Reg {
    #[from]
    Virt(VReg),

    /// The hardware active-lane mask (one bit per lane).
    Exec,
}

/// Definition for a [`VReg`]: a virtual register.
#[derive(Copy, Clone, Debug)]
pub struct VRegDef {
    pub class: RegClass,

    /// Allocation preference (see [`FuncBody::set_reg_hint`]).
    pub hint: Option<VReg>,
}

/// Register class, describing both where a value lives, and its width.
///
/// Widths are counted in "chunks" (32-bit register pieces), see also
/// [`target::RegClassInfo`] for querying them.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RegClass {
    /// Value that may differ between lanes.
    Vector { chunks: u32 },

    /// Value that is uniform across all lanes.
    Scalar { chunks: u32 },

    /// One bit per lane, same width as `exec` (but never `exec` itself).
    LaneMask,
}

/// Chunk index within a multi-chunk register (`sub0`, `sub1`, etc.).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SubReg(pub u8);
