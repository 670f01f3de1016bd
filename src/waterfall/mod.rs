//! Waterfall loops: serializing a region of code over every distinct value of
//! a divergent (i.e. per-lane) index.
//!
//! Upstream code generation delimits such regions with marker instructions
//! ([`Marker`]), all sharing one "token" register per region:
//! * `waterfall_begin` opens a region, and names the divergent index
//! * `waterfall_readfirstlane` requests a lane-uniform copy of some value
//! * `waterfall_end` requests that its `dst` receive `src`, for all lanes
//!   (as each lane only gets to run `src`'s computation in one iteration)
//! * `waterfall_last_use` extends the region up to the last use of its `dst`
//!   (and is otherwise just a copy)
//!
//! [`collect::collect_regions`] groups the markers of one block into
//! [`WaterfallRegion`]s, and [`lower::lower_region`] then replaces each region
//! with a loop that runs once per distinct index value (across active lanes).

use crate::{Block, Inst, InstDef, Opcode, Operand, Reg, RegOperand, VReg};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

pub mod collect;
pub mod lower;

#[cfg(test)]
mod tests;

/// Width of a marker's value operands, in 32-bit chunks.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ChunkWidth {
    X1,
    X2,
    X4,
    X8,
}

impl ChunkWidth {
    pub fn chunks(self) -> u32 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
        }
    }

    pub fn from_chunks(chunks: u32) -> Option<Self> {
        match chunks {
            1 => Some(Self::X1),
            2 => Some(Self::X2),
            4 => Some(Self::X4),
            8 => Some(Self::X8),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MarkerKind {
    Begin,
    ReadFirstLane,
    End,
    LastUse,
}

impl MarkerKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Begin => "waterfall_begin",
            Self::ReadFirstLane => "waterfall_readfirstlane",
            Self::End => "waterfall_end",
            Self::LastUse => "waterfall_last_use",
        }
    }
}

/// [`Opcode`] of a marker instruction, i.e. [`Opcode::Waterfall`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MarkerOpcode {
    pub kind: MarkerKind,
    pub width: ChunkWidth,
}

impl fmt::Display for MarkerOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.v{}", self.kind.name(), self.width.chunks())
    }
}

/// Decoded marker instruction (see also the module-level docs).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Marker {
    /// `token = waterfall_begin idx`
    Begin { token: VReg, idx: RegOperand, width: ChunkWidth },

    /// `dst = waterfall_readfirstlane token, src`
    ReadFirstLane { token: VReg, src: RegOperand, dst: VReg, width: ChunkWidth },

    /// `dst = waterfall_end token, src`
    End { token: VReg, src: VReg, dst: VReg, width: ChunkWidth },

    /// `dst = waterfall_last_use token, src`
    LastUse { token: VReg, src: VReg, dst: VReg, width: ChunkWidth },
}

impl Marker {
    pub fn kind(self) -> MarkerKind {
        match self {
            Self::Begin { .. } => MarkerKind::Begin,
            Self::ReadFirstLane { .. } => MarkerKind::ReadFirstLane,
            Self::End { .. } => MarkerKind::End,
            Self::LastUse { .. } => MarkerKind::LastUse,
        }
    }

    pub fn token(self) -> VReg {
        match self {
            Self::Begin { token, .. }
            | Self::ReadFirstLane { token, .. }
            | Self::End { token, .. }
            | Self::LastUse { token, .. } => token,
        }
    }

    pub fn width(self) -> ChunkWidth {
        match self {
            Self::Begin { width, .. }
            | Self::ReadFirstLane { width, .. }
            | Self::End { width, .. }
            | Self::LastUse { width, .. } => width,
        }
    }

    /// The operand `width` describes (the index for `waterfall_begin`,
    /// and the destination for all other markers).
    pub fn value(self) -> RegOperand {
        match self {
            Self::Begin { idx, .. } => idx,
            Self::ReadFirstLane { dst, .. } | Self::End { dst, .. } | Self::LastUse { dst, .. } => {
                RegOperand::def(dst)
            }
        }
    }
}

impl InstDef {
    /// Decode this instruction as a waterfall marker, if it is one.
    ///
    /// Panics if the operands don't have the shape the
    /// [`build`](crate::build) helpers for markers produce.
    pub fn waterfall_marker(&self) -> Option<Marker> {
        let Opcode::Waterfall(MarkerOpcode { kind, width }) = self.opcode else {
            return None;
        };

        let virt = |reg_operand: RegOperand| match reg_operand.reg {
            Reg::Virt(vreg) => vreg,
            Reg::Exec => unreachable!("{}: `exec` operand", kind.name()),
        };
        let reg_operand = |i: usize, is_def: bool| match self.operands.get(i) {
            Some(&Operand::Reg(reg_operand)) if reg_operand.is_def == is_def => reg_operand,
            operand => unreachable!("{}: invalid operand #{i}: {operand:?}", kind.name()),
        };
        assert_eq!(
            self.operands.len(),
            if kind == MarkerKind::Begin { 2 } else { 3 },
            "{}: wrong operand count",
            kind.name()
        );

        Some(match kind {
            MarkerKind::Begin => {
                let (token, idx) = (virt(reg_operand(0, true)), reg_operand(1, false));
                Marker::Begin { token, idx, width }
            }
            MarkerKind::ReadFirstLane => Marker::ReadFirstLane {
                token: virt(reg_operand(1, false)),
                src: reg_operand(2, false),
                dst: virt(reg_operand(0, true)),
                width,
            },
            MarkerKind::End => Marker::End {
                token: virt(reg_operand(1, false)),
                src: virt(reg_operand(2, false)),
                dst: virt(reg_operand(0, true)),
                width,
            },
            MarkerKind::LastUse => Marker::LastUse {
                token: virt(reg_operand(1, false)),
                src: virt(reg_operand(2, false)),
                dst: virt(reg_operand(0, true)),
                width,
            },
        })
    }
}

/// One waterfall region, as found by [`collect::collect_regions`].
///
/// All the instructions are in the same block, in the same relative order
/// as in this struct's fields (other than `final_inst`, see its docs).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WaterfallRegion {
    pub token: VReg,

    pub begin: Inst,
    pub read_first_lanes: SmallVec<[Inst; 2]>,
    pub ends: SmallVec<[Inst; 2]>,
    pub last_uses: SmallVec<[Inst; 2]>,

    /// The last instruction to run in the loop, i.e. the last non-marker
    /// instruction using some `waterfall_last_use` destination, or the last
    /// `waterfall_end` marker if there are no such uses (whichever is later).
    pub final_inst: Inst,
}

/// Contract violation in the waterfall markers of a function (these can only
/// be caused by a bug in whatever emitted the markers).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WaterfallError {
    pub kind: WaterfallErrorKind,

    /// Block containing `inst`.
    pub block: Block,

    /// The instruction at which the violation was detected.
    pub inst: Inst,
}

#[derive(Clone, PartialEq, Eq, Debug, derive_more::Display)]
pub enum WaterfallErrorKind {
    /// Region lacking `waterfall_readfirstlane` (if `missing` is
    /// [`MarkerKind::ReadFirstLane`]) or lacking both `waterfall_end` and
    /// `waterfall_last_use` (if `missing` is [`MarkerKind::End`]).
    #[display(fmt = "region without any `{}` markers", "missing.name()")]
    MalformedRegion { missing: MarkerKind },

    /// A marker (or use of a `waterfall_last_use` destination) belonging to a
    /// region other than the open one, or a reused token.
    #[display(
        fmt = "overlapping waterfall regions (token {:?}, open region token {:?})",
        found,
        open
    )]
    OverlappingRegions { found: VReg, open: VReg },

    /// A marker other than `waterfall_begin`, before any `waterfall_begin`.
    #[display(fmt = "`{}` marker outside of any waterfall region", "kind.name()")]
    MarkerOutsideRegion { kind: MarkerKind },
}

impl fmt::Display for WaterfallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {:?}: {}", self.block, self.inst, self.kind)
    }
}

impl std::error::Error for WaterfallError {}

/// What to do about uses of a `waterfall_last_use` destination, after a newer
/// region had already been opened (i.e. the older region would've needed to
/// extend past the start of the newer one).
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LastUseOverlap {
    /// Treat it as [`WaterfallErrorKind::OverlappingRegions`].
    #[default]
    Reject,

    /// Ignore it (the older region won't extend past the newer `waterfall_begin`).
    Unchecked,
}

#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct WaterfallConfig {
    pub last_use_overlap: LastUseOverlap,
}

impl WaterfallConfig {
    /// Parse from JSON (e.g. `{ "last-use-overlap": "unchecked" }`), with any
    /// missing fields taking their default values.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
