//! Plain-text printing of [`FuncBody`]s (and their leaves).
//!
//! The syntax loosely follows LLVM's machine IR, e.g.:
//!
//! ```text
//! bb0:
//!     %2 = v_or_b32 %0, killed %1.sub1
//!     exec = s_xor_b64 exec, %3
//!     s_cbranch_execnz bb0
//!     ; succs: bb0, bb1
//! ```

use crate::func_at::FuncAt;
use crate::{Block, FuncBody, Opcode, Operand, Reg, RegOperand, SubReg};
use itertools::Itertools as _;
use std::fmt;

impl fmt::Display for FuncBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, func_at_block) in self.at(self.layout).into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            func_at_block.fmt(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for FuncAt<'_, Block> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?}:", self.position)?;
        for func_at_inst in self.at_insts() {
            let inst_def = func_at_inst.def();

            let mut defs = inst_def.defs().peekable();
            let mut inputs = inst_def
                .operands
                .iter()
                .filter(|operand| !matches!(operand, Operand::Reg(RegOperand { is_def: true, .. })))
                .peekable();

            write!(f, "    ")?;
            if defs.peek().is_some() {
                write!(f, "{} = ", defs.format(", "))?;
            }
            write!(f, "{}", inst_def.opcode)?;
            if inputs.peek().is_some() {
                write!(f, " {}", inputs.format(", "))?;
            }
            writeln!(f)?;
        }

        let succs = &self.def().succs;
        if !succs.is_empty() {
            let succs = succs.iter().map(|succ| format!("{succ:?}")).join(", ");
            writeln!(f, "    ; succs: {succs}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Phi => "phi",
            Opcode::ImplicitDef => "implicit_def",
            Opcode::RegSequence => "reg_sequence",
            Opcode::VMovB32 => "v_mov_b32",
            Opcode::VOrB32 => "v_or_b32",
            Opcode::VReadFirstLaneB32 => "v_readfirstlane_b32",
            Opcode::VCmpEqU32 => "v_cmp_eq_u32",
            Opcode::SMovB64 => "s_mov_b64",
            Opcode::SAndB64 => "s_and_b64",
            Opcode::SXorB64 => "s_xor_b64",
            Opcode::SAndSaveExecB64 => "s_and_saveexec_b64",
            Opcode::SCBranchExecNz => "s_cbranch_execnz",
            Opcode::Waterfall(marker) => return marker.fmt(f),
            Opcode::Opaque(name) => name,
        };
        f.write_str(name)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg_operand) => reg_operand.fmt(f),
            Operand::Imm(imm) => imm.fmt(f),
            Operand::Block(block) => write!(f, "{block:?}"),
        }
    }
}

impl fmt::Display for RegOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let &Self { reg, sub_reg, is_def: _, is_kill, is_undef } = self;
        if is_kill {
            f.write_str("killed ")?;
        }
        if is_undef {
            f.write_str("undef ")?;
        }
        reg.fmt(f)?;
        if let Some(sub_reg) = sub_reg {
            write!(f, ".{sub_reg}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Virt(vreg) => write!(f, "{vreg:?}"),
            Reg::Exec => f.write_str("exec"),
        }
    }
}

impl fmt::Display for SubReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}
