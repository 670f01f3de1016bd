//! Register-class/width queries, and the fixed target this crate lowers for.

use crate::{RegClass, SubReg};

/// Number of 32-bit chunks in `exec` (and any [`RegClass::LaneMask`] register).
pub const EXEC_CHUNKS: u32 = 2;

/// Query-only view of the target's register classes, in terms of "chunks"
/// (fixed-size 32-bit register pieces).
pub trait RegClassInfo {
    /// How many chunks a register of `class` occupies.
    fn chunk_count(&self, class: RegClass) -> u32;

    /// The [`SubReg`] naming chunk `chunk` of any multi-chunk register.
    fn sub_reg(&self, chunk: u32) -> SubReg;

    /// The class holding lane-uniform values of the same width as `class`.
    fn uniform_class_of(&self, class: RegClass) -> RegClass;

    /// The class of a single chunk of a `class` register.
    fn chunk_class_of(&self, class: RegClass) -> RegClass;
}

/// 64-lane target, where `exec` is a pair of 32-bit scalar registers.
#[derive(Copy, Clone, Default, Debug)]
pub struct Wave64;

impl Wave64 {
    pub const LANES: u32 = 64;

    /// Widest supported register, in chunks.
    pub const MAX_CHUNKS: u32 = 8;
}

impl RegClassInfo for Wave64 {
    fn chunk_count(&self, class: RegClass) -> u32 {
        match class {
            RegClass::Vector { chunks } | RegClass::Scalar { chunks } => {
                assert!(
                    (1..=Self::MAX_CHUNKS).contains(&chunks),
                    "Wave64: unsupported register width ({chunks} chunks)"
                );
                chunks
            }
            RegClass::LaneMask => EXEC_CHUNKS,
        }
    }

    fn sub_reg(&self, chunk: u32) -> SubReg {
        assert!(chunk < Self::MAX_CHUNKS, "Wave64: no `sub{chunk}` sub-register");
        SubReg(chunk as u8)
    }

    fn uniform_class_of(&self, class: RegClass) -> RegClass {
        match class {
            RegClass::Vector { chunks } | RegClass::Scalar { chunks } => {
                RegClass::Scalar { chunks }
            }
            RegClass::LaneMask => RegClass::Scalar { chunks: EXEC_CHUNKS },
        }
    }

    fn chunk_class_of(&self, class: RegClass) -> RegClass {
        match class {
            RegClass::Vector { .. } => RegClass::Vector { chunks: 1 },
            RegClass::Scalar { .. } | RegClass::LaneMask => RegClass::Scalar { chunks: 1 },
        }
    }
}
