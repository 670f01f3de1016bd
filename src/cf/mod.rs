//! Control-flow abstractions and structural edits.
//!
//! All edits here are plain `&mut FuncBody` operations, which only ever move
//! (never duplicate) instructions between blocks, and keep every existing
//! [`Block`]/[`Inst`] handle valid.

use crate::{Block, EntityListNode, FuncBody, Inst, Opcode, Operand};
use smallvec::SmallVec;

// NOTE: all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod unstructured;

impl FuncBody {
    /// Create a new (empty, without successors) block, placed right after
    /// `prev` in function order.
    pub fn insert_block_after(&mut self, prev: Block) -> Block {
        let block = self.blocks.define(EntityListNode::new(Default::default()));
        self.layout.insert_after(block, prev, &mut self.blocks);
        block
    }

    /// Move the `first..=last` range of `from`'s instructions to the end of `to`.
    pub fn move_inst_range(&mut self, from: Block, first: Inst, last: Inst, to: Block) {
        assert_ne!(from, to);

        let range = self.blocks[from].insts.extract_range(first, last, &mut self.insts);
        self.blocks[to].insts.append(range, &mut self.insts);
    }

    /// Move all of `from`'s instructions after `after` to the end of `to`.
    pub fn move_insts_after(&mut self, from: Block, after: Inst, to: Block) {
        assert_ne!(from, to);

        let tail = self.blocks[from].insts.split_off_after(after, &mut self.insts);
        self.blocks[to].insts.append(tail, &mut self.insts);
    }

    /// Make `to` take over all of `from`'s successors (leaving `from` without
    /// any), and update `phi`s in those successors to name `to` as the
    /// incoming block, instead of `from`.
    pub fn transfer_successors(&mut self, from: Block, to: Block) {
        let succs = std::mem::take(&mut self.blocks[from].succs);

        let mut visited = SmallVec::<[Block; 2]>::new();
        for &succ in &succs {
            if visited.contains(&succ) {
                continue;
            }
            visited.push(succ);

            let mut func_at_insts = self.at_mut(succ).at_insts().into_iter();
            while let Some(func_at_inst) = func_at_insts.next() {
                let inst_def = func_at_inst.def();
                if inst_def.opcode != Opcode::Phi {
                    // `phi`s are always grouped at the start of a block.
                    break;
                }
                for operand in &mut inst_def.operands {
                    if *operand == Operand::Block(from) {
                        *operand = Operand::Block(to);
                    }
                }
            }
        }

        self.blocks[to].succs = succs;
    }

    /// Unlink `inst` from `block` (its definition remains, but is unreachable).
    pub fn remove_inst(&mut self, block: Block, inst: Inst) {
        self.blocks[block].insts.remove(inst, &mut self.insts);
    }
}
