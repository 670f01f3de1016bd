//! Traversal helpers for intra-function entities.
//!
//! [`FuncAt<P>`]/[`FuncAtMut<P>`] are like `(&FuncBody, P)`/`(&mut FuncBody, P`)
//! (where `P` is some type describing a "position" in the function), except:
//! * they only borrow the [`EntityDefs`] fields of [`FuncBody`] that hold
//!   blocks and instructions
//!   * this can prevent borrow conflicts, especially when mutating other fields
//!     (e.g. creating new virtual registers while iterating over instructions)
//!   * it also avoids accidentally accessing parts of the function definition
//!     without going through `P` (as [`EntityDefs`] requires keys for any access)
//! * they're dedicated types with inherent methods and trait `impl`s

// NOTE: wrong wrt lifetimes (https://github.com/rust-lang/rust-clippy/issues/5004).
#![allow(clippy::should_implement_trait)]

use crate::{Block, BlockDef, EntityDefs, EntityList, EntityListIter, FuncBody, Inst, InstDef};

/// Immutable traversal (i.e. visiting) helper for intra-function entities.
///
/// The point/position type `P` should be an entity or a shallow entity wrapper
/// (e.g. [`EntityList<Inst>`]).
#[derive(Copy, Clone)]
pub struct FuncAt<'a, P: Copy> {
    pub blocks: &'a EntityDefs<Block>,
    pub insts: &'a EntityDefs<Inst>,

    pub position: P,
}

impl<'a, P: Copy> FuncAt<'a, P> {
    /// Reposition to `new_position`.
    pub fn at<P2: Copy>(self, new_position: P2) -> FuncAt<'a, P2> {
        FuncAt { blocks: self.blocks, insts: self.insts, position: new_position }
    }
}

impl<'a> IntoIterator for FuncAt<'a, EntityList<Block>> {
    type IntoIter = FuncAt<'a, EntityListIter<Block>>;
    type Item = FuncAt<'a, Block>;
    fn into_iter(self) -> Self::IntoIter {
        self.at(self.position.iter())
    }
}

impl<'a> Iterator for FuncAt<'a, EntityListIter<Block>> {
    type Item = FuncAt<'a, Block>;
    fn next(&mut self) -> Option<Self::Item> {
        let (next, rest) = self.position.split_first(self.blocks)?;
        self.position = rest;
        Some(self.at(next))
    }
}

impl<'a> FuncAt<'a, Block> {
    pub fn def(self) -> &'a BlockDef {
        &self.blocks[self.position]
    }

    pub fn at_insts(self) -> FuncAt<'a, EntityList<Inst>> {
        self.at(self.def().insts)
    }
}

impl<'a> IntoIterator for FuncAt<'a, EntityList<Inst>> {
    type IntoIter = FuncAt<'a, EntityListIter<Inst>>;
    type Item = FuncAt<'a, Inst>;
    fn into_iter(self) -> Self::IntoIter {
        self.at(self.position.iter())
    }
}

impl<'a> Iterator for FuncAt<'a, EntityListIter<Inst>> {
    type Item = FuncAt<'a, Inst>;
    fn next(&mut self) -> Option<Self::Item> {
        let (next, rest) = self.position.split_first(self.insts)?;
        self.position = rest;
        Some(self.at(next))
    }
}

impl DoubleEndedIterator for FuncAt<'_, EntityListIter<Inst>> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let (prev, rest) = self.position.split_last(self.insts)?;
        self.position = rest;
        Some(self.at(prev))
    }
}

impl<'a> FuncAt<'a, Inst> {
    pub fn def(self) -> &'a InstDef {
        &self.insts[self.position]
    }
}

/// Mutable traversal (i.e. transforming) helper for intra-function entities.
///
/// The point/position type `P` should be an entity or a shallow entity wrapper
/// (e.g. [`EntityList<Inst>`]).
pub struct FuncAtMut<'a, P: Copy> {
    pub blocks: &'a mut EntityDefs<Block>,
    pub insts: &'a mut EntityDefs<Inst>,

    pub position: P,
}

impl<'a, P: Copy> FuncAtMut<'a, P> {
    /// Emulate a "reborrow", which is automatic only for `&mut` types.
    pub fn reborrow(&mut self) -> FuncAtMut<'_, P> {
        FuncAtMut { blocks: self.blocks, insts: self.insts, position: self.position }
    }

    /// Reposition to `new_position`.
    pub fn at<P2: Copy>(self, new_position: P2) -> FuncAtMut<'a, P2> {
        FuncAtMut { blocks: self.blocks, insts: self.insts, position: new_position }
    }

    /// Demote to a `FuncAt`, with the same `position`.
    pub fn freeze(self) -> FuncAt<'a, P> {
        let FuncAtMut { blocks, insts, position } = self;
        FuncAt { blocks, insts, position }
    }
}

impl<'a> FuncAtMut<'a, Block> {
    pub fn def(self) -> &'a mut BlockDef {
        &mut self.blocks[self.position]
    }

    pub fn at_insts(mut self) -> FuncAtMut<'a, EntityList<Inst>> {
        let insts = self.reborrow().def().insts;
        self.at(insts)
    }
}

// HACK: can't implement `IntoIterator` because `next` borrows `self`.
impl<'a> FuncAtMut<'a, EntityList<Inst>> {
    pub fn into_iter(self) -> FuncAtMut<'a, EntityListIter<Inst>> {
        let iter = self.position.iter();
        self.at(iter)
    }
}

// HACK: can't implement `Iterator` because `next` borrows `self`.
impl FuncAtMut<'_, EntityListIter<Inst>> {
    pub fn next(&mut self) -> Option<FuncAtMut<'_, Inst>> {
        let (next, rest) = self.position.split_first(self.insts)?;
        self.position = rest;
        Some(self.reborrow().at(next))
    }
}

impl<'a> FuncAtMut<'a, Inst> {
    pub fn def(self) -> &'a mut InstDef {
        &mut self.insts[self.position]
    }
}

impl FuncBody {
    /// Start immutably traversing the function at `position`.
    pub fn at<P: Copy>(&self, position: P) -> FuncAt<'_, P> {
        FuncAt { blocks: &self.blocks, insts: &self.insts, position }
    }

    /// Start mutably traversing the function at `position`.
    pub fn at_mut<P: Copy>(&mut self, position: P) -> FuncAtMut<'_, P> {
        FuncAtMut { blocks: &mut self.blocks, insts: &mut self.insts, position }
    }
}
