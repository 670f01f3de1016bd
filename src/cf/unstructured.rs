//! Control-flow graph (CFG) analyses, over [`BlockDef::succs`](crate::BlockDef::succs).

use crate::{Block, FuncBody, FxIndexMap, FxIndexSet};
use itertools::Either;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

impl FuncBody {
    /// Iterate over all the [`Block`]s reachable from the entry block, in
    /// reverse post-order (RPO).
    ///
    /// RPO iteration over a CFG provides certain guarantees, most importantly
    /// that dominators are visited before the entire subgraph they dominate.
    pub fn rev_post_order(&self) -> impl DoubleEndedIterator<Item = Block> + use<> {
        let mut post_order = SmallVec::<[_; 8]>::new();
        self.traverse_whole_func(&mut TraversalState {
            incoming_edge_counts: FxHashMap::default(),

            pre_order_visit: |_| {},
            post_order_visit: |block| post_order.push(block),

            // NOTE: paired with the final `.rev()`, this keeps successors
            // in `succs` order (other than for already visited blocks).
            reverse_targets: true,
        });
        post_order.into_iter().rev()
    }

    /// Compute the predecessors of every reachable block (in `succs` order,
    /// with one entry per edge, i.e. possibly containing duplicates).
    pub fn predecessors(&self) -> FxIndexMap<Block, SmallVec<[Block; 2]>> {
        let mut preds = FxIndexMap::<_, SmallVec<_>>::default();
        self.traverse_whole_func(&mut TraversalState {
            incoming_edge_counts: FxHashMap::default(),

            pre_order_visit: |block| {
                preds.entry(block).or_default();
            },
            post_order_visit: |_| {},

            reverse_targets: false,
        });
        for block in preds.keys().copied().collect::<SmallVec<[_; 8]>>() {
            for &succ in &self.blocks[block].succs {
                preds.entry(succ).or_default().push(block);
            }
        }
        preds
    }
}

// HACK: private module, only to keep `IncomingEdgeCount`'s field private.
mod sealed {
    /// Number of CFG edges found (so far) into some [`Block`](crate::Block).
    ///
    /// Only obtainable from [`IncomingEdgeCount::ONE`] and additions.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IncomingEdgeCount(usize);

    impl IncomingEdgeCount {
        pub const ONE: Self = Self(1);
    }

    impl std::ops::Add for IncomingEdgeCount {
        type Output = Self;
        fn add(self, other: Self) -> Self {
            Self(self.0 + other.0)
        }
    }

    impl std::ops::AddAssign for IncomingEdgeCount {
        fn add_assign(&mut self, other: Self) {
            *self = *self + other;
        }
    }
}
pub use sealed::IncomingEdgeCount;

pub struct TraversalState<PreVisit: FnMut(Block), PostVisit: FnMut(Block)> {
    pub incoming_edge_counts: FxHashMap<Block, IncomingEdgeCount>,
    pub pre_order_visit: PreVisit,
    pub post_order_visit: PostVisit,

    pub reverse_targets: bool,
}

impl FuncBody {
    pub fn traverse_whole_func(
        &self,
        state: &mut TraversalState<impl FnMut(Block), impl FnMut(Block)>,
    ) {
        if let Some(entry) = self.entry_block() {
            self.traverse(entry, state);
        }
    }

    fn traverse(
        &self,
        block: Block,
        state: &mut TraversalState<impl FnMut(Block), impl FnMut(Block)>,
    ) {
        if let Some(existing_count) = state.incoming_edge_counts.get_mut(&block) {
            *existing_count += IncomingEdgeCount::ONE;
            return;
        }
        state.incoming_edge_counts.insert(block, IncomingEdgeCount::ONE);

        (state.pre_order_visit)(block);

        let targets = self.blocks[block].succs.iter().copied();
        let targets = if state.reverse_targets {
            Either::Left(targets.rev())
        } else {
            Either::Right(targets)
        };
        for target in targets {
            self.traverse(target, state);
        }

        (state.post_order_visit)(block);
    }
}

/// Loop detection, as the SCCs (strongly connected components) of the CFG,
/// found with Tarjan's algorithm and then again inside each SCC (minus its
/// header), to also find nested loops.
///
/// A single block branching to itself (e.g. a waterfall loop) is also a loop.
pub struct LoopFinder<'a> {
    func: &'a FuncBody,

    loop_header_to_exit_targets: FxIndexMap<Block, FxIndexSet<Block>>,

    /// Blocks visited by the DFS but not yet assigned to a completed SCC,
    /// in visit order (SCCs on this stack are sequential, never nested).
    scc_stack: Vec<Block>,
    scc_state: FxHashMap<Block, SccState>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SccStackIdx(u32);

#[derive(Copy, Clone, PartialEq, Eq)]
enum SccState {
    /// On `scc_stack`, at this index.
    Pending(SccStackIdx),

    /// Popped off `scc_stack` (either its SCC was completed, or it's acyclic).
    Complete,
}

impl<'a> LoopFinder<'a> {
    pub fn new(func: &'a FuncBody) -> Self {
        Self {
            func,
            loop_header_to_exit_targets: FxIndexMap::default(),
            scc_stack: vec![],
            scc_state: FxHashMap::default(),
        }
    }

    /// Map every loop header reachable from `entry` to that loop's exit targets.
    pub fn find_all_loops_starting_at(
        mut self,
        entry: Block,
    ) -> FxIndexMap<Block, FxIndexSet<Block>> {
        self.find_earliest_scc_root_of(entry);
        self.loop_header_to_exit_targets
    }

    /// Tarjan's `lowlink`: the `scc_stack` index of the earliest pending block
    /// reachable from `node`, which is `node`'s own index iff `node` heads a
    /// loop (`None` means `node` can't reach any pending block, not even itself).
    fn find_earliest_scc_root_of(&mut self, node: Block) -> Option<SccStackIdx> {
        match self.scc_state.get(&node) {
            Some(&SccState::Pending(scc_stack_idx)) => return Some(scc_stack_idx),
            Some(SccState::Complete) => return None,
            None => {}
        }
        let scc_stack_idx = SccStackIdx(
            self.scc_stack.len().try_into().expect("LoopFinder: more than `u32::MAX` blocks"),
        );
        self.scc_stack.push(node);
        self.scc_state.insert(node, SccState::Pending(scc_stack_idx));

        let func = self.func;
        let earliest_scc_root = func.blocks[node]
            .succs
            .iter()
            .flat_map(|&target| self.find_earliest_scc_root_of(target))
            .min();

        // `node` heads a loop made of itself and everything above it on the stack.
        if earliest_scc_root == Some(scc_stack_idx) {
            let scc_start = scc_stack_idx.0 as usize;

            // Exits are edges into blocks that are no longer pending.
            let target_is_exit = |target| match self.scc_state[&target] {
                SccState::Pending(i) => {
                    assert!(i >= scc_stack_idx);
                    false
                }
                SccState::Complete => true,
            };
            self.loop_header_to_exit_targets.insert(
                node,
                self.scc_stack[scc_start..]
                    .iter()
                    .flat_map(|&scc_node| func.blocks[scc_node].succs.iter().copied())
                    .filter(|&target| target_is_exit(target))
                    .collect(),
            );

            // Nested loops: revisit the body, with the header (and everything
            // outside the loop) already complete, so backedges are ignored.
            self.scc_state.insert(node, SccState::Complete);
            let loop_body_range = scc_start + 1..self.scc_stack.len();
            for &scc_node in &self.scc_stack[loop_body_range.clone()] {
                self.scc_state.remove(&scc_node);
            }
            for i in loop_body_range.clone() {
                self.find_earliest_scc_root_of(self.scc_stack[i]);
            }
            assert_eq!(self.scc_stack.len(), loop_body_range.end);

            self.scc_stack.truncate(scc_start);

            return None;
        }

        // Acyclic.
        if earliest_scc_root.is_none() {
            assert!(self.scc_stack.pop() == Some(node));
            self.scc_state.insert(node, SccState::Complete);
        }

        earliest_scc_root
    }
}
