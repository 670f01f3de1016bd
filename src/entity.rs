//! Entity handles, their definitions (in [`EntityDefs`]), and ordered lists.
//!
//! Entities are small `Copy` handles (e.g. [`Block`], [`Inst`], [`VReg`]) which
//! index into an [`EntityDefs`] arena owned by the function they belong to.
//! Handles are never reused, so they remain stable across any structural edit
//! (removing an [`Inst`] from its block only unlinks it, its definition stays).
//!
//! [`EntityList`] is an intrusive doubly-linked list, with the links stored in
//! the definitions themselves (see [`EntityListNode`]), making it cheap to move
//! whole ranges of e.g. instructions between blocks, without copying anything.

use crate::{BlockDef, InstDef, VRegDef};
use std::fmt;
use std::num::NonZeroU32;
use std::ops::{Deref, DerefMut, Index, IndexMut};

/// Entity handle, indexing into an [`EntityDefs<Self>`] (only implemented by
/// the handle types declared with `entities!` below).
pub trait Entity: Copy + Eq + std::hash::Hash + fmt::Debug + 'static {
    type Def;

    /// Prefix used when printing the handle (e.g. `bb` for `bb3`).
    const PREFIX: &'static str;

    fn from_idx(idx: usize) -> Self;
    fn to_idx(self) -> usize;
}

macro_rules! entities {
    ($($(#[$meta:meta])* $name:ident($prefix:literal) => $def:ty),+ $(,)?) => {$(
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(NonZeroU32);

        impl Entity for $name {
            type Def = $def;

            const PREFIX: &'static str = $prefix;

            fn from_idx(idx: usize) -> Self {
                let idx = u32::try_from(idx)
                    .ok()
                    .and_then(|idx| idx.checked_add(1))
                    .and_then(NonZeroU32::new)
                    .expect(concat!("too many `", stringify!($name), "` entities"));
                Self(idx)
            }

            fn to_idx(self) -> usize {
                (self.0.get() - 1) as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", <Self as Entity>::PREFIX, Entity::to_idx(*self))
            }
        }
    )+};
}

entities! {
    /// Entity handle for a [`BlockDef`](crate::BlockDef) (a basic block).
    Block("bb") => EntityListNode<Block, BlockDef>,

    /// Entity handle for an [`InstDef`](crate::InstDef) (a machine instruction).
    Inst("inst") => EntityListNode<Inst, InstDef>,

    /// Entity handle for a [`VRegDef`](crate::VRegDef) (a virtual register).
    VReg("%") => VRegDef,
}

/// Dense arena of entity definitions, indexed by entity handles.
pub struct EntityDefs<E: Entity> {
    defs: Vec<E::Def>,
}

impl<E: Entity> Default for EntityDefs<E> {
    fn default() -> Self {
        Self { defs: vec![] }
    }
}

impl<E: Entity> Clone for EntityDefs<E>
where
    E::Def: Clone,
{
    fn clone(&self) -> Self {
        Self { defs: self.defs.clone() }
    }
}

impl<E: Entity> EntityDefs<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new entity, with `def` as its definition.
    pub fn define(&mut self, def: E::Def) -> E {
        let entity = E::from_idx(self.defs.len());
        self.defs.push(def);
        entity
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Iterate over every entity ever defined, in definition order.
    pub fn keys(&self) -> impl ExactSizeIterator<Item = E> + use<E> {
        (0..self.defs.len()).map(E::from_idx)
    }
}

impl<E: Entity> Index<E> for EntityDefs<E> {
    type Output = E::Def;

    fn index(&self, entity: E) -> &E::Def {
        &self.defs[entity.to_idx()]
    }
}

impl<E: Entity> IndexMut<E> for EntityDefs<E> {
    fn index_mut(&mut self, entity: E) -> &mut E::Def {
        &mut self.defs[entity.to_idx()]
    }
}

/// Definition wrapper for entities that can be part of an [`EntityList`],
/// holding the `prev`/`next` links alongside the "inner" definition `D`.
///
/// Derefs to `D`, so it can mostly be used as if it were `D` itself.
#[derive(Clone)]
pub struct EntityListNode<E: Copy, D> {
    prev: Option<E>,
    next: Option<E>,

    inner_def: D,
}

impl<E: Copy, D> EntityListNode<E, D> {
    /// Wrap `inner_def`, without linking it into any list.
    pub fn new(inner_def: D) -> Self {
        Self { prev: None, next: None, inner_def }
    }

    fn is_linked(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}

impl<E: Copy, D> Deref for EntityListNode<E, D> {
    type Target = D;
    fn deref(&self) -> &D {
        &self.inner_def
    }
}

impl<E: Copy, D> DerefMut for EntityListNode<E, D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.inner_def
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
struct FirstLast<E> {
    first: E,
    last: E,
}

/// Doubly-linked list, "intrusively" going through `E::Def`, which must be an
/// [`EntityListNode`] (to hold the "previous/next node" links).
///
/// Fast iteration is only offered in the forward direction (from `first`), or
/// backwards (from `last`), any other access requires following links.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EntityList<E: Entity>(Option<FirstLast<E>>);

impl<E: Entity> Default for EntityList<E> {
    fn default() -> Self {
        Self(None)
    }
}

impl<E: Entity> fmt::Debug for EntityList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("[]"),
            Some(FirstLast { first, last }) => write!(f, "[{first:?}..={last:?}]"),
        }
    }
}

impl<E: Entity<Def = EntityListNode<E, D>>, D> EntityList<E> {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(self) -> bool {
        self.0.is_none()
    }

    pub fn first(self) -> Option<E> {
        Some(self.0?.first)
    }

    pub fn last(self) -> Option<E> {
        Some(self.0?.last)
    }

    pub fn iter(self) -> EntityListIter<E> {
        EntityListIter { first: self.first(), last: self.last() }
    }

    /// Insert `new_node` (which must not be part of any list) at the start.
    #[track_caller]
    pub fn insert_first(&mut self, new_node: E, defs: &mut EntityDefs<E>) {
        match self.first() {
            Some(old_first) => self.insert_before(new_node, old_first, defs),
            None => {
                assert!(
                    !defs[new_node].is_linked(),
                    "EntityList::insert_first: new node already linked into a (different?) list"
                );
                self.0 = Some(FirstLast { first: new_node, last: new_node });
            }
        }
    }

    /// Insert `new_node` (which must not be part of any list) at the end.
    #[track_caller]
    pub fn insert_last(&mut self, new_node: E, defs: &mut EntityDefs<E>) {
        match self.last() {
            Some(old_last) => self.insert_after(new_node, old_last, defs),
            None => self.insert_first(new_node, defs),
        }
    }

    /// Insert `new_node` (which must not be part of any list) just before
    /// `next` (which must be part of this list).
    #[track_caller]
    pub fn insert_before(&mut self, new_node: E, next: E, defs: &mut EntityDefs<E>) {
        let prev = defs[next].prev;

        let new_node_def = &mut defs[new_node];
        assert!(
            !new_node_def.is_linked(),
            "EntityList::insert_before: new node already linked into a (different?) list"
        );
        new_node_def.prev = prev;
        new_node_def.next = Some(next);

        defs[next].prev = Some(new_node);
        match prev {
            Some(prev) => defs[prev].next = Some(new_node),
            None => {
                let first_last = self.0.as_mut().expect("EntityList::insert_before: empty list");
                assert!(first_last.first == next);
                first_last.first = new_node;
            }
        }
    }

    /// Insert `new_node` (which must not be part of any list) just after
    /// `prev` (which must be part of this list).
    #[track_caller]
    pub fn insert_after(&mut self, new_node: E, prev: E, defs: &mut EntityDefs<E>) {
        let next = defs[prev].next;

        let new_node_def = &mut defs[new_node];
        assert!(
            !new_node_def.is_linked(),
            "EntityList::insert_after: new node already linked into a (different?) list"
        );
        new_node_def.prev = Some(prev);
        new_node_def.next = next;

        defs[prev].next = Some(new_node);
        match next {
            Some(next) => defs[next].prev = Some(new_node),
            None => {
                let first_last = self.0.as_mut().expect("EntityList::insert_after: empty list");
                assert!(first_last.last == prev);
                first_last.last = new_node;
            }
        }
    }

    /// Unlink `node` (which must be part of this list), leaving its definition
    /// otherwise intact (and free to be inserted into another list).
    pub fn remove(&mut self, node: E, defs: &mut EntityDefs<E>) {
        self.extract_range(node, node, defs);
    }

    /// Detach the `first..=last` range (which must be part of this list, with
    /// `first` not after `last`), returning it as its own list.
    pub fn extract_range(&mut self, first: E, last: E, defs: &mut EntityDefs<E>) -> Self {
        let prev = defs[first].prev.take();
        let next = defs[last].next.take();

        if let Some(prev) = prev {
            defs[prev].next = next;
        }
        if let Some(next) = next {
            defs[next].prev = prev;
        }

        let first_last = self.0.expect("EntityList::extract_range: empty list");
        self.0 = match (prev, next) {
            (None, None) => None,
            (Some(prev), None) => Some(FirstLast { first: first_last.first, last: prev }),
            (None, Some(next)) => Some(FirstLast { first: next, last: first_last.last }),
            (Some(_), Some(_)) => Some(first_last),
        };

        Self(Some(FirstLast { first, last }))
    }

    /// Detach every node after `node` (which must be part of this list).
    pub fn split_off_after(&mut self, node: E, defs: &mut EntityDefs<E>) -> Self {
        match (defs[node].next, self.last()) {
            (Some(next), Some(last)) => self.extract_range(next, last, defs),
            _ => Self::empty(),
        }
    }

    /// Move all of `list_to_append`'s contents to the end of this list.
    pub fn append(&mut self, list_to_append: Self, defs: &mut EntityDefs<E>) {
        let Some(appended) = list_to_append.0 else {
            return;
        };
        match &mut self.0 {
            None => self.0 = Some(appended),
            Some(first_last) => {
                assert!(defs[first_last.last].next.is_none());
                assert!(defs[appended.first].prev.is_none());
                defs[first_last.last].next = Some(appended.first);
                defs[appended.first].prev = Some(first_last.last);
                first_last.last = appended.last;
            }
        }
    }

    /// Move all of `list_to_prepend`'s contents to the start of this list.
    pub fn prepend(&mut self, list_to_prepend: Self, defs: &mut EntityDefs<E>) {
        let mut list = list_to_prepend;
        list.append(*self, defs);
        *self = list;
    }
}

/// [`EntityList<E>`] iterator, but with a different API than [`Iterator`].
///
/// This can also be considered a (non-random-access) "subslice" of the list.
#[derive(Copy, Clone)]
pub struct EntityListIter<E: Entity> {
    pub first: Option<E>,
    pub last: Option<E>,
}

impl<E: Entity<Def = EntityListNode<E, D>>, D> EntityListIter<E> {
    pub fn split_first(self, defs: &EntityDefs<E>) -> Option<(E, Self)> {
        let Self { first, last } = self;
        let current = first?;
        let next = if Some(current) == last { None } else { defs[current].next };
        Some((current, Self { first: next, last: next.and(last) }))
    }

    pub fn split_last(self, defs: &EntityDefs<E>) -> Option<(E, Self)> {
        let Self { first, last } = self;
        let current = last?;
        let prev = if Some(current) == first { None } else { defs[current].prev };
        Some((current, Self { first: prev.and(first), last: prev }))
    }
}

// NOTE: `NonZeroU32` handles keep `Option<Inst>` (used for links) small.
const _: () = assert!(std::mem::size_of::<Option<Inst>>() == 4);
