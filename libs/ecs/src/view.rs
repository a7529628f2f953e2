// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::entity::EntityId;
use crate::sparse_set::SparseSet;
use crate::world::{Component, World};
use core::any::TypeId;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// A component tuple a [`View`] iterates over. Implemented for tuples of up
/// to four distinct component types.
pub trait ViewSet {
    type Item<'a>;

    /// The TypeIds of the tuple, used to reject aliased views.
    fn type_ids() -> Vec<TypeId>;

    /// The pools backing the tuple, in tuple order. `None` when some
    /// component has no pool yet (the view is then empty).
    fn pools(world: &World) -> Option<Vec<NonNull<SparseSet>>>;

    /// Fetches the tuple of references for an entity present in all pools.
    ///
    /// # Safety
    ///
    /// The caller must hold the world mutably for `'a` and guarantee `id`
    /// is contained in every pool.
    unsafe fn fetch<'a>(pools: &[NonNull<SparseSet>], id: EntityId) -> Self::Item<'a>;
}

/// An iterator over all entities carrying every component of `V`.
///
/// The smallest pool drives the iteration; entities missing from any other
/// pool are skipped. Yields `(EntityId, (&mut A, &mut B, ...))`. Reads do
/// not invalidate the view, but emplacing or removing components of the
/// iterated types mid-iteration is forbidden by contract (the exclusive
/// world borrow enforces this in safe code).
pub struct View<'w, V: ViewSet> {
    pools: Vec<NonNull<SparseSet>>,
    driver: usize,
    cursor: usize,
    _marker: PhantomData<(&'w mut World, V)>,
}

impl<'w, V: ViewSet> View<'w, V> {
    pub(crate) fn new(world: &'w mut World) -> Self {
        let type_ids = V::type_ids();
        for (i, a) in type_ids.iter().enumerate() {
            for b in &type_ids[i + 1..] {
                assert!(a != b, "view over duplicate component types");
            }
        }

        let Some(pools) = V::pools(world) else {
            return Self {
                pools: Vec::new(),
                driver: 0,
                cursor: 0,
                _marker: PhantomData,
            };
        };

        // The smallest pool drives; every yielded entity must be in all of
        // them anyway.
        let driver = pools
            .iter()
            .enumerate()
            // Safety: the pools borrow from the exclusively borrowed world.
            .min_by_key(|(_, pool)| unsafe { pool.as_ref() }.len())
            .map_or(0, |(index, _)| index);

        Self {
            pools,
            driver,
            cursor: 0,
            _marker: PhantomData,
        }
    }
}

impl<'w, V: ViewSet> Iterator for View<'w, V> {
    type Item = (EntityId, V::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pools.is_empty() {
            return None;
        }
        loop {
            // Safety: the pools borrow from the exclusively borrowed world.
            let driver = unsafe { self.pools[self.driver].as_ref() };
            let id = *driver.dense().get(self.cursor)?;
            self.cursor += 1;

            // Safety: as above.
            let all_contain = self
                .pools
                .iter()
                .all(|pool| unsafe { pool.as_ref() }.contains(id));
            if all_contain {
                // Safety: the view holds the world's exclusive borrow, the
                // component types are distinct and id is in every pool.
                return Some((id, unsafe { V::fetch(&self.pools, id) }));
            }
        }
    }
}

macro_rules! impl_view_set {
    ($(($T:ident, $index:tt)),+) => {
        impl<$($T: Component),+> ViewSet for ($($T,)+) {
            type Item<'a> = ($(&'a mut $T,)+);

            fn type_ids() -> Vec<TypeId> {
                vec![$(TypeId::of::<$T>()),+]
            }

            fn pools(world: &World) -> Option<Vec<NonNull<SparseSet>>> {
                Some(vec![$(NonNull::from(world.pool::<$T>()?)),+])
            }

            unsafe fn fetch<'a>(pools: &[NonNull<SparseSet>], id: EntityId) -> Self::Item<'a> {
                // Safety: forwarded from the caller; tuple types are
                // distinct so the references do not alias.
                unsafe { ($(pools[$index].as_ref().get_mut_unchecked::<$T>(id),)+) }
            }
        }
    };
}

impl_view_set!((A, 0));
impl_view_set!((A, 0), (B, 1));
impl_view_set!((A, 0), (B, 1), (C, 2));
impl_view_set!((A, 0), (B, 1), (C, 2), (D, 3));
