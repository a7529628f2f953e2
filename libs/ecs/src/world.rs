// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::entity::{EntityId, RESERVED_INDEX};
use crate::sparse_set::SparseSet;
use crate::view::{View, ViewSet};
use core::any::TypeId;
use core::fmt;
use std::collections::HashMap;
use std::io;
use vane_stream::{ReadExt, StreamError, WriteExt};

/// A value that can live in a component pool.
///
/// Components carry their own wire format so that worlds can round-trip
/// through vpak `World` entries; the world serializer writes values in
/// dense order and replays them through `decode`.
pub trait Component: Sized + 'static {
    fn encode(&self, writer: &mut dyn io::Write) -> Result<(), StreamError>;
    fn decode(reader: &mut dyn io::Read) -> Result<Self, StreamError>;
}

/// Errors produced when reading a serialized world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldError {
    /// The data references a component index that is not registered here.
    InvalidComponent,
    /// The underlying stream failed.
    Stream(StreamError),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::InvalidComponent => f.write_str("unknown component in serialized world"),
            WorldError::Stream(err) => write!(f, "stream error: {err}"),
        }
    }
}

impl core::error::Error for WorldError {}

impl From<StreamError> for WorldError {
    fn from(err: StreamError) -> Self {
        WorldError::Stream(err)
    }
}

struct Registration {
    type_id: TypeId,
    make_pool: fn() -> SparseSet,
    pool: Option<SparseSet>,
}

/// The entity/component store.
///
/// Entity slots are recycled through a free list threaded through the index
/// bits of dead slots, bumping the version each time so stale ids stay
/// invalid. Component pools are ordered by registration, which fixes the
/// component indices used by the serialized form; engines that persist
/// worlds must register their components in a deterministic order before
/// deserializing.
///
/// The world is single-threaded by contract: systems that mutate it run
/// serially or provide their own guarding.
#[derive(Default)]
pub struct World {
    entities: Vec<EntityId>,
    free_head: u32,
    registrations: Vec<Registration>,
    component_ids: HashMap<TypeId, usize>,
}

impl World {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            free_head: RESERVED_INDEX,
            registrations: Vec::new(),
            component_ids: HashMap::new(),
        }
    }

    // === entities ===

    /// Allocates an entity id, recycling a destroyed slot if one exists.
    pub fn create(&mut self) -> EntityId {
        if self.free_head != RESERVED_INDEX {
            let index = self.free_head;
            let slot = self.entities[index as usize];
            // Dead slots link to the next free index through their index
            // bits and keep the (already bumped) version.
            self.free_head = slot.index();
            let id = EntityId::new(index, slot.version());
            self.entities[index as usize] = id;
            return id;
        }

        let index = u32::try_from(self.entities.len()).expect("entity index overflow");
        assert!(index < RESERVED_INDEX, "out of entity indices");
        let id = EntityId::new(index, 0);
        self.entities.push(id);
        id
    }

    /// Destroys an entity, removing all of its components.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not valid (double destroy included).
    pub fn destroy(&mut self, id: EntityId) {
        assert!(self.is_valid(id), "destroyed an invalid entity");
        for registration in &mut self.registrations {
            if let Some(pool) = &mut registration.pool
                && pool.contains(id)
            {
                pool.remove(id);
            }
        }

        let index = id.index();
        self.entities[index as usize] =
            EntityId::new(self.free_head, id.version().wrapping_add(1));
        self.free_head = index;
    }

    /// An id is valid iff its slot still holds exactly this id.
    pub fn is_valid(&self, id: EntityId) -> bool {
        let index = id.index() as usize;
        index < self.entities.len() && self.entities[index] == id
    }

    /// Number of entity slots ever allocated (live or recycled).
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // === components ===

    /// Registers `T`, assigning it the next component index. Registration
    /// order is what the serialized form refers to, so engines register
    /// builtin components in a fixed order. Idempotent.
    pub fn register<T: Component>(&mut self) -> usize {
        if let Some(&id) = self.component_ids.get(&TypeId::of::<T>()) {
            return id;
        }
        let id = self.registrations.len();
        self.registrations.push(Registration {
            type_id: TypeId::of::<T>(),
            make_pool: SparseSet::new::<T>,
            pool: None,
        });
        self.component_ids.insert(TypeId::of::<T>(), id);
        tracing::trace!(component = core::any::type_name::<T>(), id, "registered component");
        id
    }

    fn pool_index<T: Component>(&self) -> Option<usize> {
        self.component_ids.get(&TypeId::of::<T>()).copied()
    }

    pub(crate) fn pool<T: Component>(&self) -> Option<&SparseSet> {
        self.registrations[self.pool_index::<T>()?].pool.as_ref()
    }

    fn pool_mut_or_create<T: Component>(&mut self) -> &mut SparseSet {
        let index = match self.pool_index::<T>() {
            Some(index) => index,
            None => self.register::<T>(),
        };
        let registration = &mut self.registrations[index];
        debug_assert_eq!(registration.type_id, TypeId::of::<T>());
        registration
            .pool
            .get_or_insert_with(registration.make_pool)
    }

    /// Attaches a component value to an entity.
    ///
    /// # Panics
    ///
    /// Panics if `id` is invalid or already has a `T`.
    pub fn emplace<T: Component>(&mut self, id: EntityId, value: T) {
        assert!(self.is_valid(id), "emplace on an invalid entity");
        self.pool_mut_or_create::<T>().emplace(id, value);
    }

    /// Removes `T` from an entity.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not have a `T`.
    pub fn remove<T: Component>(&mut self, id: EntityId) {
        let pool = self
            .pool_index::<T>()
            .and_then(|index| self.registrations[index].pool.as_mut())
            .expect("removed an unregistered component");
        pool.remove(id);
    }

    pub fn has<T: Component>(&self, id: EntityId) -> bool {
        self.pool::<T>().is_some_and(|pool| pool.contains(id))
    }

    pub fn get<T: Component>(&self, id: EntityId) -> Option<&T> {
        self.pool::<T>()?.get(id)
    }

    pub fn get_mut<T: Component>(&mut self, id: EntityId) -> Option<&mut T> {
        let index = self.pool_index::<T>()?;
        self.registrations[index].pool.as_mut()?.get_mut(id)
    }

    /// Iterates entities that have every component in `V`, yielding mutable
    /// references. Structural mutation (emplace/remove on the iterated
    /// pools) during iteration is forbidden.
    pub fn view<V: ViewSet>(&mut self) -> View<'_, V> {
        View::new(self)
    }

    // === serialization ===

    /// Writes the world in the vpak `World` entry layout: the entity count,
    /// the pool count, then per pool the value data in dense order followed
    /// by the dense entity ids.
    pub fn serialize(&self, writer: &mut dyn io::Write) -> Result<(), StreamError> {
        let mut out = writer;
        out.write_varint_u32(u32::try_from(self.entities.len()).expect("entity count overflow"))?;
        out.write_varint_u32(
            u32::try_from(self.registrations.len()).expect("component count overflow"),
        )?;

        for registration in &self.registrations {
            let Some(pool) = &registration.pool else {
                out.write_varint_u32(0)?;
                continue;
            };
            out.write_varint_u32(u32::try_from(pool.len()).expect("pool size overflow"))?;
            if pool.is_empty() {
                continue;
            }
            pool.encode_values(&mut *out)?;
            for id in pool.dense() {
                out.write_varint_u32(id.to_raw())?;
            }
        }
        Ok(())
    }

    /// Reads a world serialized by [`Self::serialize`] into `self`.
    ///
    /// The same components must already be registered, in the same order as
    /// when the data was written; a set index with no local registration
    /// fails with [`WorldError::InvalidComponent`]. Existing entities and
    /// components are replaced.
    ///
    /// # Errors
    ///
    /// Returns `InvalidComponent` on a component index mismatch and
    /// `Stream` on malformed data.
    pub fn deserialize(&mut self, reader: &mut dyn io::Read) -> Result<(), WorldError> {
        let mut input = reader;

        let entity_count = input.read_varint_u32()?;
        self.entities.clear();
        self.free_head = RESERVED_INDEX;
        for index in 0..entity_count {
            self.entities.push(EntityId::new(index, 0));
        }
        for registration in &mut self.registrations {
            registration.pool = None;
        }

        let set_count = input.read_varint_u32()? as usize;
        for set_index in 0..set_count {
            let set_entity_count = input.read_varint_u32()? as usize;
            if set_entity_count == 0 {
                continue;
            }
            let Some(registration) = self.registrations.get_mut(set_index) else {
                tracing::error!(set_index, "serialized world references an unknown component");
                return Err(WorldError::InvalidComponent);
            };
            let pool = registration.pool.insert((registration.make_pool)());

            for _ in 0..set_entity_count {
                pool.decode_value(&mut *input)?;
            }
            for position in 0..set_entity_count {
                let id = EntityId::from_raw(input.read_varint_u32()?);
                pool.bind_decoded(position, id);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entities.len())
            .field("components", &self.registrations.len())
            .finish()
    }
}
