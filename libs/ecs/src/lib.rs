// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sparse-set entity/component storage for vane.
//!
//! Entities are generational 32-bit ids; components live in one sparse set
//! per type, registered in a deterministic order that also fixes the
//! indices of the serialized form. Views iterate the smallest pool of a
//! component tuple and skip entities missing from the rest.
//!
//! ```
//! use vane_ecs::{Component, World};
//! use vane_stream::{ReadExt, StreamError, WriteExt};
//!
//! struct Position { x: f32, y: f32 }
//!
//! impl Component for Position {
//!     fn encode(&self, w: &mut dyn std::io::Write) -> Result<(), StreamError> {
//!         w.write_u32_be(self.x.to_bits())?;
//!         w.write_u32_be(self.y.to_bits())
//!     }
//!     fn decode(r: &mut dyn std::io::Read) -> Result<Self, StreamError> {
//!         Ok(Self {
//!             x: f32::from_bits(r.read_u32_be()?),
//!             y: f32::from_bits(r.read_u32_be()?),
//!         })
//!     }
//! }
//!
//! let mut world = World::new();
//! world.register::<Position>();
//! let player = world.create();
//! world.emplace(player, Position { x: 1.0, y: 2.0 });
//! assert!(world.has::<Position>(player));
//! ```

mod entity;
mod sparse_set;
mod view;
mod world;

pub use entity::{EntityId, INDEX_BITS, VERSION_BITS};
pub use sparse_set::SparseSet;
pub use view::{View, ViewSet};
pub use world::{Component, World, WorldError};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use vane_stream::{ReadExt, StreamError, WriteExt};

    #[derive(Debug, PartialEq, Clone)]
    struct Position {
        x: i32,
        y: i32,
    }

    #[derive(Debug, PartialEq, Clone)]
    struct Velocity {
        dx: i32,
        dy: i32,
    }

    #[derive(Debug, PartialEq, Clone)]
    struct Tag(String);

    impl Component for Position {
        fn encode(&self, w: &mut dyn io::Write) -> Result<(), StreamError> {
            w.write_u32_be(self.x.cast_unsigned())?;
            w.write_u32_be(self.y.cast_unsigned())
        }
        fn decode(r: &mut dyn io::Read) -> Result<Self, StreamError> {
            Ok(Self {
                x: r.read_u32_be()?.cast_signed(),
                y: r.read_u32_be()?.cast_signed(),
            })
        }
    }

    impl Component for Velocity {
        fn encode(&self, w: &mut dyn io::Write) -> Result<(), StreamError> {
            w.write_u32_be(self.dx.cast_unsigned())?;
            w.write_u32_be(self.dy.cast_unsigned())
        }
        fn decode(r: &mut dyn io::Read) -> Result<Self, StreamError> {
            Ok(Self {
                dx: r.read_u32_be()?.cast_signed(),
                dy: r.read_u32_be()?.cast_signed(),
            })
        }
    }

    impl Component for Tag {
        fn encode(&self, w: &mut dyn io::Write) -> Result<(), StreamError> {
            w.write_string(&self.0)
        }
        fn decode(r: &mut dyn io::Read) -> Result<Self, StreamError> {
            Ok(Self(r.read_string()?))
        }
    }

    #[test]
    fn entity_recycling_bumps_version() {
        let mut world = World::new();
        let a = world.create();
        world.destroy(a);
        let b = world.create();

        assert_eq!(b.index(), a.index());
        assert_eq!(b.version(), a.version() + 1);
        assert!(!world.is_valid(a));
        assert!(world.is_valid(b));
    }

    #[test]
    fn validity_is_stable_under_unrelated_churn() {
        let mut world = World::new();
        let keeper = world.create();

        for _ in 0..100 {
            let other = world.create();
            world.destroy(other);
        }
        assert!(world.is_valid(keeper));
    }

    #[test]
    fn destroy_removes_components() {
        let mut world = World::new();
        world.register::<Position>();
        let e = world.create();
        world.emplace(e, Position { x: 1, y: 2 });
        world.destroy(e);

        let reborn = world.create();
        assert_eq!(reborn.index(), e.index());
        assert!(!world.has::<Position>(reborn));
        assert!(!world.has::<Position>(e));
    }

    #[test]
    fn get_and_get_mut() {
        let mut world = World::new();
        let e = world.create();
        world.emplace(e, Position { x: 1, y: 2 });

        world.get_mut::<Position>(e).unwrap().x = 10;
        assert_eq!(world.get::<Position>(e), Some(&Position { x: 10, y: 2 }));
        assert_eq!(world.get::<Velocity>(e), None);
    }

    #[test]
    fn view_iterates_intersection() {
        let mut world = World::new();
        let mut both = Vec::new();

        for i in 0..10 {
            let e = world.create();
            world.emplace(e, Position { x: i, y: 0 });
            if i % 2 == 0 {
                world.emplace(e, Velocity { dx: 1, dy: 1 });
                both.push(e);
            }
        }
        // One entity with only a velocity.
        let lonely = world.create();
        world.emplace(lonely, Velocity { dx: 9, dy: 9 });

        let mut seen = Vec::new();
        for (entity, (position, velocity)) in world.view::<(Position, Velocity)>() {
            position.x += velocity.dx;
            seen.push(entity);
        }
        seen.sort();
        both.sort();
        assert_eq!(seen, both);

        // The mutation through the view stuck: x was 2n, now 2n + 1.
        for (n, id) in both.iter().enumerate() {
            let n = i32::try_from(n).unwrap();
            assert_eq!(world.get::<Position>(*id).unwrap().x, 2 * n + 1);
        }
    }

    #[test]
    fn view_over_missing_pool_is_empty() {
        let mut world = World::new();
        let e = world.create();
        world.emplace(e, Position { x: 0, y: 0 });

        assert_eq!(world.view::<(Position, Velocity)>().count(), 0);
    }

    #[test]
    fn serialize_round_trips() {
        let mut world = World::new();
        world.register::<Position>();
        world.register::<Velocity>();
        world.register::<Tag>();

        let a = world.create();
        let b = world.create();
        let c = world.create();
        world.emplace(a, Position { x: 1, y: 2 });
        world.emplace(b, Position { x: 3, y: 4 });
        world.emplace(b, Velocity { dx: 5, dy: 6 });
        world.emplace(c, Tag("boss".into()));

        let mut bytes = Vec::new();
        world.serialize(&mut bytes).unwrap();

        let mut restored = World::new();
        restored.register::<Position>();
        restored.register::<Velocity>();
        restored.register::<Tag>();
        restored.deserialize(&mut bytes.as_slice()).unwrap();

        assert_eq!(restored.entity_count(), 3);
        assert_eq!(restored.get::<Position>(a), Some(&Position { x: 1, y: 2 }));
        assert_eq!(restored.get::<Position>(b), Some(&Position { x: 3, y: 4 }));
        assert_eq!(restored.get::<Velocity>(b), Some(&Velocity { dx: 5, dy: 6 }));
        assert_eq!(restored.get::<Tag>(c), Some(&Tag("boss".into())));
        assert!(!restored.has::<Velocity>(a));
    }

    #[test]
    fn deserialize_unknown_component_fails() {
        let mut world = World::new();
        world.register::<Position>();
        let e = world.create();
        world.emplace(e, Position { x: 1, y: 1 });

        let mut bytes = Vec::new();
        world.serialize(&mut bytes).unwrap();

        // The reader registered nothing, so set index 0 is unknown.
        let mut empty = World::new();
        assert_eq!(
            empty.deserialize(&mut bytes.as_slice()),
            Err(WorldError::InvalidComponent)
        );
    }

    #[test]
    fn deserialize_truncated_data_fails() {
        let mut world = World::new();
        world.register::<Tag>();
        let e = world.create();
        world.emplace(e, Tag("a-rather-long-name".into()));

        let mut bytes = Vec::new();
        world.serialize(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 4);

        let mut restored = World::new();
        restored.register::<Tag>();
        assert!(matches!(
            restored.deserialize(&mut bytes.as_slice()),
            Err(WorldError::Stream(_))
        ));
    }
}
