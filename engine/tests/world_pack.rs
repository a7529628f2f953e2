// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end: a world serialized into a pack's `World` entry, loaded back
//! by tasklets through the scheduler.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use vane::ecs::{Component, World};
use vane::stream::{ReadExt, StreamError, WriteExt};
use vane::tasklet::{Scheduler, schedule};
use vane::vpak::{CompressionLevel, EntryType, Reader, Writer};

struct TempPack(PathBuf);

impl TempPack {
    fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "vane-engine-test-{}-{tag}.vpak",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        Self(path)
    }
}

impl Drop for TempPack {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[derive(Debug, PartialEq)]
struct Transform {
    x: i32,
    y: i32,
    z: i32,
}

impl Component for Transform {
    fn encode(&self, w: &mut dyn io::Write) -> Result<(), StreamError> {
        w.write_u32_be(self.x.cast_unsigned())?;
        w.write_u32_be(self.y.cast_unsigned())?;
        w.write_u32_be(self.z.cast_unsigned())
    }
    fn decode(r: &mut dyn io::Read) -> Result<Self, StreamError> {
        Ok(Self {
            x: r.read_u32_be()?.cast_signed(),
            y: r.read_u32_be()?.cast_signed(),
            z: r.read_u32_be()?.cast_signed(),
        })
    }
}

#[derive(Debug, PartialEq)]
struct Name(String);

impl Component for Name {
    fn encode(&self, w: &mut dyn io::Write) -> Result<(), StreamError> {
        w.write_string(&self.0)
    }
    fn decode(r: &mut dyn io::Read) -> Result<Self, StreamError> {
        Ok(Self(r.read_string()?))
    }
}

fn register_builtin_components(world: &mut World) {
    // Deterministic registration order; the serialized component indices
    // depend on it.
    world.register::<Transform>();
    world.register::<Name>();
}

#[test]
fn world_entry_round_trips_through_pack() {
    let pack = TempPack::new("world");

    let mut world = World::new();
    register_builtin_components(&mut world);
    let camera = world.create();
    world.emplace(camera, Transform { x: 0, y: 5, z: -10 });
    world.emplace(camera, Name("camera".into()));
    let prop = world.create();
    world.emplace(prop, Transform { x: 3, y: 0, z: 4 });

    let writer = Writer::create(&pack.0, CompressionLevel::Normal).unwrap();
    let mut entry = writer.add_entry("scenes/main", EntryType::World);
    world.serialize(&mut entry).unwrap();
    entry.finish().unwrap();
    writer.finish().unwrap();

    let reader = Reader::open(&pack.0).unwrap();
    assert_eq!(reader.stat("scenes/main").unwrap().ty, EntryType::World);

    let mut stream = reader.open_entry("scenes/main").unwrap();
    let mut restored = World::new();
    register_builtin_components(&mut restored);
    restored.deserialize(&mut stream).unwrap();

    assert_eq!(restored.entity_count(), 2);
    assert_eq!(
        restored.get::<Transform>(camera),
        Some(&Transform { x: 0, y: 5, z: -10 })
    );
    assert_eq!(restored.get::<Name>(camera), Some(&Name("camera".into())));
    assert_eq!(
        restored.get::<Transform>(prop),
        Some(&Transform { x: 3, y: 0, z: 4 })
    );
    assert!(!restored.has::<Name>(prop));
}

#[test]
fn tasklets_load_assets_concurrently() {
    let pack = TempPack::new("assets");

    let writer = Writer::create(&pack.0, CompressionLevel::Fast).unwrap();
    for i in 0..16u8 {
        let mut entry = writer.add_entry(format!("meshes/{i}"), EntryType::Blob);
        io::Write::write_all(&mut entry, &vec![i; 10_000]).unwrap();
        entry.finish().unwrap();
    }
    writer.finish().unwrap();

    let reader = Arc::new(Reader::open(&pack.0).unwrap());

    let total = Scheduler::new().with_workers(4).run(move || {
        let futures: Vec<_> = (0..16u8)
            .map(|i| {
                let reader = reader.clone();
                schedule(move || {
                    let mut stream = reader.open_entry(&format!("meshes/{i}")).unwrap();
                    let mut bytes = Vec::new();
                    io::Read::read_to_end(&mut stream, &mut bytes).unwrap();
                    assert!(bytes.iter().all(|&byte| byte == i));
                    bytes.len()
                })
            })
            .collect();

        futures.iter().map(|future| future.wait()).sum::<usize>()
    });
    assert_eq!(total, 16 * 10_000);
}
