// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::{Read, Write};
use std::path::PathBuf;
use vane_vpak::{CompressionLevel, EntryType, Reader, VpakError, Writer};

/// A pack file in the temp directory that cleans up after itself.
struct TempPack(PathBuf);

impl TempPack {
    fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "vane-vpak-test-{}-{tag}.vpak",
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

fn read_all(reader: &Reader, name: &str) -> Vec<u8> {
    let mut stream = reader.open_entry(name).unwrap();
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    bytes
}

#[test]
fn named_entries_round_trip() {
    let pack = TempPack::new("named");

    let payloads: Vec<(&str, Vec<u8>)> = vec![
        ("a", vec![0x01]),
        ("bb", vec![0x02, 0x02]),
        ("ccc", vec![0x03, 0x03, 0x03]),
        ("dddd", vec![0x04, 0x04, 0x04, 0x04]),
    ];

    let writer = Writer::create(&pack.0, CompressionLevel::Normal).unwrap();
    for (name, payload) in &payloads {
        let mut stream = writer.add_entry(*name, EntryType::Blob);
        stream.write_all(payload).unwrap();
        stream.finish().unwrap();
    }
    writer.finish().unwrap();

    let reader = Reader::open(&pack.0).unwrap();
    assert_eq!(reader.entries().len(), payloads.len());
    for (name, payload) in &payloads {
        assert!(reader.exists(name));
        let entry = reader.stat(name).unwrap();
        assert_eq!(entry.size, payload.len() as u64);
        assert_eq!(entry.ty, EntryType::Blob);
        assert_eq!(&read_all(&reader, name), payload);
    }
    assert!(!reader.exists("missing"));
    assert!(reader.stat("missing").is_none());
    assert!(matches!(
        reader.open_entry("missing"),
        Err(VpakError::EntryNotFound)
    ));
}

#[test]
fn multi_block_entry_round_trips() {
    let pack = TempPack::new("blocks");

    // Compressible but non-trivial data, several blocks long.
    let mut rng = fastrand::Rng::with_seed(0xda7a);
    let mut payload = Vec::with_capacity(3 * 1024 * 1024);
    while payload.len() < 3 * 1024 * 1024 {
        let run = rng.usize(1..64);
        let byte = rng.u8(..);
        payload.extend(std::iter::repeat_n(byte, run));
    }

    let writer = Writer::create(&pack.0, CompressionLevel::Fast).unwrap();
    let mut stream = writer.add_entry("terrain/heightmap", EntryType::Blob);
    // Feed in awkward chunk sizes to cross block boundaries mid-write.
    for chunk in payload.chunks(70_001) {
        stream.write_all(chunk).unwrap();
    }
    stream.finish().unwrap();
    writer.finish().unwrap();

    let reader = Reader::open(&pack.0).unwrap();
    let entry = reader.stat("terrain/heightmap").unwrap();
    assert_eq!(entry.size, payload.len() as u64);
    assert_eq!(read_all(&reader, "terrain/heightmap"), payload);
}

#[test]
fn empty_entry_round_trips() {
    let pack = TempPack::new("empty");

    let writer = Writer::create(&pack.0, CompressionLevel::Normal).unwrap();
    writer
        .add_entry("markers/spawn", EntryType::Blob)
        .finish()
        .unwrap();
    writer.finish().unwrap();

    let reader = Reader::open(&pack.0).unwrap();
    assert_eq!(reader.stat("markers/spawn").unwrap().size, 0);
    assert_eq!(read_all(&reader, "markers/spawn"), Vec::<u8>::new());
}

#[test]
fn empty_pack_round_trips() {
    let pack = TempPack::new("nothing");
    Writer::create(&pack.0, CompressionLevel::Normal)
        .unwrap()
        .finish()
        .unwrap();

    let reader = Reader::open(&pack.0).unwrap();
    assert!(reader.entries().is_empty());
    assert!(!reader.exists("anything"));
}

#[test]
fn append_preserves_existing_entries() {
    let pack = TempPack::new("append");

    let writer = Writer::create(&pack.0, CompressionLevel::Normal).unwrap();
    let mut stream = writer.add_entry("first", EntryType::Blob);
    stream.write_all(b"first payload").unwrap();
    stream.finish().unwrap();
    writer.finish().unwrap();

    let writer = Writer::append(&pack.0, CompressionLevel::Normal).unwrap();
    let mut stream = writer.add_entry("second", EntryType::Blob);
    stream.write_all(b"second payload").unwrap();
    stream.finish().unwrap();
    writer.finish().unwrap();

    let reader = Reader::open(&pack.0).unwrap();
    assert_eq!(reader.entries().len(), 2);
    assert_eq!(read_all(&reader, "first"), b"first payload");
    assert_eq!(read_all(&reader, "second"), b"second payload");
}

#[test]
fn concurrent_write_streams() {
    let pack = TempPack::new("concurrent");

    let writer = Writer::create(&pack.0, CompressionLevel::Fast).unwrap();
    std::thread::scope(|scope| {
        for worker in 0..4 {
            let writer = &writer;
            scope.spawn(move || {
                for i in 0..8 {
                    let name = format!("chunk/{worker}/{i}");
                    let payload = vec![worker as u8 * 16 + i as u8; 200_000];
                    let mut stream = writer.add_entry(name, EntryType::Blob);
                    stream.write_all(&payload).unwrap();
                    stream.finish().unwrap();
                }
            });
        }
    });
    writer.finish().unwrap();

    let reader = Reader::open(&pack.0).unwrap();
    assert_eq!(reader.entries().len(), 32);
    for worker in 0..4u8 {
        for i in 0..8u8 {
            let name = format!("chunk/{worker}/{i}");
            let expected = vec![worker * 16 + i; 200_000];
            assert_eq!(reader.stat(&name).unwrap().size, 200_000);
            assert_eq!(read_all(&reader, &name), expected);
        }
    }
}

#[test]
fn image_entry_metadata_round_trips() {
    use vane_vpak::{ImageFilter, ImageFormat, ImageHeader, ImageWrapMode};

    let pack = TempPack::new("image");
    let header = ImageHeader {
        format: ImageFormat::Bc7Srgb,
        mag_filter: ImageFilter::Linear,
        min_filter: ImageFilter::LinearMipmapLinear,
        wrap_u: ImageWrapMode::Repeat,
        wrap_v: ImageWrapMode::Repeat,
        width: 256,
        height: 256,
        mip_count: 9,
    };
    let mip_data = vec![0xabu8; 4096];

    let writer = Writer::create(&pack.0, CompressionLevel::Normal).unwrap();
    let mut stream = writer.add_entry("textures/crate", EntryType::Image);
    header.encode(&mut stream).unwrap();
    stream.write_all(&mip_data).unwrap();
    stream.finish().unwrap();
    writer.finish().unwrap();

    let reader = Reader::open(&pack.0).unwrap();
    assert_eq!(reader.stat("textures/crate").unwrap().ty, EntryType::Image);
    let mut stream = reader.open_entry("textures/crate").unwrap();
    assert_eq!(ImageHeader::decode(&mut stream).unwrap(), header);
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, mip_data);
}

#[test]
fn foreign_file_is_rejected() {
    let pack = TempPack::new("foreign");
    std::fs::write(&pack.0, b"GIF89a-definitely-not-a-pack-file").unwrap();
    assert!(matches!(Reader::open(&pack.0), Err(VpakError::BadMagic)));

    let tiny = TempPack::new("tiny");
    std::fs::write(&tiny.0, b"VP").unwrap();
    assert!(matches!(Reader::open(&tiny.0), Err(VpakError::Truncated)));
}

#[test]
fn wrong_version_is_rejected() {
    let pack = TempPack::new("version");
    Writer::create(&pack.0, CompressionLevel::Normal)
        .unwrap()
        .finish()
        .unwrap();

    // Bump the version field (bytes 4..8, big-endian).
    let mut bytes = std::fs::read(&pack.0).unwrap();
    bytes[4..8].copy_from_slice(&2u32.to_be_bytes());
    std::fs::write(&pack.0, &bytes).unwrap();

    assert!(matches!(
        Reader::open(&pack.0),
        Err(VpakError::BadVersion(2))
    ));
}

#[test]
fn compression_levels_produce_identical_payloads() {
    let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();

    for level in [
        CompressionLevel::Fast,
        CompressionLevel::Normal,
        CompressionLevel::Ultra,
    ] {
        let pack = TempPack::new(&format!("level-{level:?}"));
        let writer = Writer::create(&pack.0, level).unwrap();
        let mut stream = writer.add_entry("data", EntryType::Blob);
        stream.write_all(&payload).unwrap();
        stream.finish().unwrap();
        writer.finish().unwrap();

        let reader = Reader::open(&pack.0).unwrap();
        assert_eq!(read_all(&reader, "data"), payload);
    }
}
