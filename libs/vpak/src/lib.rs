// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! vpak: vane's content archive format.
//!
//! A pack is a block-compressed, name-addressed container: entry payloads
//! are cut into Zstd frames chained through link fields, and entry lookup
//! goes through a minimal perfect hash built over the entry names at
//! finalize time, so `exists`/`stat`/`open_entry` are O(1) after open.
//!
//! Writing is streaming and concurrent: any number of [`WriteStream`]s may
//! be live at once, each compressing into blocks claimed from a shared
//! atomic allocation head. Reading memory-maps the pack and decompresses
//! lazily per block. See `defs` for the on-disk layout.

mod defs;
mod phf;
mod reader;
mod writer;

pub use defs::{
    BLOCK_SIZE, Entry, EntryType, ImageFilter, ImageFormat, ImageHeader, ImageWrapMode, VpakError,
};
pub use phf::PerfectHasher;
pub use reader::{ReadStream, Reader};
pub use writer::{CompressionLevel, WriteStream, Writer};
