// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The vpak on-disk format.
//!
//! ```text
//! struct Pack {
//!     u8  magic[4] = "VPAK";      // header is big-endian
//!     u32 version = 1;
//!     u32 flags = 0;
//!     u32 entry_count;
//!     u64 entry_table_offset;
//!     u8  block_data[];
//!     EntryTable entry_table;
//! };
//!
//! struct EntryTable {
//!     i32 hash_seeds[entry_count]; // big-endian, perfect-hash seed table
//!     EntryHeader entries[entry_count]; // in hash slot order
//! };
//!
//! struct EntryHeader {
//!     EntryType(u8) type;
//!     v64 name_length;             // varints are LEB128
//!     u8  name[name_length];
//!     v64 size;                    // uncompressed size in bytes
//!     v64 first_block;             // absolute offset of the first block
//! };
//!
//! // A block is one complete Zstd frame followed by the absolute offset
//! // of the entry's next block as a little-endian u64, or 0 at the end
//! // of the chain.
//!
//! struct Blob(type: 0) {
//!     u8 data[size];
//! };
//!
//! struct Image(type: 1) {
//!     ImageFormat(u8) format;
//!     ImageFilter(u8) mag_filter;
//!     ImageFilter(u8) min_filter;
//!     ImageWrapMode(u8) wrap_u;
//!     ImageWrapMode(u8) wrap_v;
//!     v32 width;
//!     v32 height;
//!     v32 mip_count;
//!     u8 mip_data[];
//! };
//!
//! // World(type: 2) is produced and consumed by the world serializer.
//! ```
//!
//! Name hashing for the seed table is seeded FNV-1a (see `phf`); both ends
//! of the format use the same function, so it is part of the format.

use core::fmt;
use std::io;
use vane_stream::{ReadExt, StreamError, WriteExt};

pub const MAGIC: [u8; 4] = *b"VPAK";
pub const VERSION: u32 = 1;
/// Size of the fixed header at offset zero.
pub const HEADER_SIZE: u64 = 24;
/// Link field trailing every block's frame.
pub const BLOCK_LINK_SIZE: u64 = 8;
/// Uncompressed payload per block; the frame it compresses into is
/// whatever size it is.
pub const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    Blob = 0,
    Image = 1,
    World = 2,
}

impl TryFrom<u8> for EntryType {
    type Error = StreamError;

    fn try_from(raw: u8) -> Result<Self, StreamError> {
        match raw {
            0 => Ok(Self::Blob),
            1 => Ok(Self::Image),
            2 => Ok(Self::World),
            _ => Err(StreamError::Unknown),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageFormat {
    Bc1Srgb = 0,
    Bc3Srgba = 1,
    Bc5Unorm = 2,
    RgUnorm = 3,
    RgbaUnorm = 4,
    Bc7Srgb = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ImageFilter {
    Nearest = 0,
    #[default]
    Linear = 1,
    NearestMipmapNearest = 2,
    LinearMipmapNearest = 3,
    NearestMipmapLinear = 4,
    LinearMipmapLinear = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ImageWrapMode {
    ClampToEdge = 0,
    MirroredRepeat = 1,
    #[default]
    Repeat = 2,
}

impl TryFrom<u8> for ImageFormat {
    type Error = StreamError;

    fn try_from(raw: u8) -> Result<Self, StreamError> {
        match raw {
            0 => Ok(Self::Bc1Srgb),
            1 => Ok(Self::Bc3Srgba),
            2 => Ok(Self::Bc5Unorm),
            3 => Ok(Self::RgUnorm),
            4 => Ok(Self::RgbaUnorm),
            5 => Ok(Self::Bc7Srgb),
            _ => Err(StreamError::Unknown),
        }
    }
}

impl TryFrom<u8> for ImageFilter {
    type Error = StreamError;

    fn try_from(raw: u8) -> Result<Self, StreamError> {
        match raw {
            0 => Ok(Self::Nearest),
            1 => Ok(Self::Linear),
            2 => Ok(Self::NearestMipmapNearest),
            3 => Ok(Self::LinearMipmapNearest),
            4 => Ok(Self::NearestMipmapLinear),
            5 => Ok(Self::LinearMipmapLinear),
            _ => Err(StreamError::Unknown),
        }
    }
}

impl TryFrom<u8> for ImageWrapMode {
    type Error = StreamError;

    fn try_from(raw: u8) -> Result<Self, StreamError> {
        match raw {
            0 => Ok(Self::ClampToEdge),
            1 => Ok(Self::MirroredRepeat),
            2 => Ok(Self::Repeat),
            _ => Err(StreamError::Unknown),
        }
    }
}

/// The in-memory shape of a pack entry; not the on-disk representation.
#[derive(Clone, Debug)]
pub struct Entry {
    pub name: String,
    pub ty: EntryType,
    /// Uncompressed payload size in bytes.
    pub size: u64,
    /// Absolute file offset of the entry's first block.
    pub first_block: u64,
}

impl Entry {
    pub(crate) fn decode(reader: &mut impl io::Read) -> Result<Self, StreamError> {
        let ty = EntryType::try_from(reader.read_byte()?)?;
        let name = reader.read_string()?;
        let size = reader.read_varint_u64()?;
        let first_block = reader.read_varint_u64()?;
        Ok(Self {
            name,
            ty,
            size,
            first_block,
        })
    }

    pub(crate) fn encode(&self, writer: &mut impl io::Write) -> Result<(), StreamError> {
        writer.write_byte(self.ty as u8)?;
        writer.write_string(&self.name)?;
        writer.write_varint_u64(self.size)?;
        writer.write_varint_u64(self.first_block)
    }
}

/// The fixed metadata prefix of an `Image` entry's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub format: ImageFormat,
    pub mag_filter: ImageFilter,
    pub min_filter: ImageFilter,
    pub wrap_u: ImageWrapMode,
    pub wrap_v: ImageWrapMode,
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
}

impl ImageHeader {
    pub fn decode(reader: &mut impl io::Read) -> Result<Self, StreamError> {
        Ok(Self {
            format: ImageFormat::try_from(reader.read_byte()?)?,
            mag_filter: ImageFilter::try_from(reader.read_byte()?)?,
            min_filter: ImageFilter::try_from(reader.read_byte()?)?,
            wrap_u: ImageWrapMode::try_from(reader.read_byte()?)?,
            wrap_v: ImageWrapMode::try_from(reader.read_byte()?)?,
            width: reader.read_varint_u32()?,
            height: reader.read_varint_u32()?,
            mip_count: reader.read_varint_u32()?,
        })
    }

    pub fn encode(&self, writer: &mut impl io::Write) -> Result<(), StreamError> {
        writer.write_byte(self.format as u8)?;
        writer.write_byte(self.mag_filter as u8)?;
        writer.write_byte(self.min_filter as u8)?;
        writer.write_byte(self.wrap_u as u8)?;
        writer.write_byte(self.wrap_v as u8)?;
        writer.write_varint_u32(self.width)?;
        writer.write_varint_u32(self.height)?;
        writer.write_varint_u32(self.mip_count)
    }
}

/// Errors produced by the pack reader and writer.
#[derive(Debug)]
pub enum VpakError {
    /// The file does not start with the vpak magic.
    BadMagic,
    /// The format version is not understood.
    BadVersion(u32),
    /// `open` was called with a name the pack does not contain.
    EntryNotFound,
    /// A block failed to decompress.
    DecompressionFailed,
    /// The file ended inside a structure.
    Truncated,
    /// Any other underlying I/O failure.
    Io(io::Error),
}

impl fmt::Display for VpakError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpakError::BadMagic => f.write_str("not a vpak file (bad magic)"),
            VpakError::BadVersion(version) => write!(f, "unsupported vpak version {version}"),
            VpakError::EntryNotFound => f.write_str("entry not found"),
            VpakError::DecompressionFailed => f.write_str("block decompression failed"),
            VpakError::Truncated => f.write_str("vpak file is truncated"),
            VpakError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl core::error::Error for VpakError {}

impl From<io::Error> for VpakError {
    fn from(err: io::Error) -> Self {
        VpakError::Io(err)
    }
}

impl From<StreamError> for VpakError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Truncated => VpakError::Truncated,
            _ => VpakError::Io(io::Error::other(err)),
        }
    }
}
