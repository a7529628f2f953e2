// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::defs::{BLOCK_LINK_SIZE, BLOCK_SIZE, Entry, HEADER_SIZE, MAGIC, VERSION, VpakError};
use crate::phf::PerfectHasher;
use core::fmt;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;
use vane_stream::ReadExt;

/// A memory-mapped pack file open for reading.
///
/// The header, seed table and entry headers are parsed once at open;
/// afterwards [`Reader::exists`], [`Reader::stat`] and [`Reader::open`]
/// are constant-time through the perfect hash.
///
/// Readers are immutable after construction and safe to share across
/// threads.
pub struct Reader {
    map: memmap2::Mmap,
    entries: Vec<Entry>,
    phf: PerfectHasher,
    table_offset: u64,
}

impl Reader {
    /// Opens and maps a pack file, validating the header and loading the
    /// entry table.
    ///
    /// # Errors
    ///
    /// Returns `BadMagic`/`BadVersion` for foreign files, `Truncated` for
    /// files that end inside a structure and `Io` for OS failures.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VpakError> {
        let file = File::open(path)?;
        if file.metadata()?.len() < HEADER_SIZE {
            return Err(VpakError::Truncated);
        }
        // Safety: the map is only read through this Reader and writers
        // finalize packs before readers open them (packs are immutable
        // once finished).
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Self::parse(map)
    }

    fn parse(map: memmap2::Mmap) -> Result<Self, VpakError> {
        let data: &[u8] = &map;
        let mut header = data;

        let mut magic = [0u8; 4];
        header.read_exact(&mut magic).map_err(|_| VpakError::Truncated)?;
        if magic != MAGIC {
            return Err(VpakError::BadMagic);
        }
        let version = header.read_u32_be()?;
        if version != VERSION {
            return Err(VpakError::BadVersion(version));
        }
        let _flags = header.read_u32_be()?;
        let entry_count = header.read_u32_be()? as usize;
        let table_offset = header.read_u64_be()?;

        let table_start = usize::try_from(table_offset).map_err(|_| VpakError::Truncated)?;
        if table_start > data.len() {
            return Err(VpakError::Truncated);
        }
        let mut table = &data[table_start..];

        let mut seeds = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            seeds.push(table.read_u32_be()?.cast_signed());
        }
        let phf = PerfectHasher::from_seeds(seeds);

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            entries.push(Entry::decode(&mut table)?);
        }

        tracing::debug!(entries = entries.len(), "opened pack");
        Ok(Self {
            map,
            entries,
            phf,
            table_offset,
        })
    }

    /// Every entry in the pack, in hash slot order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Where the entry table starts; the writer resumes block allocation
    /// here when appending to an existing pack.
    pub(crate) fn table_offset(&self) -> u64 {
        self.table_offset
    }

    fn slot(&self, name: &str) -> Option<&Entry> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[self.phf.hash(name.as_bytes()) as usize];
        (entry.name == name).then_some(entry)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.slot(name).is_some()
    }

    pub fn stat(&self, name: &str) -> Option<&Entry> {
        self.slot(name)
    }

    /// Opens a streaming reader over an entry's uncompressed payload.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` for unknown names.
    pub fn open_entry(&self, name: &str) -> Result<ReadStream<'_>, VpakError> {
        let entry = self.slot(name).ok_or(VpakError::EntryNotFound)?;
        Ok(ReadStream::new(&self.map, entry))
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// A streaming decompressor over one entry's block chain.
///
/// Each fill decompresses from the current Zstd frame; when a frame ends
/// the stream follows the link field to the entry's next block. The
/// consumer sees one contiguous byte stream regardless of how the payload
/// was cut into blocks.
pub struct ReadStream<'p> {
    data: &'p [u8],
    dctx: zstd_safe::DCtx<'static>,
    /// Read position inside the mapped file; sits inside the current frame
    /// (or at its link field once the frame is done).
    position: usize,
    /// Decompressed bytes not yet handed to the caller.
    buffer: Vec<u8>,
    cursor: usize,
    /// Uncompressed bytes the entry still owes the caller.
    remaining: u64,
    frame_done: bool,
}

impl<'p> ReadStream<'p> {
    fn new(data: &'p [u8], entry: &Entry) -> Self {
        Self {
            data,
            dctx: zstd_safe::DCtx::create(),
            position: usize::try_from(entry.first_block).unwrap_or(usize::MAX),
            buffer: Vec::with_capacity(BLOCK_SIZE),
            cursor: 0,
            remaining: entry.size,
            frame_done: false,
        }
    }

    /// Decompresses the next chunk into the internal buffer.
    fn fill(&mut self) -> io::Result<()> {
        self.buffer.clear();
        self.cursor = 0;

        if self.frame_done {
            // The current frame is exhausted; hop to the next block of the
            // chain through the link field.
            let link_end = self
                .position
                .checked_add(BLOCK_LINK_SIZE as usize)
                .filter(|&end| end <= self.data.len())
                .ok_or_else(truncated)?;
            let link = u64::from_le_bytes(
                self.data[self.position..link_end]
                    .try_into()
                    .expect("link field is 8 bytes"),
            );
            if link == 0 {
                return Err(truncated());
            }
            self.position = usize::try_from(link).map_err(|_| truncated())?;
            self.frame_done = false;
        }

        if self.position >= self.data.len() {
            return Err(truncated());
        }

        let mut input = zstd_safe::InBuffer::around(&self.data[self.position..]);
        loop {
            let mut output = zstd_safe::OutBuffer::around(&mut self.buffer);
            let status = self
                .dctx
                .decompress_stream(&mut output, &mut input)
                .map_err(|code| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("zstd: {}", zstd_safe::get_error_name(code)),
                    )
                })?;

            if status == 0 {
                self.frame_done = true;
                break;
            }
            if output.pos() > 0 {
                break;
            }
            if input.pos() >= input.src.len() {
                // Made no progress and no input left: the frame runs off
                // the end of the file.
                return Err(truncated());
            }
        }
        self.position += input.pos();
        Ok(())
    }
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "vpak block chain truncated")
}

impl io::Read for ReadStream<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || out.is_empty() {
            return Ok(0);
        }

        if self.cursor == self.buffer.len() {
            self.fill()?;
            if self.buffer.is_empty() {
                // An empty frame at the end of the chain.
                return if self.remaining == 0 { Ok(0) } else { self.read(out) };
            }
        }

        let available = self.buffer.len() - self.cursor;
        let limit = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let count = out.len().min(available).min(limit);
        out[..count].copy_from_slice(&self.buffer[self.cursor..self.cursor + count]);
        self.cursor += count;
        self.remaining -= count as u64;
        Ok(count)
    }
}

impl fmt::Debug for ReadStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStream")
            .field("remaining", &self.remaining)
            .finish()
    }
}
