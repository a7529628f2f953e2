// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::defs::{
    BLOCK_LINK_SIZE, BLOCK_SIZE, Entry, EntryType, HEADER_SIZE, MAGIC, VERSION, VpakError,
};
use crate::phf::PerfectHasher;
use crate::reader::Reader;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;
use vane_stream::WriteExt;

/// How aggressively entry payloads are compressed. Levels only trade
/// throughput against ratio; the format is identical.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionLevel {
    Fast,
    #[default]
    Normal,
    Ultra,
}

impl CompressionLevel {
    fn zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Normal => 3,
            CompressionLevel::Ultra => 19,
        }
    }
}

/// A pack file open for writing.
///
/// Multiple [`WriteStream`]s may be live at once, from different threads:
/// block space is claimed with an atomic fetch-add on the allocation head
/// and all file writes are positioned, so streams never contend on a file
/// cursor. Entries become visible to readers only after [`Writer::finish`]
/// writes the table and header.
pub struct Writer {
    file: File,
    level: CompressionLevel,
    /// Next free byte in the file; blocks are claimed from here.
    head: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl Writer {
    /// Creates a new pack, truncating anything at `path`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the file cannot be created.
    pub fn create(path: impl AsRef<Path>, level: CompressionLevel) -> Result<Self, VpakError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        // Reserve the header; it is written last, by finish().
        file.set_len(HEADER_SIZE)?;
        Ok(Self {
            file,
            level,
            head: AtomicU64::new(HEADER_SIZE),
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Opens an existing pack for appending, or creates it if absent.
    ///
    /// Existing entries are preserved; their blocks stay where they are and
    /// the old entry table is overwritten by newly allocated blocks.
    ///
    /// # Errors
    ///
    /// Returns format errors from reading the existing pack, or the OS
    /// error if the file cannot be opened.
    pub fn append(path: impl AsRef<Path>, level: CompressionLevel) -> Result<Self, VpakError> {
        let path = path.as_ref();
        if !path.exists() {
            return Self::create(path, level);
        }

        let existing = Reader::open(path)?;
        let entries = existing.entries().to_vec();
        // New blocks overwrite the old table; finish() writes a fresh one.
        let head = existing.table_offset();
        drop(existing);

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        tracing::debug!(entries = entries.len(), "appending to existing pack");
        Ok(Self {
            file,
            level,
            head: AtomicU64::new(head),
            entries: Mutex::new(entries),
        })
    }

    /// Claims `size` bytes of file space.
    fn allocate(&self, size: u64) -> u64 {
        self.head.fetch_add(size, Ordering::Relaxed)
    }

    /// Starts a new streaming entry. Finish it with [`WriteStream::finish`]
    /// or its payload is discarded.
    pub fn add_entry(&self, name: impl Into<String>, ty: EntryType) -> WriteStream<'_> {
        WriteStream::new(self, name.into(), ty)
    }

    fn record_entry(&self, entry: Entry) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Builds the perfect hash over all entry names, writes the seed table
    /// and the entry headers in hash slot order, then the pack header.
    /// Returns the total size of the finished pack.
    ///
    /// # Errors
    ///
    /// Returns the OS error if writing fails.
    ///
    /// # Panics
    ///
    /// Panics if two entries share a name.
    pub fn finish(self) -> Result<u64, VpakError> {
        let mut entries = self.entries.into_inner().unwrap();
        let table_offset = self.head.load(Ordering::Acquire);

        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        {
            let mut sorted = names.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), names.len(), "duplicate entry names in pack");
        }

        let phf = PerfectHasher::build(&names);
        entries.sort_by_key(|entry| phf.hash(entry.name.as_bytes()));

        let mut table = Vec::new();
        for &seed in phf.seeds() {
            table.write_u32_be(seed.cast_unsigned())?;
        }
        for entry in &entries {
            entry.encode(&mut table)?;
        }
        self.file.write_all_at(&table, table_offset)?;

        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(&MAGIC);
        header.write_u32_be(VERSION)?;
        header.write_u32_be(0)?; // flags
        header.write_u32_be(u32::try_from(entries.len()).expect("entry count overflow"))?;
        header.write_u64_be(table_offset)?;
        self.file.write_all_at(&header, 0)?;

        self.file.sync_all()?;
        tracing::debug!(
            entries = entries.len(),
            size = table_offset + table.len() as u64,
            "finished pack"
        );
        Ok(table_offset + table.len() as u64)
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("level", &self.level)
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

/// A streaming compressor for one entry.
///
/// Payload bytes accumulate until a block's worth is buffered, which is
/// then compressed into one Zstd frame and appended to the entry's block
/// chain: the frame is written at a freshly allocated offset and the
/// previous block's link field is patched to point at it.
pub struct WriteStream<'w> {
    writer: &'w Writer,
    cctx: zstd_safe::CCtx<'static>,
    name: String,
    ty: EntryType,
    /// Uncompressed bytes waiting for the current block to fill.
    pending: Vec<u8>,
    /// Scratch for the compressed frame.
    frame: Vec<u8>,
    first_block: u64,
    /// File offset of the previous block's link field; zero before the
    /// first block (offset zero is the header, never a link).
    prev_link: u64,
    total_size: u64,
    finished: bool,
}

impl<'w> WriteStream<'w> {
    fn new(writer: &'w Writer, name: String, ty: EntryType) -> Self {
        let mut cctx = zstd_safe::CCtx::create();
        // The context-creation parameters cannot fail for supported levels.
        let _ = cctx.set_parameter(zstd_safe::CParameter::CompressionLevel(
            writer.level.zstd_level(),
        ));
        let _ = cctx.set_parameter(zstd_safe::CParameter::ChecksumFlag(true));

        Self {
            writer,
            cctx,
            name,
            ty,
            pending: Vec::with_capacity(BLOCK_SIZE),
            frame: Vec::new(),
            first_block: 0,
            prev_link: 0,
            total_size: 0,
            finished: false,
        }
    }

    /// Compresses the pending payload into a frame and appends it to the
    /// entry's block chain.
    fn flush_block(&mut self) -> io::Result<()> {
        self.frame.clear();
        self.frame.reserve(zstd_safe::compress_bound(self.pending.len()));
        self.cctx
            .compress2(&mut self.frame, &self.pending)
            .map_err(|code| {
                io::Error::other(format!("zstd: {}", zstd_safe::get_error_name(code)))
            })?;

        let block_len = self.frame.len() as u64 + BLOCK_LINK_SIZE;
        let offset = self.writer.allocate(block_len);

        self.writer.file.write_all_at(&self.frame, offset)?;
        // Terminate the chain here for now; a later block patches it.
        let link_offset = offset + self.frame.len() as u64;
        self.writer
            .file
            .write_all_at(&0u64.to_le_bytes(), link_offset)?;

        if self.prev_link == 0 {
            self.first_block = offset;
        } else {
            self.writer
                .file
                .write_all_at(&offset.to_le_bytes(), self.prev_link)?;
        }
        self.prev_link = link_offset;

        self.total_size += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Flushes the final block and records the entry in the pack.
    ///
    /// # Errors
    ///
    /// Returns the OS or compressor error if the final flush fails.
    pub fn finish(mut self) -> Result<(), VpakError> {
        // Always emit at least one (possibly empty) block so every entry
        // has a valid first_block.
        if !self.pending.is_empty() || self.prev_link == 0 {
            self.flush_block()?;
        }
        self.writer.record_entry(Entry {
            name: core::mem::take(&mut self.name),
            ty: self.ty,
            size: self.total_size,
            first_block: self.first_block,
        });
        self.finished = true;
        Ok(())
    }
}

impl io::Write for WriteStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let space = BLOCK_SIZE - self.pending.len();
            let take = space.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == BLOCK_SIZE {
                self.flush_block()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Deliberately does not cut a block: blocks are the compression
        // unit and flushing partial blocks would hurt the ratio.
        Ok(())
    }
}

impl Drop for WriteStream<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(name = %self.name, "write stream dropped without finish; entry discarded");
        }
    }
}

impl fmt::Debug for WriteStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteStream")
            .field("name", &self.name)
            .field("size", &self.total_size)
            .finish()
    }
}
